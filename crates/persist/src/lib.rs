//! Horizon persistence: a SQLite-backed substrate.
//!
//! Two tables: `kv` holds the current record per key, `journal` is the
//! append-only change history whose AUTOINCREMENT row id is the revision.
//! Every write is one IMMEDIATE transaction; live subscribers are notified
//! after commit while the connection lock is still held, so notification
//! order equals revision order.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use horizon_substrate::{tail, validate_key, Entry, Journal, Substrate, SubstrateError, Subscription};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::broadcast;
use tracing::debug;

const OP_PUT: i64 = 0;
const OP_DELETE: i64 = 1;

struct Inner {
    db: Mutex<Connection>,
    tx: broadcast::Sender<Entry>,
}

/// SQLite substrate. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SqliteKv {
    inner: Arc<Inner>,
}

fn backend(e: rusqlite::Error) -> SubstrateError {
    SubstrateError::Backend(e.to_string())
}

impl SqliteKv {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("HZ_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        Self::init(db)
    }

    /// Private, non-durable database; handy for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory sqlite db")?)
    }

    fn init(db: Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.execute(
            "CREATE TABLE IF NOT EXISTS journal (
                rev   INTEGER PRIMARY KEY AUTOINCREMENT,
                key   TEXT NOT NULL,
                value BLOB,
                op    INTEGER NOT NULL
            )",
            [],
        ).context("creating journal table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                rev   INTEGER NOT NULL
            )",
            [],
        ).context("creating kv table")?;
        let cap = std::env::var("HZ_WATCH_BUFFER").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1024);
        let (tx, _) = broadcast::channel(cap.max(1));
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { inner: Arc::new(Inner { db: Mutex::new(db), tx }) })
    }

    /// Live subscriptions currently held open.
    pub fn watchers(&self) -> usize { self.inner.tx.receiver_count() }

    /// Run `f` on the blocking pool with the connection locked.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, SubstrateError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner, &mut Connection) -> Result<T, SubstrateError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let started = std::time::Instant::now();
        let out = tokio::task::spawn_blocking(move || {
            let mut db = inner.lock();
            f(&inner, &mut db)
        })
        .await
        .map_err(|e| SubstrateError::Backend(format!("{} task failed: {}", op, e)))?;
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        out
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, entry: Entry) {
        counter!("persist_write_total", 1u64);
        let _ = self.tx.send(entry);
    }
}

fn current_rev(db: &Connection, key: &str) -> Result<Option<u64>, SubstrateError> {
    db.query_row("SELECT rev FROM kv WHERE key = ?1", [key], |r| r.get::<_, i64>(0))
        .optional()
        .map(|r| r.map(|v| v as u64))
        .map_err(backend)
}

/// Append to the journal and mirror into `kv`; returns the new revision.
fn append(db: &Connection, key: &str, value: Option<&[u8]>) -> Result<u64, SubstrateError> {
    let op = if value.is_some() { OP_PUT } else { OP_DELETE };
    db.execute("INSERT INTO journal(key, value, op) VALUES (?1, ?2, ?3)", params![key, value, op]).map_err(backend)?;
    let rev = db.last_insert_rowid();
    match value {
        Some(v) => db.execute(
            "INSERT INTO kv(key, value, rev) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, rev = excluded.rev",
            params![key, v, rev],
        ),
        None => db.execute("DELETE FROM kv WHERE key = ?1", [key]),
    }
    .map_err(backend)?;
    Ok(rev as u64)
}

fn write(
    inner: &Inner,
    db: &mut Connection,
    key: String,
    value: Option<Vec<u8>>,
    check: impl FnOnce(Option<u64>) -> Result<(), SubstrateError>,
) -> Result<u64, SubstrateError> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate).map_err(backend)?;
    check(current_rev(&tx, &key)?)?;
    let stored = value.as_deref().map(maybe_compress);
    let rev = append(&tx, &key, stored.as_deref())?;
    tx.commit().map_err(backend)?;
    inner.publish(match value {
        Some(v) => Entry::put(key, v, rev),
        None => Entry::tombstone(key, rev),
    });
    Ok(rev)
}

fn expect_rev(expected: Option<u64>) -> impl FnOnce(Option<u64>) -> Result<(), SubstrateError> {
    move |cur| {
        let current = cur.ok_or(SubstrateError::KeyNotFound)?;
        match expected {
            Some(expected) if expected != current => Err(SubstrateError::WrongLastRevision { expected, current }),
            _ => Ok(()),
        }
    }
}

fn row_entry(key: String, value: Option<Vec<u8>>, rev: i64, op: i64) -> Entry {
    match (op, value) {
        (OP_PUT, Some(v)) => Entry::put(key, maybe_decompress(&v), rev as u64),
        _ => Entry::tombstone(key, rev as u64),
    }
}

fn scan_current(db: &Connection, prefix: &str) -> Result<Vec<Entry>, SubstrateError> {
    let mut stmt = db
        .prepare("SELECT key, value, rev FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![prefix, prefix.len() as i64], |r| Ok(row_entry(r.get(0)?, r.get(1)?, r.get(2)?, OP_PUT)))
        .map_err(backend)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(backend)
}

fn scan_journal(db: &Connection, prefix: &str, after: u64) -> Result<Vec<Entry>, SubstrateError> {
    let mut stmt = db
        .prepare("SELECT key, value, rev, op FROM journal WHERE rev > ?1 AND substr(key, 1, ?3) = ?2 ORDER BY rev")
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![after as i64, prefix, prefix.len() as i64], |r| Ok(row_entry(r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .map_err(backend)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(backend)
}

fn head(db: &Connection) -> Result<u64, SubstrateError> {
    db.query_row("SELECT COALESCE(MAX(rev), 0) FROM journal", [], |r| r.get::<_, i64>(0))
        .map(|v| v as u64)
        .map_err(backend)
}

struct SqliteJournal(Arc<Inner>);

#[async_trait::async_trait]
impl Journal for SqliteJournal {
    async fn since(&self, prefix: &str, after: u64) -> Result<Vec<Entry>, SubstrateError> {
        let inner = Arc::clone(&self.0);
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || scan_journal(&inner.lock(), &prefix, after))
            .await
            .map_err(|e| SubstrateError::Backend(format!("journal task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl Substrate for SqliteKv {
    async fn get(&self, key: &str) -> Result<Entry, SubstrateError> {
        let key = key.to_string();
        self.run("get", move |_, db| {
            let row = db
                .query_row("SELECT value, rev FROM kv WHERE key = ?1", [&key], |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, i64>(1)?)))
                .optional()
                .map_err(backend)?;
            let (value, rev) = row.ok_or(SubstrateError::KeyNotFound)?;
            Ok(Entry::put(key, maybe_decompress(&value), rev as u64))
        })
        .await
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, SubstrateError> {
        validate_key(key)?;
        let key = key.to_string();
        let rev = self
            .run("create", move |inner, db| {
                write(inner, db, key, Some(value), |cur| match cur {
                    Some(_) => Err(SubstrateError::KeyExists),
                    None => Ok(()),
                })
            })
            .await?;
        debug!(rev, "sqlite create");
        Ok(rev)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<u64>) -> Result<u64, SubstrateError> {
        validate_key(key)?;
        let key = key.to_string();
        let rev = self.run("update", move |inner, db| write(inner, db, key, Some(value), expect_rev(expected))).await?;
        debug!(rev, "sqlite update");
        Ok(rev)
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<(), SubstrateError> {
        validate_key(key)?;
        let key = key.to_string();
        let rev = self.run("delete", move |inner, db| write(inner, db, key, None, expect_rev(expected))).await?;
        debug!(rev, "sqlite delete");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, SubstrateError> {
        let prefix = prefix.to_string();
        self.run("list", move |_, db| scan_current(db, &prefix)).await
    }

    async fn watch(&self, prefix: &str, from: Option<u64>) -> Result<Subscription, SubstrateError> {
        let owned = prefix.to_string();
        let (backlog, cursor, rx) = self
            .run("watch", move |inner, db| {
                // Subscribe under the connection lock: no commit can slip
                // between the backlog read and the live receiver.
                let rx = inner.tx.subscribe();
                match from {
                    None => Ok((scan_current(db, &owned)?, head(db)?, rx)),
                    Some(from) => {
                        let after = from.saturating_sub(1);
                        Ok((scan_journal(db, &owned, after)?, head(db)?.max(after), rx))
                    }
                }
            })
            .await?;
        debug!(prefix, ?from, backlog = backlog.len(), cursor, "sqlite watch");
        let journal: Arc<dyn Journal> = Arc::new(SqliteJournal(Arc::clone(&self.inner)));
        Ok(tail(journal, prefix, backlog, cursor, rx))
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".horizon");
        let _ = std::fs::create_dir_all(&p);
        p.push("horizon.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "horizon.db".to_string()
}

pub fn maybe_compress(value: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("HZ_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(value, lvl).unwrap_or_else(|_| value.to_vec());
    }
    value.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use horizon_substrate::Operation;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("horizon-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn create_update_delete_with_revisions() {
        let kv = SqliteKv::open(&temp_db()).unwrap();
        let r1 = kv.create("A.ns.x", b"one".to_vec()).await.unwrap();
        assert_eq!(kv.create("A.ns.x", b"two".to_vec()).await, Err(SubstrateError::KeyExists));
        let r2 = kv.update("A.ns.x", b"two".to_vec(), Some(r1)).await.unwrap();
        assert!(r2 > r1);
        assert_eq!(
            kv.update("A.ns.x", b"three".to_vec(), Some(r1)).await,
            Err(SubstrateError::WrongLastRevision { expected: r1, current: r2 })
        );
        let e = kv.get("A.ns.x").await.unwrap();
        assert_eq!((e.value.as_deref(), e.revision), (Some(&b"two"[..]), r2));
        kv.delete("A.ns.x", Some(r2)).await.unwrap();
        assert_eq!(kv.get("A.ns.x").await, Err(SubstrateError::KeyNotFound));
        assert_eq!(kv.update("A.ns.x", vec![], None).await, Err(SubstrateError::KeyNotFound));
    }

    #[tokio::test]
    async fn state_and_revisions_survive_reopen() {
        let path = temp_db();
        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.create("A.ns.x", b"1".to_vec()).await.unwrap();
            kv.create("A.ns.y", b"1".to_vec()).await.unwrap();
            kv.delete("A.ns.y", None).await.unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get("A.ns.x").await.unwrap().revision, 1);
        // AUTOINCREMENT never hands out a revision twice.
        assert_eq!(kv.create("A.ns.y", b"2".to_vec()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn list_prefix_is_literal() {
        let kv = SqliteKv::open_in_memory().unwrap();
        for k in ["A_x.ns.a", "AXx.ns.b", "A_x.ns.c"] {
            kv.create(k, vec![]).await.unwrap();
        }
        let keys: Vec<String> = kv.list("A_x.").await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["A_x.ns.a", "A_x.ns.c"]);
    }

    #[tokio::test]
    async fn watch_replays_journal_then_follows() {
        let kv = SqliteKv::open_in_memory().unwrap();
        let r1 = kv.create("A.ns.a", b"1".to_vec()).await.unwrap();
        kv.delete("A.ns.a", Some(r1)).await.unwrap();
        let mut s = kv.watch("A.", Some(1)).await.unwrap();
        let e1 = s.next().await.unwrap().unwrap();
        let e2 = s.next().await.unwrap().unwrap();
        assert_eq!((e1.revision, e1.operation), (1, Operation::Put));
        assert_eq!((e2.revision, e2.operation), (2, Operation::Delete));
        kv.create("A.ns.a", b"2".to_vec()).await.unwrap();
        let e3 = tokio::time::timeout(std::time::Duration::from_secs(2), s.next()).await.unwrap().unwrap().unwrap();
        assert_eq!((e3.revision, e3.value), (3, Some(b"2".to_vec())));
        assert_eq!(kv.watchers(), 1);
        drop(s);
        assert_eq!(kv.watchers(), 0);
    }

    #[test]
    fn compress_round_trip() {
        let v = br#"{"kind":"A"}"#;
        assert_eq!(maybe_decompress(&maybe_compress(v)), v.to_vec());
    }
}
