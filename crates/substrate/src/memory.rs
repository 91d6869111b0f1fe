//! In-memory substrate with a full change journal and fault injection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{tail, validate_key, Entry, Journal, Operation, Substrate, SubstrateError, Subscription};

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Get,
    Create,
    Update,
    Delete,
    List,
    Watch,
}

#[derive(Default)]
struct State {
    current: BTreeMap<String, Entry>,
    journal: Vec<Entry>,
    seq: u64,
}

struct Inner {
    state: Mutex<State>,
    faults: Mutex<FxHashMap<FaultOp, u32>>,
    tx: broadcast::Sender<Entry>,
}

/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self { Self::new() }
}

impl MemoryKv {
    pub fn new() -> Self { Self::with_capacity(1024) }

    /// `cap` bounds the live broadcast buffer; slower subscribers re-read the
    /// journal instead of losing changes.
    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap.max(1));
        Self { inner: Arc::new(Inner { state: Mutex::new(State::default()), faults: Mutex::new(FxHashMap::default()), tx }) }
    }

    /// Make the next `times` calls of `op` fail with a backend error.
    pub fn fail_next(&self, op: FaultOp, times: u32) {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(op, times);
    }

    /// Live subscriptions currently held open.
    pub fn watchers(&self) -> usize { self.inner.tx.receiver_count() }

    /// Highest revision handed out so far.
    pub fn head(&self) -> u64 { self.inner.state().seq }

    fn fault(&self, op: FaultOp) -> Result<(), SubstrateError> {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                warn!(?op, "injected substrate fault");
                Err(SubstrateError::Backend(format!("injected {:?} fault", op)))
            }
            _ => Ok(()),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the journal and publish. Caller holds the state lock so the
    /// broadcast order matches revision order.
    fn commit(&self, st: &mut State, key: &str, value: Option<Vec<u8>>) -> u64 {
        st.seq += 1;
        let rev = st.seq;
        let entry = match value {
            Some(v) => Entry::put(key, v, rev),
            None => Entry::tombstone(key, rev),
        };
        match entry.operation {
            Operation::Put => { st.current.insert(key.to_string(), entry.clone()); }
            Operation::Delete => { st.current.remove(key); }
        }
        st.journal.push(entry.clone());
        let _ = self.tx.send(entry);
        rev
    }
}

#[async_trait::async_trait]
impl Journal for Inner {
    async fn since(&self, prefix: &str, after: u64) -> Result<Vec<Entry>, SubstrateError> {
        let st = self.state();
        let start = st.journal.partition_point(|e| e.revision <= after);
        Ok(st.journal[start..].iter().filter(|e| e.key.starts_with(prefix)).cloned().collect())
    }
}

#[async_trait::async_trait]
impl Substrate for MemoryKv {
    async fn get(&self, key: &str) -> Result<Entry, SubstrateError> {
        self.fault(FaultOp::Get)?;
        self.inner.state().current.get(key).cloned().ok_or(SubstrateError::KeyNotFound)
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, SubstrateError> {
        self.fault(FaultOp::Create)?;
        validate_key(key)?;
        let mut st = self.inner.state();
        if st.current.contains_key(key) {
            return Err(SubstrateError::KeyExists);
        }
        let rev = self.inner.commit(&mut st, key, Some(value));
        debug!(key, rev, "kv create");
        Ok(rev)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<u64>) -> Result<u64, SubstrateError> {
        self.fault(FaultOp::Update)?;
        validate_key(key)?;
        let mut st = self.inner.state();
        let current = st.current.get(key).map(|e| e.revision).ok_or(SubstrateError::KeyNotFound)?;
        if let Some(expected) = expected {
            if expected != current {
                return Err(SubstrateError::WrongLastRevision { expected, current });
            }
        }
        let rev = self.inner.commit(&mut st, key, Some(value));
        debug!(key, rev, "kv update");
        Ok(rev)
    }

    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<(), SubstrateError> {
        self.fault(FaultOp::Delete)?;
        validate_key(key)?;
        let mut st = self.inner.state();
        let current = st.current.get(key).map(|e| e.revision).ok_or(SubstrateError::KeyNotFound)?;
        if let Some(expected) = expected {
            if expected != current {
                return Err(SubstrateError::WrongLastRevision { expected, current });
            }
        }
        let rev = self.inner.commit(&mut st, key, None);
        debug!(key, rev, "kv delete");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, SubstrateError> {
        self.fault(FaultOp::List)?;
        let st = self.inner.state();
        Ok(st.current.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(_, e)| e.clone()).collect())
    }

    async fn watch(&self, prefix: &str, from: Option<u64>) -> Result<Subscription, SubstrateError> {
        self.fault(FaultOp::Watch)?;
        let (backlog, cursor, rx) = {
            let st = self.inner.state();
            let rx = self.inner.tx.subscribe();
            match from {
                None => {
                    let snap: Vec<Entry> = st.current.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(_, e)| e.clone()).collect();
                    (snap, st.seq, rx)
                }
                Some(from) => {
                    let after = from.saturating_sub(1);
                    let start = st.journal.partition_point(|e| e.revision <= after);
                    let replay: Vec<Entry> = st.journal[start..].iter().filter(|e| e.key.starts_with(prefix)).cloned().collect();
                    (replay, st.seq.max(after), rx)
                }
            }
        };
        debug!(prefix, ?from, backlog = backlog.len(), cursor, "kv watch");
        let journal: Arc<dyn Journal> = self.inner.clone();
        Ok(tail(journal, prefix, backlog, cursor, rx))
    }
}
