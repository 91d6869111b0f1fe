//! Change feed: one watch fanned out to many in-process subscribers, plus a
//! materialized snapshot of the watched scope.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use horizon_core::{Object, ObjectKey, Scope};
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Change, Ctx, Store, StoreConfig, WatchEvent, WatchRequest};

const PUBLISH_EVERY: Duration = Duration::from_millis(8);
const RESTART_BACKOFF: Duration = Duration::from_millis(50);

/// Bounded memory of recently seen (key, revision) pairs.
pub struct Dedup {
    seen: FxHashSet<(ObjectKey, u64)>,
    order: VecDeque<(ObjectKey, u64)>,
    cap: usize,
}

impl Dedup {
    pub fn with_capacity(cap: usize) -> Self {
        Self { seen: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }

    /// Record a pair; `false` if it was already seen within the window.
    pub fn insert(&mut self, key: &ObjectKey, revision: u64) -> bool {
        let id = (key.clone(), revision);
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.clone());
        self.seen.insert(id);
        true
    }
}

/// Materialized view of a scope at `revision`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Highest revision applied.
    pub revision: u64,
    pub objects: BTreeMap<ObjectKey, Object>,
}

impl Snapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&Object> { self.objects.get(key) }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
}

#[derive(Default)]
pub struct SnapshotBuilder {
    revision: u64,
    objects: BTreeMap<ObjectKey, Object>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    /// Apply one event; stale puts (older than what is held) are ignored.
    /// Returns whether the view changed.
    pub fn apply(&mut self, ev: &WatchEvent) -> bool {
        self.revision = self.revision.max(ev.revision);
        match &ev.change {
            Change::Put(obj) => {
                let held = self.objects.get(&ev.key).and_then(|o| o.revision()).unwrap_or(0);
                if held >= ev.revision {
                    return false;
                }
                self.objects.insert(ev.key.clone(), obj.clone());
                true
            }
            Change::Delete => self.objects.remove(&ev.key).is_some(),
        }
    }

    /// Mark everything up to `revision` as covered, e.g. once a snapshot
    /// whose objects are all older than its head has been read.
    pub fn advance(&mut self, revision: u64) {
        self.revision = self.revision.max(revision);
    }

    pub fn revision(&self) -> u64 { self.revision }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot { revision: self.revision, objects: self.objects.clone() })
    }
}

/// Owner of a running change feed. Dropping it stops the background task.
pub struct FeedHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    rev_rx: watch::Receiver<u64>,
    events: broadcast::Sender<WatchEvent>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }

    /// Live events from now on. Slow receivers observe `Lagged` and should
    /// fall back to [`FeedHandle::current`].
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> { self.events.subscribe() }

    pub fn subscribe_revision(&self) -> watch::Receiver<u64> { self.rev_rx.clone() }

    /// Wait until the published snapshot covers `revision`. Returns `false`
    /// if the feed stopped first.
    pub async fn wait_for(&self, revision: u64) -> bool {
        let mut rx = self.rev_rx.clone();
        loop {
            if *rx.borrow_and_update() >= revision {
                return true;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow() >= revision;
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn publish(builder: &SnapshotBuilder, snap: &ArcSwap<Snapshot>, rev_tx: &watch::Sender<u64>) {
    let next = builder.freeze();
    let revision = next.revision;
    snap.store(next);
    let _ = rev_tx.send(revision);
}

/// Start a change feed over `scope`. The watch is restarted from its resume
/// token whenever it fails or ends; a snapshot cut short is read again from
/// scratch, and nothing is published until a snapshot is complete.
pub fn spawn_feed(store: Store, scope: Scope, cfg: &StoreConfig) -> FeedHandle {
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (rev_tx, rev_rx) = watch::channel(0u64);
    let (events, _) = broadcast::channel::<WatchEvent>(cfg.watch_buffer.max(1));
    let token = CancellationToken::new();

    let snap_task = Arc::clone(&snap);
    let events_task = events.clone();
    let stop = token.clone();
    let window = cfg.feed_dedup_window;

    let task = tokio::spawn(async move {
        let mut dedup = Dedup::with_capacity(window);
        let mut builder = SnapshotBuilder::new();
        let mut dirty = false;
        let mut settled = false;
        let mut from: Option<u64> = None;
        let mut ticker = tokio::time::interval(PUBLISH_EVERY);
        info!(scope = ?scope, "change feed started");

        'feed: loop {
            if from.is_none() {
                // A fresh snapshot replaces whatever an earlier, partial one left.
                builder = SnapshotBuilder::new();
                dirty = false;
            }
            let ctx = Ctx::with_token(stop.child_token());
            let mut watcher = match store.watch(&ctx, WatchRequest { scope: scope.clone(), from }).await {
                Ok(w) => w,
                Err(e) => {
                    if stop.is_cancelled() {
                        break 'feed;
                    }
                    warn!(error = %e, from = ?from, "change feed: watch failed; retrying");
                    counter!("feed_restarts_total", 1u64);
                    tokio::select! {
                        _ = stop.cancelled() => break 'feed,
                        _ = tokio::time::sleep(RESTART_BACKOFF) => continue 'feed,
                    }
                }
            };
            settled = !watcher.in_snapshot();

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break 'feed,
                    item = watcher.next() => match item {
                        Some(Ok(ev)) => {
                            dirty |= builder.apply(&ev);
                            settled = !watcher.in_snapshot();
                            if !dedup.insert(&ev.key, ev.revision) {
                                counter!("feed_duplicates_total", 1u64);
                                continue;
                            }
                            counter!("feed_events_total", 1u64);
                            // No subscribers is fine.
                            let _ = events_task.send(ev);
                        }
                        Some(Err(e)) => {
                            if stop.is_cancelled() {
                                break 'feed;
                            }
                            warn!(error = %e, resume = ?watcher.resume_from(), "change feed: watch error; restarting");
                            break;
                        }
                        None => {
                            debug!(resume = ?watcher.resume_from(), "change feed: watch ended; restarting");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !settled {
                            continue;
                        }
                        if let Some(next) = watcher.resume_from() {
                            builder.advance(next.saturating_sub(1));
                        }
                        if dirty || *rev_tx.borrow() < builder.revision() {
                            publish(&builder, &snap_task, &rev_tx);
                            dirty = false;
                        }
                    }
                }
            }

            from = watcher.resume_from();
            counter!("feed_restarts_total", 1u64);
            if dirty && settled {
                publish(&builder, &snap_task, &rev_tx);
                dirty = false;
            }
            tokio::select! {
                _ = stop.cancelled() => break 'feed,
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
            }
        }

        if dirty && settled {
            publish(&builder, &snap_task, &rev_tx);
        }
        info!(revision = builder.revision(), "change feed stopped");
    });

    FeedHandle { snap, rev_rx, events, token, task: Some(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_core::ObjectMeta;

    fn put(name: &str, rev: u64) -> WatchEvent {
        let key = ObjectKey::new("Widget", "dev", name);
        let mut obj = Object {
            kind: "Widget".into(),
            metadata: ObjectMeta { name: name.into(), namespace: "dev".into(), ..Default::default() },
            fields: Default::default(),
        };
        obj.metadata.revision = Some(rev);
        WatchEvent { key, revision: rev, change: Change::Put(obj) }
    }

    #[test]
    fn dedup_window_is_bounded() {
        let mut d = Dedup::with_capacity(2);
        let k = ObjectKey::new("W", "a", "b");
        assert!(d.insert(&k, 1));
        assert!(!d.insert(&k, 1));
        assert!(d.insert(&k, 2));
        assert!(d.insert(&k, 3));
        assert_eq!(d.len(), 2);
        // Evicted, so it is accepted again.
        assert!(d.insert(&k, 1));
    }

    #[test]
    fn builder_ignores_stale_puts() {
        let mut b = SnapshotBuilder::new();
        assert!(b.apply(&put("a", 3)));
        assert!(!b.apply(&put("a", 2)));
        assert!(b.apply(&put("b", 4)));
        let del = WatchEvent { key: ObjectKey::new("Widget", "dev", "a"), revision: 5, change: Change::Delete };
        assert!(b.apply(&del));
        let snap = b.freeze();
        assert_eq!(snap.revision, 5);
        assert_eq!(snap.objects.keys().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        b.advance(3);
        assert_eq!(b.revision(), 5);
        b.advance(9);
        assert_eq!(b.freeze().revision, 9);
    }
}
