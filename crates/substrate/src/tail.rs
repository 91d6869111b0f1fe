//! Shared subscription engine: backlog first, then live broadcast, with
//! journal re-reads when the broadcast receiver falls behind.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::{Entry, SubstrateError, Subscription};

/// Ordered change history a substrate can re-read from.
#[async_trait::async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Changes under `prefix` with revision strictly greater than `after`,
    /// oldest first.
    async fn since(&self, prefix: &str, after: u64) -> Result<Vec<Entry>, SubstrateError>;
}

struct Tail {
    journal: Arc<dyn Journal>,
    prefix: String,
    pending: VecDeque<Entry>,
    cursor: u64,
    rx: broadcast::Receiver<Entry>,
    done: bool,
}

impl Tail {
    async fn next(&mut self) -> Option<Result<Entry, SubstrateError>> {
        if self.done {
            return None;
        }
        loop {
            if let Some(e) = self.pending.pop_front() {
                self.cursor = self.cursor.max(e.revision);
                return Some(Ok(e));
            }
            match self.rx.recv().await {
                Ok(e) => {
                    if e.revision <= self.cursor || !e.key.starts_with(&self.prefix) {
                        continue;
                    }
                    self.cursor = e.revision;
                    return Some(Ok(e));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, cursor = self.cursor, "subscriber lagged; re-reading journal");
                    match self.journal.since(&self.prefix, self.cursor).await {
                        Ok(entries) => self.pending.extend(entries),
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    debug!(prefix = %self.prefix, "substrate closed; ending subscription");
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Build a subscription stream.
///
/// `backlog` is delivered as-is; afterwards only entries newer than
/// `cursor` (and newer than anything already delivered) pass. The receiver must
/// have been subscribed before `backlog` was read so no change is missed.
/// `cursor` is reported as the subscription head.
pub fn tail(
    journal: Arc<dyn Journal>,
    prefix: impl Into<String>,
    backlog: Vec<Entry>,
    cursor: u64,
    rx: broadcast::Receiver<Entry>,
) -> Subscription {
    let len = backlog.len();
    let st = Tail { journal, prefix: prefix.into(), pending: backlog.into(), cursor, rx, done: false };
    let stream = Box::pin(futures::stream::unfold(st, |mut st| async move {
        let item = st.next().await?;
        Some((item, st))
    }));
    Subscription::new(stream, cursor, len)
}
