//! Object-level change streams over substrate subscriptions.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use horizon_core::{HzError, HzResult, Object, ObjectKey, Scope, Status};
use horizon_substrate::{Entry, Operation, Subscription};
use tracing::debug;

use crate::{codec, observe, Ctx, Store};

#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub scope: Scope,
    /// Replay from this revision (inclusive). `None` starts with a snapshot of
    /// the current objects in scope.
    pub from: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Put(Object),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: ObjectKey,
    pub revision: u64,
    pub change: Change,
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Object> {
        match &self.change {
            Change::Put(o) => Some(o),
            Change::Delete => None,
        }
    }

    pub fn is_delete(&self) -> bool { matches!(self.change, Change::Delete) }

    fn from_entry(entry: &Entry) -> HzResult<Self> {
        let key = ObjectKey::from_key(&entry.key)
            .map_err(|e| HzError::wrap(e, Status::Internal, "decoding watch event"))?;
        let change = match entry.operation {
            Operation::Put => Change::Put(codec::decode(entry)?),
            Operation::Delete => Change::Delete,
        };
        Ok(Self { key, revision: entry.revision, change })
    }
}

type Done = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Stream of [`WatchEvent`]s. Ends after the context is cancelled (yielding
/// one `Cancelled` error) or when the substrate closes. Dropping it releases
/// the substrate subscription.
pub struct Watcher {
    scope: Scope,
    inner: Option<Subscription>,
    done: Done,
    from: Option<u64>,
    head: u64,
    backlog: usize,
    delivered: usize,
    last: Option<u64>,
}

impl Watcher {
    fn new(ctx: &Ctx, scope: Scope, from: Option<u64>, inner: Subscription) -> Self {
        let token = ctx.token().clone();
        let deadline = ctx.deadline();
        let done: Done = Box::pin(async move {
            match deadline {
                Some(d) => tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(d) => {}
                },
                None => token.cancelled().await,
            }
        });
        let (head, backlog) = (inner.head, inner.backlog);
        Self { scope, inner: Some(inner), done, from, head, backlog, delivered: 0, last: None }
    }

    pub fn scope(&self) -> &Scope { &self.scope }

    /// Highest revision delivered so far.
    pub fn last_revision(&self) -> Option<u64> { self.last }

    /// Still delivering the key-ordered snapshot of a `from: None` watch.
    pub fn in_snapshot(&self) -> bool {
        self.from.is_none() && self.delivered < self.backlog
    }

    /// Token to pass as `WatchRequest::from` to continue after this watcher.
    ///
    /// A snapshot arrives in key order, so until all of it has been
    /// delivered the only safe restart is another snapshot (`None`). After
    /// that the token moves past the subscription head.
    pub fn resume_from(&self) -> Option<u64> {
        if self.delivered >= self.backlog {
            return Some(self.last.unwrap_or(0).max(self.head) + 1);
        }
        let from = self.from?;
        Some(self.last.map_or(from, |r| r + 1))
    }
}

impl Stream for Watcher {
    type Item = HzResult<WatchEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if this.done.as_mut().poll(cx).is_ready() {
            this.inner = None;
            return Poll::Ready(Some(Err(HzError::cancelled("watch: context cancelled"))));
        }
        let polled = match this.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        };
        match polled {
            Poll::Ready(Some(Ok(entry))) => {
                this.delivered += 1;
                this.last = Some(this.last.map_or(entry.revision, |l| l.max(entry.revision)));
                Poll::Ready(Some(WatchEvent::from_entry(&entry)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.inner = None;
                Poll::Ready(Some(Err(HzError::wrap(e, Status::Internal, "watching objects"))))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Store {
    pub async fn watch(&self, ctx: &Ctx, req: WatchRequest) -> HzResult<Watcher> {
        let started = Instant::now();
        let res = async {
            let prefix = req
                .scope
                .prefix()
                .map_err(|e| HzError::wrap(e, Status::BadRequest, "invalid scope"))?;
            let sub = ctx
                .run("watch", &prefix, self.kv.watch(&prefix, req.from))
                .await?
                .map_err(|e| crate::classify(e, "watching objects", &prefix))?;
            debug!(prefix = %prefix, from = ?req.from, head = sub.head, backlog = sub.backlog, "watch started");
            HzResult::Ok(Watcher::new(ctx, req.scope, req.from, sub))
        }
        .await;
        observe("watch", started, &res);
        res
    }
}
