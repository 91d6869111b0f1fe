//! Horizon substrate: the replicated KV contract the object store is built on.
//!
//! A substrate stores raw bytes per key, assigns every write a revision from a
//! single strictly increasing sequence, offers create-if-absent and
//! compare-and-swap, and publishes every change on a subscription stream.

#![forbid(unsafe_code)]

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

mod memory;
mod tail;

pub use memory::{FaultOp, MemoryKv};
pub use tail::{tail, Journal};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists")]
    KeyExists,
    #[error("wrong last revision: expected {expected}, current {current}")]
    WrongLastRevision { expected: u64, current: u64 },
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("substrate: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

/// One revision of one key. `value` is `None` for delete tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
    pub operation: Operation,
}

impl Entry {
    pub fn put(key: impl Into<String>, value: Vec<u8>, revision: u64) -> Self {
        Self { key: key.into(), value: Some(value), revision, operation: Operation::Put }
    }

    pub fn tombstone(key: impl Into<String>, revision: u64) -> Self {
        Self { key: key.into(), value: None, revision, operation: Operation::Delete }
    }
}

pub type EntryStream = BoxStream<'static, Result<Entry, SubstrateError>>;

/// A live change stream together with what its backlog covers.
///
/// The first `backlog` entries are the snapshot (or replay) read when the
/// subscription was taken; together they cover every change up to `head`.
/// Everything after them is newer than `head`.
pub struct Subscription {
    stream: EntryStream,
    pub head: u64,
    pub backlog: usize,
}

impl Subscription {
    pub fn new(stream: EntryStream, head: u64, backlog: usize) -> Self {
        Self { stream, head, backlog }
    }
}

impl Stream for Subscription {
    type Item = Result<Entry, SubstrateError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.poll_next_unpin(cx)
    }
}

#[async_trait::async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Latest value of `key`.
    async fn get(&self, key: &str) -> Result<Entry, SubstrateError>;

    /// Write `value` only if `key` holds no record; returns the new revision.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, SubstrateError>;

    /// Overwrite an existing record. With `expected` set the write only lands
    /// if the current revision matches; with `None` it lands if the key exists.
    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<u64>) -> Result<u64, SubstrateError>;

    /// Remove a record, optionally guarded by its current revision.
    async fn delete(&self, key: &str, expected: Option<u64>) -> Result<(), SubstrateError>;

    /// Current records whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, SubstrateError>;

    /// Subscribe to changes under `prefix`.
    ///
    /// `from = None` yields the current record of every key first, then live
    /// changes. `from = Some(r)` replays every change with revision >= r, then
    /// continues live. Dropping the stream releases the subscription.
    async fn watch(&self, prefix: &str, from: Option<u64>) -> Result<Subscription, SubstrateError>;
}

fn key_char_ok(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.')
}

/// Keys written to a substrate: non-empty `.`-separated tokens over
/// `[-/_=A-Za-z0-9]`.
pub fn validate_key(key: &str) -> Result<(), SubstrateError> {
    if key.is_empty() || key.split('.').any(|t| t.is_empty()) || !key.chars().all(key_char_ok) {
        return Err(SubstrateError::InvalidKey(key.to_string()));
    }
    Ok(())
}
