//! Horizon store: versioned objects on top of a revisioned KV substrate.
//!
//! The store is the single place that validates identities, strips read-only
//! fields and maps substrate outcomes onto [`HzError`]. It holds no lock of its
//! own: create-if-absent and compare-and-swap in the substrate decide every
//! race, the loser sees `Conflict`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use horizon_core::{sanitize, HzError, HzResult, Object, ObjectKey, Scope, Status};
use horizon_substrate::{Entry, Substrate, SubstrateError};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

mod apply;
mod codec;
mod config;
mod ctx;
mod feed;
pub mod validate;
mod watch;

pub use apply::{ApplyRequest, ApplyResult};
pub use config::StoreConfig;
pub use ctx::Ctx;
pub use feed::{spawn_feed, Dedup, FeedHandle, Snapshot, SnapshotBuilder};
pub use horizon_apply::DiffSummary;
pub use validate::{ValidationError, Validator, Validators};
pub use watch::{Change, WatchEvent, WatchRequest, Watcher};

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub key: ObjectKey,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub key: ObjectKey,
    pub data: Vec<u8>,
    /// Expected current revision; `None` overwrites whatever is stored.
    pub revision: Option<u64>,
}

/// Replace the `status` of a stored object; nothing else changes.
#[derive(Debug, Clone)]
pub struct StatusRequest {
    pub key: ObjectKey,
    /// `Json::Null` clears the status.
    pub status: Json,
    pub revision: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub key: ObjectKey,
    pub revision: Option<u64>,
}

/// Handle to the object store. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn Substrate>,
    validators: Arc<Validators>,
    cfg: StoreConfig,
}

fn strict(key: &ObjectKey) -> HzResult<String> {
    key.strict_key().map_err(|e| HzError::wrap(e, Status::BadRequest, "invalid identity"))
}

/// Map a substrate write/read failure onto the store taxonomy.
fn classify(err: SubstrateError, op: &str, key: &str) -> HzError {
    match err {
        SubstrateError::KeyNotFound => HzError::not_found(format!("object not found: {:?}", key)),
        SubstrateError::KeyExists => HzError::conflict(format!("object already exists: {:?}", key)),
        SubstrateError::WrongLastRevision { expected, current } => HzError::conflict(format!(
            "object has been modified: {:?} (expected revision {}, current {})",
            key, expected, current
        )),
        other => HzError::wrap(other, Status::Internal, format!("{} {:?}", op, key)),
    }
}

fn observe<T>(op: &'static str, started: Instant, res: &HzResult<T>) {
    histogram!("store_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    match res {
        Ok(_) => counter!("store_op_total", 1u64, "op" => op),
        Err(e) => {
            counter!("store_op_err", 1u64, "op" => op, "status" => e.status().as_str());
            debug!(op, status = %e.status(), error = %e, "store op failed");
        }
    }
}

impl Store {
    pub fn new(kv: Arc<dyn Substrate>) -> Self {
        Self { kv, validators: Arc::new(Validators::default()), cfg: StoreConfig::default() }
    }

    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    pub fn with_config(mut self, cfg: StoreConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> { &self.kv }
    pub fn config(&self) -> &StoreConfig { &self.cfg }

    pub async fn create(&self, ctx: &Ctx, req: CreateRequest) -> HzResult<Object> {
        let started = Instant::now();
        let res = self.create_inner(ctx, req).await;
        observe("create", started, &res);
        res
    }

    pub(crate) async fn create_inner(&self, ctx: &Ctx, req: CreateRequest) -> HzResult<Object> {
        // Fast, descriptive conflict for the common case. The atomic create
        // below is what actually guards against racing creators.
        let probe = req.key.key();
        match ctx.run("create", &probe, self.kv.get(&probe)).await? {
            Ok(_) => return Err(HzError::conflict(format!("object already exists: {:?}", probe))),
            Err(SubstrateError::KeyNotFound) => {}
            Err(e) => return Err(HzError::wrap(e, Status::Internal, "checking existing object")),
        }
        let validator = self.validators.for_kind(&req.key.kind);
        ctx.run("create", &probe, validator.validate_create(&req.key, &req.data))
            .await?
            .map_err(|e| HzError::wrap(e, Status::Internal, format!("validating object: {:?}", probe)))?;
        let key = strict(&req.key)?;
        let data = sanitize::strip_read_only(&req.data)?;
        let mut doc = codec::parse(&data, "removing read-only fields")?;
        codec::bind_identity(&req.key, &mut doc)?;
        codec::stamp_new(&mut doc);
        let mut obj = codec::typed(&key, &doc)?;
        let value = codec::encode(&doc)?;

        let rev = ctx
            .run("create", &key, self.kv.create(&key, value))
            .await?
            .map_err(|e| classify(e, "creating object", &key))?;
        debug!(key = %key, rev, "object created");
        obj.metadata.revision = Some(rev);
        Ok(obj)
    }

    pub async fn get(&self, ctx: &Ctx, key: &ObjectKey) -> HzResult<Object> {
        let started = Instant::now();
        let res = async {
            let key = strict(key)?;
            let entry = self.fetch(ctx, "getting object", &key).await?;
            codec::decode(&entry)
        }
        .await;
        observe("get", started, &res);
        res
    }

    /// Current objects in `scope`, ordered by key.
    pub async fn list(&self, ctx: &Ctx, scope: &Scope) -> HzResult<Vec<Object>> {
        let started = Instant::now();
        let res = async {
            let prefix = scope.prefix().map_err(|e| HzError::wrap(e, Status::BadRequest, "invalid scope"))?;
            let entries = ctx
                .run("list", &prefix, self.kv.list(&prefix))
                .await?
                .map_err(|e| classify(e, "listing objects", &prefix))?;
            entries.iter().map(codec::decode).collect::<HzResult<Vec<_>>>()
        }
        .await;
        observe("list", started, &res);
        res
    }

    pub async fn update(&self, ctx: &Ctx, req: UpdateRequest) -> HzResult<Object> {
        let started = Instant::now();
        let res = self.update_inner(ctx, req).await;
        observe("update", started, &res);
        res
    }

    async fn update_inner(&self, ctx: &Ctx, req: UpdateRequest) -> HzResult<Object> {
        let key = strict(&req.key)?;
        let data = sanitize::strip_read_only(&req.data)?;
        let mut next = codec::parse(&data, "removing read-only fields")?;
        codec::bind_identity(&req.key, &mut next)?;

        let current = self.fetch(ctx, "updating object", &key).await?;
        if let Some(expected) = req.revision {
            if expected != current.revision {
                counter!("store_conflict_total", 1u64, "op" => "update");
                return Err(classify(
                    SubstrateError::WrongLastRevision { expected, current: current.revision },
                    "updating object",
                    &key,
                ));
            }
        }
        let stored_raw = current.value.as_deref().unwrap_or_default();
        let validator = self.validators.for_kind(&req.key.kind);
        ctx.run("update", &key, validator.validate_update(&req.key, stored_raw, &data))
            .await?
            .map_err(|e| HzError::wrap(e, Status::Internal, format!("validating object: {:?}", key)))?;

        let stored = codec::parse(stored_raw, "decoding stored object")?;
        codec::carry_server_state(&stored, &mut next);
        let mut obj = codec::typed(&key, &next)?;
        let value = codec::encode(&next)?;
        let rev = self.write(ctx, "updating object", &key, value, req.revision).await?;
        debug!(key = %key, rev, "object updated");
        obj.metadata.revision = Some(rev);
        Ok(obj)
    }

    /// Status sub-resource: the only write path for `status`. The write is
    /// always guarded by the revision it was computed from.
    pub async fn update_status(&self, ctx: &Ctx, req: StatusRequest) -> HzResult<Object> {
        let started = Instant::now();
        let res = async {
            let key = strict(&req.key)?;
            let current = self.fetch(ctx, "updating status", &key).await?;
            let expected = req.revision.unwrap_or(current.revision);
            if expected != current.revision {
                return Err(classify(
                    SubstrateError::WrongLastRevision { expected, current: current.revision },
                    "updating status",
                    &key,
                ));
            }
            let mut doc = codec::parse(current.value.as_deref().unwrap_or_default(), "decoding stored object")?;
            if let Some(obj) = doc.as_object_mut() {
                if req.status.is_null() {
                    obj.remove(sanitize::STATUS);
                } else {
                    obj.insert(sanitize::STATUS.into(), req.status.clone());
                }
            }
            let mut obj = codec::typed(&key, &doc)?;
            let value = codec::encode(&doc)?;
            let rev = self.write(ctx, "updating status", &key, value, Some(expected)).await?;
            debug!(key = %key, rev, "status updated");
            obj.metadata.revision = Some(rev);
            Ok(obj)
        }
        .await;
        observe("update_status", started, &res);
        res
    }

    pub async fn delete(&self, ctx: &Ctx, req: DeleteRequest) -> HzResult<()> {
        let started = Instant::now();
        let res = async {
            let key = strict(&req.key)?;
            ctx.check("delete", &key)?;
            ctx.run("delete", &key, self.kv.delete(&key, req.revision))
                .await?
                .map_err(|e| classify(e, "deleting object", &key))?;
            debug!(key = %key, expected = ?req.revision, "object deleted");
            Ok::<(), HzError>(())
        }
        .await;
        observe("delete", started, &res);
        res
    }

    pub(crate) async fn fetch(&self, ctx: &Ctx, op: &str, key: &str) -> HzResult<Entry> {
        ctx.run(op, key, self.kv.get(key)).await?.map_err(|e| classify(e, op, key))
    }

    pub(crate) async fn write(&self, ctx: &Ctx, op: &str, key: &str, value: Vec<u8>, expected: Option<u64>) -> HzResult<u64> {
        ctx.check(op, key)?;
        ctx.run(op, key, self.kv.update(key, value, expected)).await?.map_err(|e| {
            if matches!(e, SubstrateError::WrongLastRevision { .. }) {
                counter!("store_conflict_total", 1u64, "op" => "write");
            }
            classify(e, op, key)
        })
    }
}
