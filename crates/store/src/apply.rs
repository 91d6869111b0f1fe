//! Declarative apply: create, or merge onto what is stored.

use std::time::Instant;

use horizon_apply::{diff_summary, merge_desired, strip_noisy, DiffSummary};
use horizon_core::{HzError, HzResult, Object, ObjectKey, Status};
use metrics::counter;
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

use crate::{codec, observe, Ctx, CreateRequest, Store};

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Desired object; identity is read from `kind` and `metadata`.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub created: bool,
    pub updated: bool,
    pub object: Object,
    /// Difference between the stored and the desired state, server fields ignored.
    pub summary: DiffSummary,
}

impl Store {
    /// Create the object, or merge the desired document onto the stored one.
    ///
    /// Conflicts with concurrent writers are retried up to
    /// `StoreConfig::apply_retries` attempts; the last conflict is returned.
    pub async fn apply(&self, ctx: &Ctx, req: ApplyRequest) -> HzResult<ApplyResult> {
        let started = Instant::now();
        let res = self.apply_inner(ctx, req).await;
        observe("apply", started, &res);
        res
    }

    async fn apply_inner(&self, ctx: &Ctx, req: ApplyRequest) -> HzResult<ApplyResult> {
        let desired: Json = serde_json::from_slice(&req.data)
            .map_err(|e| HzError::wrap(e, Status::BadRequest, "parsing desired object"))?;
        let key = ObjectKey::from_manifest(&desired)
            .map_err(|e| HzError::wrap(e, Status::BadRequest, "invalid identity"))?;
        let skey = key.key();
        // What a create stores: the desired document merged onto nothing, so
        // `null` members are dropped exactly as a later merge would drop them.
        let normalized = merge_desired(&Json::Object(Map::new()), &desired);
        let create_data = codec::encode(&normalized)?;
        let desired_clean = strip_noisy(normalized);

        let attempts = self.cfg.apply_retries.max(1);
        let mut last: Option<HzError> = None;
        for attempt in 1..=attempts {
            ctx.check("apply", &skey)?;
            if attempt > 1 {
                counter!("store_apply_retries_total", 1u64);
            }
            match self.create_inner(ctx, CreateRequest { key: key.clone(), data: create_data.clone() }).await {
                Ok(object) => {
                    let summary = diff_summary(&desired_clean, &Json::Object(Default::default()));
                    debug!(key = %skey, attempt, "apply created object");
                    return Ok(ApplyResult { created: true, updated: false, object, summary });
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }

            let current = match self.fetch(ctx, "applying object", &skey).await {
                Ok(entry) => entry,
                // Deleted between our create and read: start over with a create.
                Err(e) if e.is_not_found() => {
                    last = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let stored_raw = current.value.as_deref().unwrap_or_default();
            let stored = codec::parse(stored_raw, "decoding stored object")?;
            let merged = merge_desired(&stored, &desired);
            let summary = diff_summary(&strip_noisy(merged.clone()), &strip_noisy(stored.clone()));
            if merged == stored {
                debug!(key = %skey, rev = current.revision, "apply: no changes");
                let object = codec::decode(&current)?;
                return Ok(ApplyResult { created: false, updated: false, object, summary });
            }

            let mut object = codec::typed(&skey, &merged)?;
            let candidate = codec::encode(&strip_noisy(merged.clone()))?;
            let validator = self.validators.for_kind(&key.kind);
            ctx.run("apply", &skey, validator.validate_update(&key, stored_raw, &candidate))
                .await?
                .map_err(|e| HzError::wrap(e, Status::Internal, format!("validating object: {:?}", skey)))?;

            let value = codec::encode(&merged)?;
            match self.write(ctx, "applying object", &skey, value, Some(current.revision)).await {
                Ok(rev) => {
                    debug!(key = %skey, rev, attempt, adds = summary.adds, updates = summary.updates, removes = summary.removes, "apply updated object");
                    object.metadata.revision = Some(rev);
                    return Ok(ApplyResult { created: false, updated: true, object, summary });
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(key = %skey, attempt, error = %e, "apply lost a race; retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(key = %skey, attempts, "apply gave up after repeated conflicts");
        Err(last.unwrap_or_else(|| HzError::conflict(format!("object has been modified: {:?}", skey))))
    }
}
