//! Horizon apply helpers: manifest parsing, desired-state merge and diffs.
//! Pure functions; the store decides when to read and write.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use horizon_core::{sanitize, ObjectKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

fn max_manifest_bytes() -> usize {
    std::env::var("HZ_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_manifest_nodes() -> usize {
    std::env::var("HZ_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail early once past max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// A parsed manifest: the JSON document and the identity it names.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub key: ObjectKey,
    pub doc: Json,
}

/// Parse a JSON or YAML manifest. `ns_override` fills (or replaces) the
/// namespace before the identity is checked.
pub fn parse_manifest(text: &str, ns_override: Option<&str>) -> Result<Manifest> {
    if text.len() > max_manifest_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_manifest_bytes()));
    }
    // YAML is a superset of JSON, one parser covers both.
    let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing manifest")?;
    let doc = serde_json::to_value(val).context("converting manifest to JSON")?;
    manifest_from_json(doc, ns_override)
}

pub fn manifest_from_json(mut doc: Json, ns_override: Option<&str>) -> Result<Manifest> {
    if json_node_budget_exceeded(&doc, max_manifest_nodes()) {
        return Err(anyhow!("manifest too complex (>{} nodes)", max_manifest_nodes()));
    }
    let obj = doc.as_object_mut().ok_or_else(|| anyhow!("manifest is not an object"))?;
    match obj.get("kind") {
        Some(Json::String(_)) => {}
        _ => return Err(anyhow!("manifest missing kind")),
    }
    if !obj.get("metadata").and_then(|m| m.get("name")).map_or(false, |n| n.is_string()) {
        return Err(anyhow!("manifest missing metadata.name"));
    }
    if let Some(ns) = ns_override {
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }
    let key = ObjectKey::from_manifest(&doc).context("manifest identity")?;
    Ok(Manifest { key, doc })
}

/// Merge `desired` onto `stored` with JSON merge-patch rules: objects merge
/// recursively, `null` removes, anything else replaces. Read-only fields in
/// `desired` are ignored so the stored values survive.
pub fn merge_desired(stored: &Json, desired: &Json) -> Json {
    let mut patch = desired.clone();
    sanitize::strip_value(&mut patch);
    let mut out = stored.clone();
    merge_patch(&mut out, &patch);
    out
}

fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(pm) => {
            if !target.is_object() {
                *target = Json::Object(serde_json::Map::new());
            }
            if let Some(tm) = target.as_object_mut() {
                for (k, pv) in pm {
                    if pv.is_null() {
                        tm.remove(k);
                    } else {
                        merge_patch(tm.entry(k.clone()).or_insert(Json::Null), pv);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Strip fields that are expected to differ between two revisions of the
/// same object; used before diffing.
pub fn strip_noisy(mut v: Json) -> Json {
    sanitize::strip_value(&mut v);
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}
