//! Read-only fields: what clients may send but the store never trusts.

use serde_json::Value as Json;

use crate::{HzError, Status};

/// Top-level field written only through the status path.
pub const STATUS: &str = "status";

/// `metadata` fields computed by the store or supplied by the substrate.
pub const READ_ONLY_METADATA: [&str; 3] = ["revision", "uid", "creationTimestamp"];

/// Remove every read-only field from a decoded document, in place.
/// Returns how many fields were dropped.
pub fn strip_value(v: &mut Json) -> usize {
    let mut dropped = 0usize;
    if let Some(obj) = v.as_object_mut() {
        if obj.remove(STATUS).is_some() { dropped += 1; }
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for f in READ_ONLY_METADATA {
                if meta.remove(f).is_some() { dropped += 1; }
            }
        }
    }
    dropped
}

/// Decode, strip and re-encode a client payload. Failures here are on our
/// side of the contract and therefore `Internal`.
pub fn strip_read_only(data: &[u8]) -> Result<Vec<u8>, HzError> {
    let mut v: Json = serde_json::from_slice(data)
        .map_err(|e| HzError::wrap(e, Status::Internal, "removing read-only fields"))?;
    if !v.is_object() {
        return Err(HzError::internal("removing read-only fields: payload is not an object"));
    }
    strip_value(&mut v);
    serde_json::to_vec(&v).map_err(|e| HzError::wrap(e, Status::Internal, "removing read-only fields"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forged_server_state() {
        let raw = serde_json::json!({
            "kind": "Widget",
            "metadata": {
                "name": "w",
                "namespace": "dev",
                "revision": 99,
                "uid": "forged",
                "creationTimestamp": "1999-01-01T00:00:00Z",
                "labels": {"k": "v"}
            },
            "spec": {"a": 1},
            "status": {"ready": true}
        });
        let out = strip_read_only(&serde_json::to_vec(&raw).unwrap()).unwrap();
        let v: Json = serde_json::from_slice(&out).unwrap();
        assert!(v.get("status").is_none());
        let meta = v["metadata"].as_object().unwrap();
        for f in READ_ONLY_METADATA {
            assert!(!meta.contains_key(f), "{} survived", f);
        }
        assert_eq!(v["metadata"]["labels"]["k"], "v");
        assert_eq!(v["spec"]["a"], 1);
    }

    #[test]
    fn clean_payloads_pass_through() {
        let mut v = serde_json::json!({"kind": "A", "metadata": {"name": "x"}});
        assert_eq!(strip_value(&mut v), 0);
        assert_eq!(v, serde_json::json!({"kind": "A", "metadata": {"name": "x"}}));
    }

    #[test]
    fn undecodable_payload_is_internal() {
        let e = strip_read_only(b"{not json").unwrap_err();
        assert_eq!(e.status(), Status::Internal);
        assert!(e.to_string().starts_with("removing read-only fields"), "{}", e);
    }
}
