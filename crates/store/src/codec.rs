//! Record <-> object encoding and server-managed state.

use chrono::Utc;
use horizon_core::{sanitize::STATUS, HzError, Object, ObjectKey, Status};
use horizon_substrate::Entry;
use serde_json::{Map, Value as Json};

pub(crate) fn parse(data: &[u8], what: &str) -> Result<Json, HzError> {
    serde_json::from_slice(data).map_err(|e| HzError::wrap(e, Status::Internal, what))
}

pub(crate) fn encode(v: &Json) -> Result<Vec<u8>, HzError> {
    serde_json::to_vec(v).map_err(|e| HzError::wrap(e, Status::Internal, "encoding object"))
}

/// Decode a stored value and stamp the substrate-supplied revision.
pub(crate) fn decode_value(key: &str, data: &[u8], revision: u64) -> Result<Object, HzError> {
    let mut obj: Object = serde_json::from_slice(data)
        .map_err(|e| HzError::wrap(e, Status::Internal, format!("decoding object {:?}", key)))?;
    obj.metadata.revision = Some(revision);
    Ok(obj)
}

/// Typed view of a document about to be written. Whatever would not decode
/// back into an [`Object`] is refused before it reaches the substrate.
pub(crate) fn typed(key: &str, doc: &Json) -> Result<Object, HzError> {
    serde_json::from_value(doc.clone())
        .map_err(|e| HzError::wrap(e, Status::BadRequest, format!("object {:?} does not fit the object schema", key)))
}

pub(crate) fn decode(entry: &Entry) -> Result<Object, HzError> {
    match &entry.value {
        Some(v) => decode_value(&entry.key, v, entry.revision),
        None => Err(HzError::internal(format!("decoding object {:?}: record has no value", entry.key))),
    }
}

/// Make the document's embedded identity agree with `key`: fill what is
/// missing, refuse what contradicts it.
pub(crate) fn bind_identity(key: &ObjectKey, doc: &mut Json) -> Result<(), HzError> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| HzError::bad_request("object payload must be a JSON object"))?;
    match obj.get("kind") {
        None | Some(Json::Null) => { obj.insert("kind".into(), Json::String(key.kind.clone())); }
        Some(Json::String(k)) if *k == key.kind => {}
        Some(other) => {
            return Err(HzError::bad_request(format!("payload kind {} does not match {:?}", other, key.kind)));
        }
    }
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| HzError::bad_request("metadata must be a JSON object"))?;
    for (field, want) in [("name", &key.name), ("namespace", &key.namespace)] {
        match meta.get(field) {
            None | Some(Json::Null) => { meta.insert(field.into(), Json::String(want.clone())); }
            Some(Json::String(got)) if got == want => {}
            Some(other) => {
                return Err(HzError::bad_request(format!(
                    "metadata.{} {} does not match {:?}; identity is immutable",
                    field, other, want
                )));
            }
        }
    }
    Ok(())
}

/// Server-managed fields assigned once, on create.
pub(crate) fn stamp_new(doc: &mut Json) {
    if let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
        meta.insert("creationTimestamp".into(), Json::String(Utc::now().to_rfc3339()));
    }
}

/// Copy server-managed state (uid, creation time, status) from the stored
/// document onto a sanitized replacement.
pub(crate) fn carry_server_state(stored: &Json, next: &mut Json) {
    if let Some(status) = stored.get(STATUS) {
        if let Some(obj) = next.as_object_mut() {
            obj.insert(STATUS.into(), status.clone());
        }
    }
    let stored_meta = stored.get("metadata").and_then(|m| m.as_object());
    if let (Some(from), Some(to)) = (stored_meta, next.get_mut("metadata").and_then(|m| m.as_object_mut())) {
        for f in ["uid", "creationTimestamp"] {
            if let Some(v) = from.get(f) {
                to.insert(f.into(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_filled_or_enforced() {
        let key = ObjectKey::new("Widget", "dev", "w");
        let mut doc = serde_json::json!({"spec": {}});
        bind_identity(&key, &mut doc).unwrap();
        assert_eq!(doc["kind"], "Widget");
        assert_eq!(doc["metadata"]["name"], "w");
        assert_eq!(doc["metadata"]["namespace"], "dev");

        let mut doc = serde_json::json!({"kind": "Gadget"});
        assert_eq!(bind_identity(&key, &mut doc).unwrap_err().status(), Status::BadRequest);
        let mut doc = serde_json::json!({"metadata": {"namespace": "prod"}});
        let e = bind_identity(&key, &mut doc).unwrap_err();
        assert!(e.to_string().contains("metadata.namespace"), "{}", e);
    }

    #[test]
    fn server_state_carries_over() {
        let stored = serde_json::json!({
            "kind": "W", "metadata": {"name": "w", "uid": "u-1", "creationTimestamp": "2024-01-01T00:00:00Z"},
            "status": {"phase": "Ready"}
        });
        let mut next = serde_json::json!({"kind": "W", "metadata": {"name": "w"}, "spec": {"a": 1}});
        carry_server_state(&stored, &mut next);
        assert_eq!(next["metadata"]["uid"], "u-1");
        assert_eq!(next["metadata"]["creationTimestamp"], "2024-01-01T00:00:00Z");
        assert_eq!(next["status"]["phase"], "Ready");
        assert_eq!(next["spec"]["a"], 1);
    }

    #[test]
    fn typed_refuses_malformed_metadata() {
        let ok = serde_json::json!({"kind": "W", "metadata": {"name": "w", "namespace": "dev", "labels": {"a": "1"}}});
        assert_eq!(typed("W.dev.w", &ok).unwrap().metadata.name, "w");
        for bad in [
            serde_json::json!({"kind": "W", "metadata": {"name": "w", "labels": {"a": 1}}}),
            serde_json::json!({"kind": "W", "metadata": {"name": "w", "annotations": {"a": true}}}),
        ] {
            assert_eq!(typed("W.dev.w", &bad).unwrap_err().status(), Status::BadRequest, "{}", bad);
        }
    }

    #[test]
    fn decode_stamps_revision() {
        let e = Entry::put("W.dev.w", br#"{"kind":"W","metadata":{"name":"w","namespace":"dev"}}"#.to_vec(), 7);
        let obj = decode(&e).unwrap();
        assert_eq!(obj.revision(), Some(7));
        assert!(decode(&Entry::tombstone("W.dev.w", 8)).is_err());
    }
}
