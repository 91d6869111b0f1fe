use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{HzError, ObjectKey};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Read-only: supplied by the substrate on every read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Read-only: assigned once on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Read-only: assigned once on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Metadata fields the store does not interpret (owner references, ...).
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

/// Decoded object: kind, metadata, and every other top-level field as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub fields: Map<String, Json>,
}

impl Object {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn revision(&self) -> Option<u64> { self.metadata.revision }

    pub fn status(&self) -> Option<&Json> { self.fields.get("status") }

    pub fn from_slice(data: &[u8]) -> Result<Self, HzError> {
        serde_json::from_slice(data).map_err(|e| HzError::wrap(e, crate::Status::Internal, "decoding object"))
    }

    pub fn from_value(v: Json) -> Result<Self, HzError> {
        serde_json::from_value(v).map_err(|e| HzError::wrap(e, crate::Status::Internal, "decoding object"))
    }

    pub fn to_value(&self) -> Json {
        // Serializing plain maps and strings cannot fail.
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}
