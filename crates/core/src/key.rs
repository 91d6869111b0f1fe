//! Key codec: identity <-> substrate key.
//!
//! Keys have the shape `kind.namespace.name`. The `.` is the substrate's own
//! hierarchy separator, so strict validation refuses it (and the wildcard
//! characters `*`/`>`) inside any token.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Namespace holding cluster-scoped objects such as `Namespace` itself.
pub const NAMESPACE_ROOT: &str = "root";

pub const KEY_SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key {key:?}: {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: String,
}

/// Identity of an object: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

fn token_ok(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='
}

fn check_token(what: &str, tok: &str) -> Result<(), String> {
    if tok.is_empty() {
        return Err(format!("{} is required", what));
    }
    if let Some(c) = tok.chars().find(|c| !token_ok(*c)) {
        return Err(format!("{} {:?} contains {:?} (allowed: letters, digits, '-', '_', '=')", what, tok, c));
    }
    Ok(())
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Identity of a cluster-scoped object (lives in [`NAMESPACE_ROOT`]).
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, NAMESPACE_ROOT, name)
    }

    /// Non-strict derivation. Pure and total; only used for existence probes.
    pub fn key(&self) -> String {
        format!("{}{sep}{}{sep}{}", self.kind, self.namespace, self.name, sep = KEY_SEPARATOR)
    }

    /// Strict derivation: every token must be non-empty and substrate-safe.
    pub fn strict_key(&self) -> Result<String, InvalidKey> {
        let fail = |reason: String| InvalidKey { key: self.key(), reason };
        check_token("kind", &self.kind).map_err(fail)?;
        check_token("namespace", &self.namespace).map_err(fail)?;
        check_token("name", &self.name).map_err(fail)?;
        Ok(self.key())
    }

    /// Parse a key produced by [`ObjectKey::strict_key`].
    pub fn from_key(key: &str) -> Result<Self, InvalidKey> {
        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [kind, namespace, name] => {
                let k = Self::new(*kind, *namespace, *name);
                k.strict_key()?;
                Ok(k)
            }
            _ => Err(InvalidKey { key: key.to_string(), reason: "expected kind.namespace.name".into() }),
        }
    }

    /// Identity embedded in an object document (`kind`, `metadata.name`,
    /// `metadata.namespace`). A missing namespace is rejected rather than
    /// defaulted so that cluster-scoped objects are always explicit.
    pub fn from_manifest(doc: &Json) -> Result<Self, InvalidKey> {
        let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let meta = doc.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or_default();
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or_default();
        let k = Self::new(kind, namespace, name);
        k.strict_key()?;
        Ok(k)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Key range addressed by List and Watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    kind: Option<String>,
    namespace: Option<String>,
}

impl Scope {
    /// Every object of every kind.
    pub fn all() -> Self { Self::default() }

    pub fn kind(kind: impl Into<String>) -> Self {
        Self { kind: Some(kind.into()), namespace: None }
    }

    /// Narrow a kind scope to one namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn kind_name(&self) -> Option<&str> { self.kind.as_deref() }
    pub fn namespace_name(&self) -> Option<&str> { self.namespace.as_deref() }

    /// Substrate key prefix for this scope (`""`, `"kind."` or `"kind.ns."`).
    pub fn prefix(&self) -> Result<String, InvalidKey> {
        let mut out = String::new();
        if let Some(kind) = &self.kind {
            check_token("kind", kind).map_err(|reason| InvalidKey { key: kind.clone(), reason })?;
            out.push_str(kind);
            out.push(KEY_SEPARATOR);
            if let Some(ns) = &self.namespace {
                check_token("namespace", ns).map_err(|reason| InvalidKey { key: format!("{}{}{}", kind, KEY_SEPARATOR, ns), reason })?;
                out.push_str(ns);
                out.push(KEY_SEPARATOR);
            }
        }
        Ok(out)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.kind.as_ref().map_or(true, |k| *k == key.kind)
            && self.namespace.as_ref().map_or(true, |ns| *ns == key.namespace)
    }
}
