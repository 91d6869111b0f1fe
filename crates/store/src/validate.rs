//! Per-kind validation hooks, run before any write is committed.

use std::sync::Arc;

use horizon_core::{ObjectKey, NAMESPACE_ROOT};
use horizon_substrate::{Substrate, SubstrateError};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

pub const KIND_NAMESPACE: &str = "Namespace";

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self { Self { reason: reason.into() } }
}

/// Kind-specific checks. Both hooks default to accepting everything.
#[allow(unused_variables)]
#[async_trait::async_trait]
pub trait Validator: Send + Sync {
    async fn validate_create(&self, key: &ObjectKey, data: &[u8]) -> Result<(), ValidationError> { Ok(()) }

    /// `current` is the stored value being replaced.
    async fn validate_update(&self, key: &ObjectKey, current: &[u8], data: &[u8]) -> Result<(), ValidationError> { Ok(()) }
}

/// Accepts everything; the default for kinds without a registered validator.
pub struct Noop;

impl Validator for Noop {}

/// Runs several validators in order; the first failure wins.
pub struct Chain(pub Vec<Arc<dyn Validator>>);

#[async_trait::async_trait]
impl Validator for Chain {
    async fn validate_create(&self, key: &ObjectKey, data: &[u8]) -> Result<(), ValidationError> {
        for v in &self.0 {
            v.validate_create(key, data).await?;
        }
        Ok(())
    }

    async fn validate_update(&self, key: &ObjectKey, current: &[u8], data: &[u8]) -> Result<(), ValidationError> {
        for v in &self.0 {
            v.validate_update(key, current, data).await?;
        }
        Ok(())
    }
}

/// `Namespace` objects are cluster-scoped and named like DNS labels.
pub struct NamespaceValidator;

impl NamespaceValidator {
    fn check(key: &ObjectKey) -> Result<(), ValidationError> {
        if key.namespace != NAMESPACE_ROOT {
            return Err(ValidationError::new(format!(
                "namespace objects must live in the {:?} namespace, not {:?}",
                NAMESPACE_ROOT, key.namespace
            )));
        }
        if key.name.len() > 63 || !DNS_LABEL.is_match(&key.name) {
            return Err(ValidationError::new(format!("namespace name {:?} is not a DNS-1123 label", key.name)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Validator for NamespaceValidator {
    async fn validate_create(&self, key: &ObjectKey, _data: &[u8]) -> Result<(), ValidationError> {
        Self::check(key)
    }
}

/// Objects outside the root namespace need their `Namespace` to exist.
pub struct NamespaceExists {
    kv: Arc<dyn Substrate>,
}

impl NamespaceExists {
    pub fn new(kv: Arc<dyn Substrate>) -> Self { Self { kv } }
}

#[async_trait::async_trait]
impl Validator for NamespaceExists {
    async fn validate_create(&self, key: &ObjectKey, _data: &[u8]) -> Result<(), ValidationError> {
        if key.namespace == NAMESPACE_ROOT {
            return Ok(());
        }
        let ns_key = ObjectKey::cluster(KIND_NAMESPACE, &key.namespace).key();
        match self.kv.get(&ns_key).await {
            Ok(_) => Ok(()),
            Err(SubstrateError::KeyNotFound) => Err(ValidationError::new(format!("namespace {:?} does not exist", key.namespace))),
            Err(e) => Err(ValidationError::new(format!("checking namespace {:?}: {}", key.namespace, e))),
        }
    }
}

/// Kind -> validator mapping, fixed after startup.
pub struct Validators {
    by_kind: FxHashMap<String, Arc<dyn Validator>>,
    fallback: Arc<dyn Validator>,
}

impl Default for Validators {
    fn default() -> Self {
        Self { by_kind: FxHashMap::default(), fallback: Arc::new(Noop) }
    }
}

impl Validators {
    pub fn builder() -> ValidatorsBuilder { ValidatorsBuilder { inner: Self::default() } }

    /// `Namespace` naming rules plus namespace existence for everything else.
    pub fn standard(kv: Arc<dyn Substrate>) -> Self {
        Self::builder()
            .register(KIND_NAMESPACE, Arc::new(NamespaceValidator))
            .fallback(Arc::new(NamespaceExists::new(kv)))
            .build()
    }

    pub fn for_kind(&self, kind: &str) -> &dyn Validator {
        self.by_kind.get(kind).unwrap_or(&self.fallback).as_ref()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.by_kind.keys().map(String::as_str)
    }
}

pub struct ValidatorsBuilder {
    inner: Validators,
}

impl ValidatorsBuilder {
    pub fn register(mut self, kind: impl Into<String>, v: Arc<dyn Validator>) -> Self {
        self.inner.by_kind.insert(kind.into(), v);
        self
    }

    pub fn fallback(mut self, v: Arc<dyn Validator>) -> Self {
        self.inner.fallback = v;
        self
    }

    pub fn build(self) -> Validators { self.inner }
}
