//! Persistent key/value store contract, consumed by the permission cache and
//! connection drivers. Keys are string paths; values are JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Async key/value store. `entries` is used only for startup hydration.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_value(&self, key: &[String]) -> Result<Option<Value>, StoreError>;
    async fn set_value(&self, key: &[String], value: Value) -> Result<(), StoreError>;
    async fn entries(&self) -> Result<Vec<(Vec<String>, Value)>, StoreError>;
}

/// In-memory store. Reference implementation for tests and the daemon default;
/// nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<Vec<String>, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<String>, Value>> {
        match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get_value(&self, key: &[String]) -> Result<Option<Value>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set_value(&self, key: &[String], value: Value) -> Result<(), StoreError> {
        self.lock().insert(key.to_vec(), value);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(Vec<String>, Value)>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A prefix-scoped view of a store. Drivers get one of these so that two
/// drivers storing state for the same peer cannot collide.
pub struct ScopedStore {
    prefix: String,
    inner: Arc<dyn KvStore>,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner,
        }
    }

    fn scoped_key(&self, key: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(key.len() + 1);
        out.push(self.prefix.clone());
        out.extend_from_slice(key);
        out
    }

    pub async fn get_value(&self, key: &[String]) -> Result<Option<Value>, StoreError> {
        self.inner.get_value(&self.scoped_key(key)).await
    }

    pub async fn set_value(&self, key: &[String], value: Value) -> Result<(), StoreError> {
        self.inner.set_value(&self.scoped_key(key), value).await
    }
}
