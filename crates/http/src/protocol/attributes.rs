//! Typed key-value storage shared between threads, used for per-request
//! attachments and session values.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

type Value = Arc<dyn Any + Send + Sync>;

/// A concurrent map from names to values of any `Send + Sync` type.
#[derive(Default)]
pub struct Attributes {
    inner: DashMap<String, Value>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<K: Into<String>, T: Any + Send + Sync>(&self, key: K, value: T) {
        self.inner.insert(key.into(), Arc::new(value));
    }

    /// The value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.get(key).map(|entry| Arc::clone(entry.value()))?;
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes").field("keys", &self.keys()).finish()
    }
}
