use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by preference stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefsError {
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
    /// A value could not be encrypted or decrypted.
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },
    /// The stored value exists but is not of the requested shape.
    #[error("invalid value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    /// The store refuses this operation outright.
    #[error("operation not supported: {operation}")]
    Unsupported { operation: &'static str },
}

/// A raw value as held by a plain preference store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    String(String),
    StringSet(BTreeSet<String>),
}

/// String-keyed preference storage (the "delegate" that encrypting stores decorate).
///
/// Implementations provide their own consistency for concurrent callers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value; `Ok(None)` when the key is absent.
    async fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError>;

    /// Persist a string value, overwriting any existing entry.
    async fn put_string(&self, key: &str, value: &str) -> Result<(), PrefsError>;

    /// Read a string set; `Ok(None)` when the key is absent.
    async fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PrefsError>;

    /// Persist a string set, overwriting any existing entry.
    async fn put_string_set(&self, key: &str, values: &BTreeSet<String>)
        -> Result<(), PrefsError>;

    /// Remove a key and its value (idempotent).
    async fn remove(&self, key: &str) -> Result<(), PrefsError>;

    /// Remove every entry of this store.
    async fn clear(&self) -> Result<(), PrefsError>;

    async fn contains(&self, key: &str) -> Result<bool, PrefsError>;

    /// Snapshot of every raw entry.
    async fn entries(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError>;
}

/// In-memory preference store for tests and ephemeral sessions.
/// Clones share the same underlying map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<String, PrefValue>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, PrefValue>>, PrefsError> {
        self.inner.lock().map_err(|err| PrefsError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        match self.map()?.get(key) {
            None => Ok(None),
            Some(PrefValue::String(value)) => Ok(Some(value.clone())),
            Some(PrefValue::StringSet(_)) => Err(wrong_shape(key, "string set")),
        }
    }

    async fn put_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.map()?
            .insert(key.to_string(), PrefValue::String(value.to_string()));
        Ok(())
    }

    async fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PrefsError> {
        match self.map()?.get(key) {
            None => Ok(None),
            Some(PrefValue::StringSet(values)) => Ok(Some(values.clone())),
            Some(PrefValue::String(_)) => Err(wrong_shape(key, "string")),
        }
    }

    async fn put_string_set(
        &self,
        key: &str,
        values: &BTreeSet<String>,
    ) -> Result<(), PrefsError> {
        self.map()?
            .insert(key.to_string(), PrefValue::StringSet(values.clone()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.map()?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), PrefsError> {
        self.map()?.clear();
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.map()?.contains_key(key))
    }

    async fn entries(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
        Ok(self
            .map()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Error for a stored value whose kind does not match the accessor used.
pub fn wrong_shape(key: &str, found: &str) -> PrefsError {
    PrefsError::InvalidValue {
        key: key.to_string(),
        reason: format!("stored value is a {found}"),
    }
}
