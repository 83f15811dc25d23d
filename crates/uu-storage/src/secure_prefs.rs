use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::debug;
use uu_core::prefs::{KeyValueStore, PrefsError};

use crate::{
    crypto::GcmCrypto, encrypted_prefs::EncryptedKeyValueStore, key_provider::SecretKeyProvider,
};

/// Typed encrypted preferences that must be initialized before use.
///
/// Construct one per store and share it; the application decides whether
/// that instance is process-wide. Reads fall back to the caller's default on
/// any storage or crypto failure. Writes report failures.
///
/// # Panics
///
/// Every accessor panics if called before [`SecurePrefs::init`].
pub struct SecurePrefs<S: KeyValueStore, P: SecretKeyProvider> {
    store: RwLock<Option<Arc<EncryptedKeyValueStore<S, P>>>>,
}

impl<S: KeyValueStore, P: SecretKeyProvider> Default for SecurePrefs<S, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: KeyValueStore, P: SecretKeyProvider> SecurePrefs<S, P> {
    pub const fn new() -> Self {
        Self {
            store: RwLock::new(None),
        }
    }

    /// Bind to `delegate`, encrypting under the key aliased by `store_name`.
    /// Calling again replaces the active store.
    pub fn init(&self, store_name: &str, delegate: S, key_provider: P) {
        let store = EncryptedKeyValueStore::new(delegate, GcmCrypto::new(key_provider), store_name);
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(store));
        debug!(store_name, "secure prefs initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[track_caller]
    fn store(&self) -> Arc<EncryptedKeyValueStore<S, P>> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(store) => Arc::clone(store),
            None => panic!("SecurePrefs is not initialized: call init() before any accessor"),
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.store().get_string(key, default).await
    }

    /// `None` removes the key.
    pub async fn put_string(&self, key: &str, value: Option<&str>) -> Result<(), PrefsError> {
        self.store().put_string(key, value).await
    }

    pub async fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> BTreeSet<String> {
        self.store().get_string_set(key, default).await
    }

    /// `None` removes the key.
    pub async fn put_string_set(
        &self,
        key: &str,
        values: Option<&BTreeSet<String>>,
    ) -> Result<(), PrefsError> {
        self.store().put_string_set(key, values).await
    }

    pub async fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.store().get_i32(key, default).await
    }

    pub async fn put_i32(&self, key: &str, value: i32) -> Result<(), PrefsError> {
        self.store().put_i32(key, value).await
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.store().get_i64(key, default).await
    }

    pub async fn put_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.store().put_i64(key, value).await
    }

    pub async fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.store().get_f32(key, default).await
    }

    pub async fn put_f32(&self, key: &str, value: f32) -> Result<(), PrefsError> {
        self.store().put_f32(key, value).await
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.store().get_f64(key, default).await
    }

    pub async fn put_f64(&self, key: &str, value: f64) -> Result<(), PrefsError> {
        self.store().put_f64(key, value).await
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.store().get_bool(key, default).await
    }

    pub async fn put_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.store().put_bool(key, value).await
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.store().get_bytes(key).await
    }

    pub async fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), PrefsError> {
        self.store().put_bytes(key, value).await
    }

    pub async fn get_enum<E, F>(&self, key: &str, default: E, from_name: F) -> E
    where
        F: FnOnce(&str) -> Option<E>,
    {
        self.store().get_enum(key, default, from_name).await
    }

    pub async fn put_enum<E: AsRef<str>>(&self, key: &str, value: E) -> Result<(), PrefsError> {
        self.store().put_enum(key, value).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        self.store().contains(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.store().remove(key).await
    }

    pub async fn clear(&self) -> Result<(), PrefsError> {
        self.store().clear().await
    }
}
