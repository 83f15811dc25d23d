use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::debug;

/// Key size used when callers do not ask for one.
pub const DEFAULT_KEY_SIZE_BITS: u32 = 256;

/// Symmetric key material bound to an alias.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Alias the key is stored under (safe to log).
    pub alias: String,
    /// 128- or 256-bit AES key.
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(alias: impl Into<String>, bytes: Vec<u8>) -> Result<Self, KeyError> {
        check_len(bytes.len())?;
        Ok(Self {
            alias: alias.into(),
            bytes,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size_bits(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("alias", &self.alias)
            .field("bytes", &format_args!("[{} bits redacted]", self.size_bits()))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Supplies symmetric keys by alias (OS keychain in production; memory in tests).
///
/// The same alias must always resolve to the same key once created.
#[async_trait]
pub trait SecretKeyProvider: Send + Sync {
    /// Return the key stored under `alias`, generating and persisting a
    /// `key_size_bits` key first if none exists.
    async fn load_key(&self, alias: &str, key_size_bits: u32) -> Result<KeyMaterial, KeyError>;
}

/// OS keyring-backed provider. Each alias is a keyring account under `service`.
pub struct KeyringKeyProvider {
    service: String,
}

impl KeyringKeyProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl SecretKeyProvider for KeyringKeyProvider {
    async fn load_key(&self, alias: &str, key_size_bits: u32) -> Result<KeyMaterial, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        let entry = keyring::Entry::new(&self.service, alias)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(secret) => return decode_key(alias, &secret),
            Err(keyring::Error::NoEntry) => {}
            Err(err) => return Err(KeyError::Keyring(err.to_string())),
        }

        let material = generate_key(alias, key_size_bits)?;
        entry
            .set_password(&encode_key(&material))
            .map_err(|e| KeyError::Keyring(e.to_string()))?;
        debug!(alias, bits = key_size_bits, "generated keyring key");
        Ok(material)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
/// Clones share the same keys.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<HashMap<String, KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretKeyProvider for InMemoryKeyProvider {
    async fn load_key(&self, alias: &str, key_size_bits: u32) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.get(alias) {
            return Ok(existing.clone());
        }

        let material = generate_key(alias, key_size_bits)?;
        guard.insert(alias.to_string(), material.clone());
        Ok(material)
    }
}

fn check_len(len: usize) -> Result<(), KeyError> {
    match len {
        16 | 32 => Ok(()),
        other => Err(KeyError::Generation(format!(
            "unsupported key size: {} bits",
            other * 8
        ))),
    }
}

fn generate_key(alias: &str, key_size_bits: u32) -> Result<KeyMaterial, KeyError> {
    if key_size_bits % 8 != 0 {
        return Err(KeyError::Generation(format!(
            "unsupported key size: {key_size_bits} bits"
        )));
    }
    let len = (key_size_bits / 8) as usize;
    check_len(len)?;

    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial::new(alias, bytes)
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(&material.bytes)
}

fn decode_key(alias: &str, secret: &str) -> Result<KeyMaterial, KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if check_len(bytes.len()).is_err() {
        return Err(KeyError::Decode(format!(
            "expected 16 or 32 bytes, got {}",
            bytes.len()
        )));
    }
    KeyMaterial::new(alias, bytes)
}
