//! AES-GCM envelope encryption keyed by alias.
//!
//! Envelope layout: `[iv_len: i32 LE][iv: iv_len bytes][ciphertext + tag]`.
//! Every call to [`GcmCrypto::encrypt`] draws a fresh IV, so the same
//! plaintext never produces the same envelope twice.

use aes_gcm::{
    aead::{consts::U16, Aead, AeadCore, KeyInit, Nonce, OsRng},
    aes::{Aes128, Aes256},
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use thiserror::Error;
use tracing::instrument;

use crate::key_provider::{KeyError, SecretKeyProvider, DEFAULT_KEY_SIZE_BITS};

/// IV length used for new envelopes.
pub const IV_LEN: usize = 12;

const LEN_PREFIX: usize = 4;

type Aes128Gcm16 = AesGcm<Aes128, U16>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key for the alias could not be loaded or created.
    #[error("key unavailable: {0}")]
    Key(#[from] KeyError),
    /// Input is not a well-formed envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    /// Cipher setup or encryption failed.
    #[error("cipher failure: {reason}")]
    Cipher { reason: String },
    /// Tag check failed: the data was tampered with or sealed under another key.
    #[error("authentication failed")]
    Authentication,
}

/// Encrypts and decrypts byte buffers into self-describing GCM envelopes.
pub struct GcmCrypto<P: SecretKeyProvider> {
    key_provider: P,
    key_size_bits: u32,
}

impl<P: SecretKeyProvider> GcmCrypto<P> {
    pub fn new(key_provider: P) -> Self {
        Self::with_key_size(key_provider, DEFAULT_KEY_SIZE_BITS)
    }

    /// Use `key_size_bits` when a key has to be generated for an alias.
    pub fn with_key_size(key_provider: P, key_size_bits: u32) -> Self {
        Self {
            key_provider,
            key_size_bits,
        }
    }

    /// Seal `plaintext` under the key for `alias`.
    ///
    /// `None` and empty input pass through untouched.
    #[instrument(skip_all, fields(alias = %alias))]
    pub async fn encrypt(
        &self,
        plaintext: Option<&[u8]>,
        alias: &str,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let plaintext = match plaintext {
            None => return Ok(None),
            Some(bytes) if bytes.is_empty() => return Ok(Some(Vec::new())),
            Some(bytes) => bytes,
        };

        let key = self.key_provider.load_key(alias, self.key_size_bits).await?;
        let (iv, ciphertext) = match key.bytes().len() {
            16 => seal::<Aes128Gcm>(key.bytes(), plaintext)?,
            _ => seal::<Aes256Gcm>(key.bytes(), plaintext)?,
        };
        Ok(Some(encode_envelope(&iv, &ciphertext)))
    }

    /// Open an envelope produced by [`GcmCrypto::encrypt`] with the same alias.
    ///
    /// `None` and empty input pass through untouched.
    #[instrument(skip_all, fields(alias = %alias))]
    pub async fn decrypt(
        &self,
        envelope: Option<&[u8]>,
        alias: &str,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let envelope = match envelope {
            None => return Ok(None),
            Some(bytes) if bytes.is_empty() => return Ok(Some(Vec::new())),
            Some(bytes) => bytes,
        };

        let (iv, ciphertext) = decode_envelope(envelope)?;
        let key = self.key_provider.load_key(alias, self.key_size_bits).await?;
        let plaintext = match (key.bytes().len(), iv.len()) {
            (16, IV_LEN) => open::<Aes128Gcm>(key.bytes(), iv, ciphertext)?,
            (16, 16) => open::<Aes128Gcm16>(key.bytes(), iv, ciphertext)?,
            (_, IV_LEN) => open::<Aes256Gcm>(key.bytes(), iv, ciphertext)?,
            (_, 16) => open::<Aes256Gcm16>(key.bytes(), iv, ciphertext)?,
            (_, other) => {
                return Err(CryptoError::MalformedEnvelope {
                    reason: format!("unsupported iv length {other}"),
                })
            }
        };
        Ok(Some(plaintext))
    }
}

/// Frame an IV and ciphertext into the envelope wire format.
pub fn encode_envelope(iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + iv.len() + ciphertext.len());
    out.extend_from_slice(&(iv.len() as i32).to_le_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(ciphertext);
    out
}

/// Split an envelope into `(iv, ciphertext)` without decrypting.
pub fn decode_envelope(envelope: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    let (prefix, rest) = envelope
        .split_first_chunk::<LEN_PREFIX>()
        .ok_or_else(|| malformed(format!("{} bytes is too short", envelope.len())))?;

    let iv_len = i32::from_le_bytes(*prefix);
    if iv_len <= 0 {
        return Err(malformed(format!("invalid iv length {iv_len}")));
    }
    let iv_len = iv_len as usize;
    if iv_len > rest.len() {
        return Err(malformed(format!(
            "iv length {iv_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }
    Ok(rest.split_at(iv_len))
}

fn seal<C>(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|e| CryptoError::Cipher {
        reason: format!("cipher init failed: {e}"),
    })?;
    let nonce = C::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Cipher {
            reason: format!("encrypt failed: {e}"),
        })?;
    Ok((nonce.to_vec(), ciphertext))
}

fn open<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|e| CryptoError::Cipher {
        reason: format!("cipher init failed: {e}"),
    })?;
    let nonce = Nonce::<C>::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

fn malformed(reason: String) -> CryptoError {
    CryptoError::MalformedEnvelope { reason }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::key_provider::{InMemoryKeyProvider, KeyMaterial};

    /// Always hands out the same key, whatever the alias.
    struct FixedKeyProvider;

    #[async_trait]
    impl SecretKeyProvider for FixedKeyProvider {
        async fn load_key(&self, alias: &str, _bits: u32) -> Result<KeyMaterial, KeyError> {
            KeyMaterial::new(alias, vec![7u8; 32])
        }
    }

    struct BrokenKeyProvider;

    #[async_trait]
    impl SecretKeyProvider for BrokenKeyProvider {
        async fn load_key(&self, _alias: &str, _bits: u32) -> Result<KeyMaterial, KeyError> {
            Err(KeyError::Keyring("keystore locked".into()))
        }
    }

    #[tokio::test]
    async fn hello_world_round_trips() {
        let crypto = GcmCrypto::new(FixedKeyProvider);
        let plaintext = "Hello, world!".as_bytes();

        let sealed = crypto
            .encrypt(Some(plaintext), "test")
            .await
            .expect("encrypt")
            .expect("some envelope");
        assert_ne!(sealed.as_slice(), plaintext);

        let opened = crypto
            .decrypt(Some(sealed.as_slice()), "test")
            .await
            .expect("decrypt")
            .expect("some plaintext");
        assert_eq!(opened.len(), 13);
        assert_eq!(opened, plaintext);
    }

    #[tokio::test]
    async fn none_and_empty_pass_through() {
        let crypto = GcmCrypto::new(FixedKeyProvider);
        assert_eq!(crypto.encrypt(None, "a").await.unwrap(), None);
        assert_eq!(crypto.decrypt(None, "a").await.unwrap(), None);
        assert_eq!(crypto.encrypt(Some(&[][..]), "a").await.unwrap(), Some(vec![]));
        assert_eq!(crypto.decrypt(Some(&[][..]), "a").await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn envelope_layout_is_length_prefixed_iv() {
        let crypto = GcmCrypto::new(FixedKeyProvider);
        let sealed = crypto
            .encrypt(Some(&b"payload"[..]), "a")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&sealed[..4], &[12, 0, 0, 0]);
        // 4 byte prefix + 12 byte iv + plaintext + 16 byte tag
        assert_eq!(sealed.len(), 4 + 12 + 7 + 16);
    }

    #[tokio::test]
    async fn fresh_iv_per_call() {
        let crypto = GcmCrypto::new(FixedKeyProvider);
        let first = crypto.encrypt(Some(&b"same"[..]), "a").await.unwrap().unwrap();
        let second = crypto.encrypt(Some(&b"same"[..]), "a").await.unwrap().unwrap();
        assert_ne!(first[4..16], second[4..16]);
    }

    #[tokio::test]
    async fn round_trips_with_128_bit_keys() {
        let crypto = GcmCrypto::with_key_size(InMemoryKeyProvider::new(), 128);
        let sealed = crypto.encrypt(Some(&b"short key"[..]), "k").await.unwrap();
        let opened = crypto.decrypt(sealed.as_deref(), "k").await.unwrap();
        assert_eq!(opened.as_deref(), Some(&b"short key"[..]));
    }

    #[tokio::test]
    async fn opens_envelopes_with_16_byte_iv() {
        let key = [7u8; 32];
        let iv = [3u8; 16];
        let cipher = Aes256Gcm16::new_from_slice(&key).unwrap();
        let ciphertext = cipher
            .encrypt(Nonce::<Aes256Gcm16>::from_slice(&iv), &b"legacy"[..])
            .unwrap();
        let envelope = encode_envelope(&iv, &ciphertext);

        let crypto = GcmCrypto::new(FixedKeyProvider);
        let opened = crypto.decrypt(Some(envelope.as_slice()), "a").await.unwrap();
        assert_eq!(opened.as_deref(), Some(&b"legacy"[..]));
    }

    #[tokio::test]
    async fn rejects_short_and_overlong_envelopes() {
        let crypto = GcmCrypto::new(FixedKeyProvider);

        let err = crypto.decrypt(Some(&[1, 0, 0][..]), "a").await.unwrap_err();
        assert!(matches!(err, CryptoError::MalformedEnvelope { .. }));

        let mut overlong = 40i32.to_le_bytes().to_vec();
        overlong.extend_from_slice(&[0u8; 20]);
        let err = crypto.decrypt(Some(overlong.as_slice()), "a").await.unwrap_err();
        assert!(matches!(err, CryptoError::MalformedEnvelope { .. }));

        let negative = (-1i32).to_le_bytes();
        let err = crypto.decrypt(Some(&negative[..]), "a").await.unwrap_err();
        assert!(matches!(err, CryptoError::MalformedEnvelope { .. }));
    }

    #[tokio::test]
    async fn tampering_fails_authentication() {
        let crypto = GcmCrypto::new(FixedKeyProvider);
        let mut sealed = crypto.encrypt(Some(&b"secret"[..]), "a").await.unwrap().unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = crypto.decrypt(Some(sealed.as_slice()), "a").await.unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[tokio::test]
    async fn wrong_alias_fails_authentication() {
        let crypto = GcmCrypto::new(InMemoryKeyProvider::new());
        let sealed = crypto.encrypt(Some(&b"secret"[..]), "one").await.unwrap();
        let err = crypto.decrypt(sealed.as_deref(), "two").await.unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[tokio::test]
    async fn key_failures_surface_as_errors() {
        let crypto = GcmCrypto::new(BrokenKeyProvider);
        let err = crypto.encrypt(Some(&b"x"[..]), "a").await.unwrap_err();
        assert!(matches!(err, CryptoError::Key(KeyError::Keyring(_))));
    }

    #[test]
    fn decode_splits_iv_from_ciphertext() {
        let envelope = encode_envelope(&[9, 9], &[1, 2, 3]);
        assert_eq!(envelope, vec![2, 0, 0, 0, 9, 9, 1, 2, 3]);
        let (iv, ciphertext) = decode_envelope(&envelope).unwrap();
        assert_eq!(iv, &[9, 9]);
        assert_eq!(ciphertext, &[1, 2, 3]);
    }
}
