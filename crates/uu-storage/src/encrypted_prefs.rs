use std::{collections::BTreeSet, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{instrument, warn};
use uu_core::prefs::{KeyValueStore, PrefsError};

use crate::{
    crypto::{CryptoError, GcmCrypto},
    key_provider::SecretKeyProvider,
};

/// Preference store that encrypts every value before handing it to a plain delegate.
///
/// Keys pass through untouched; values are stored as base64 GCM envelopes sealed
/// under `alias`. Reads never fail operationally: anything absent, corrupt or
/// tampered with comes back as the caller's default.
pub struct EncryptedKeyValueStore<S: KeyValueStore, P: SecretKeyProvider> {
    delegate: S,
    crypto: GcmCrypto<P>,
    alias: String,
}

impl<S: KeyValueStore, P: SecretKeyProvider> EncryptedKeyValueStore<S, P> {
    pub fn new(delegate: S, crypto: GcmCrypto<P>, alias: impl Into<String>) -> Self {
        Self {
            delegate,
            crypto,
            alias: alias.into(),
        }
    }

    /// The plain store holding ciphertext.
    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Store `value`, or remove the key when `value` is `None`.
    pub async fn put_string(&self, key: &str, value: Option<&str>) -> Result<(), PrefsError> {
        match value {
            Some(value) => self.put_sealed(key, value.as_bytes()).await,
            None => self.delegate.remove(key).await,
        }
    }

    /// Decrypted string, distinguishing "absent" from "unreadable".
    pub async fn try_get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        match self.read_sealed(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| invalid(key, e)),
            None => Ok(None),
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        or_default(key, self.try_get_string(key).await, default.to_string())
    }

    /// Store a set, or remove the key when `values` is `None`.
    pub async fn put_string_set(
        &self,
        key: &str,
        values: Option<&BTreeSet<String>>,
    ) -> Result<(), PrefsError> {
        match values {
            Some(values) => self.put_sealed(key, &encode_string_set(values)).await,
            None => self.delegate.remove(key).await,
        }
    }

    pub async fn try_get_string_set(
        &self,
        key: &str,
    ) -> Result<Option<BTreeSet<String>>, PrefsError> {
        match self.read_sealed(key).await? {
            Some(bytes) => decode_string_set(&bytes)
                .map(Some)
                .map_err(|reason| invalid(key, reason)),
            None => Ok(None),
        }
    }

    pub async fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> BTreeSet<String> {
        or_default(key, self.try_get_string_set(key).await, default)
    }

    pub async fn put_i32(&self, key: &str, value: i32) -> Result<(), PrefsError> {
        self.put_display(key, value).await
    }

    pub async fn get_i32(&self, key: &str, default: i32) -> i32 {
        or_default(key, self.try_get_parsed(key).await, default)
    }

    pub async fn put_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.put_display(key, value).await
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        or_default(key, self.try_get_parsed(key).await, default)
    }

    pub async fn put_f32(&self, key: &str, value: f32) -> Result<(), PrefsError> {
        self.put_display(key, value).await
    }

    pub async fn get_f32(&self, key: &str, default: f32) -> f32 {
        or_default(key, self.try_get_parsed(key).await, default)
    }

    /// Stored as the IEEE-754 bit pattern so every value, NaN and -0.0
    /// included, reads back bit-for-bit.
    pub async fn put_f64(&self, key: &str, value: f64) -> Result<(), PrefsError> {
        self.put_i64(key, value.to_bits() as i64).await
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        let bits = self.try_get_parsed::<i64>(key).await;
        or_default(key, bits.map(|b| b.map(|b| f64::from_bits(b as u64))), default)
    }

    pub async fn put_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.put_display(key, value).await
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        or_default(key, self.try_get_parsed(key).await, default)
    }

    pub async fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), PrefsError> {
        self.put_sealed(key, value).await
    }

    pub async fn try_get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, PrefsError> {
        self.read_sealed(key).await
    }

    /// Decrypted bytes, or `None` when absent or unreadable.
    pub async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        or_default(key, self.try_get_bytes(key).await.map(|b| b.map(Some)), None)
    }

    /// Store an enum by its name.
    pub async fn put_enum<E: AsRef<str>>(&self, key: &str, value: E) -> Result<(), PrefsError> {
        self.put_sealed(key, value.as_ref().as_bytes()).await
    }

    /// Read an enum name and map it back with `from_name`; names it does
    /// not recognise yield `default`.
    pub async fn get_enum<E, F>(&self, key: &str, default: E, from_name: F) -> E
    where
        F: FnOnce(&str) -> Option<E>,
    {
        match self.try_get_string(key).await {
            Ok(Some(name)) => from_name(&name).unwrap_or(default),
            other => or_default(key, other.map(|_| None), default),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.delegate.remove(key).await
    }

    #[instrument(skip_all, fields(alias = %self.alias))]
    pub async fn clear(&self) -> Result<(), PrefsError> {
        self.delegate.clear().await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        self.delegate.contains(key).await
    }

    /// Bulk export is refused: it would decrypt every value at once.
    pub async fn get_all(&self) -> Result<Vec<(String, String)>, PrefsError> {
        Err(PrefsError::Unsupported {
            operation: "get_all",
        })
    }

    async fn put_display<T: ToString>(&self, key: &str, value: T) -> Result<(), PrefsError> {
        self.put_sealed(key, value.to_string().as_bytes()).await
    }

    async fn try_get_parsed<T>(&self, key: &str) -> Result<Option<T>, PrefsError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.try_get_string(key).await? {
            Some(raw) => raw.parse().map(Some).map_err(|e| invalid(key, e)),
            None => Ok(None),
        }
    }

    /// On encryption failure the previous entry is dropped as well, so a
    /// later read sees the default rather than a stale value.
    #[instrument(skip_all, fields(key = %key))]
    async fn put_sealed(&self, key: &str, plaintext: &[u8]) -> Result<(), PrefsError> {
        let sealed = self
            .crypto
            .encrypt(Some(plaintext), &self.alias)
            .await
            .map_err(crypto_err);

        match sealed {
            Ok(envelope) => {
                let stored = STANDARD.encode(envelope.unwrap_or_default());
                self.delegate.put_string(key, &stored).await
            }
            Err(err) => {
                warn!(error = %err, "encryption failed, dropping stored value");
                if let Err(remove_err) = self.delegate.remove(key).await {
                    warn!(error = %remove_err, "could not drop stored value");
                }
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn read_sealed(&self, key: &str) -> Result<Option<Vec<u8>>, PrefsError> {
        let Some(stored) = self.delegate.get_string(key).await? else {
            return Ok(None);
        };
        let envelope = STANDARD.decode(stored).map_err(|e| invalid(key, e))?;
        let plaintext = self
            .crypto
            .decrypt(Some(envelope.as_slice()), &self.alias)
            .await
            .map_err(crypto_err)?;
        Ok(Some(plaintext.unwrap_or_default()))
    }
}

fn or_default<T>(key: &str, result: Result<Option<T>, PrefsError>, default: T) -> T {
    match result {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(err) => {
            warn!(key, error = %err, "unreadable preference, using default");
            default
        }
    }
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> PrefsError {
    PrefsError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn crypto_err(err: CryptoError) -> PrefsError {
    PrefsError::Crypto {
        reason: err.to_string(),
    }
}

/// `[count: i32 LE]` then `[len: i32 LE][utf-8 bytes]` per item.
fn encode_string_set(values: &BTreeSet<String>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.iter().map(|v| 4 + v.len()).sum::<usize>());
    out.extend_from_slice(&(values.len() as i32).to_le_bytes());
    for value in values {
        out.extend_from_slice(&(value.len() as i32).to_le_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

fn decode_string_set(mut bytes: &[u8]) -> Result<BTreeSet<String>, String> {
    let count = read_len(&mut bytes)?;
    let mut values = BTreeSet::new();
    for _ in 0..count {
        let len = read_len(&mut bytes)?;
        if len > bytes.len() {
            return Err(format!("item length {len} exceeds remaining {}", bytes.len()));
        }
        let (item, rest) = bytes.split_at(len);
        values.insert(String::from_utf8(item.to_vec()).map_err(|e| e.to_string())?);
        bytes = rest;
    }
    if !bytes.is_empty() {
        return Err(format!("{} trailing bytes", bytes.len()));
    }
    Ok(values)
}

fn read_len<'a>(bytes: &mut &'a [u8]) -> Result<usize, String> {
    let current: &'a [u8] = *bytes;
    let (prefix, rest) = current
        .split_first_chunk::<4>()
        .ok_or_else(|| "truncated length prefix".to_string())?;
    let len = i32::from_le_bytes(*prefix);
    *bytes = rest;
    usize::try_from(len).map_err(|_| format!("negative length {len}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uu_core::prefs::{InMemoryKeyValueStore, PrefValue};

    use super::*;
    use crate::key_provider::{InMemoryKeyProvider, KeyError, KeyMaterial};

    fn store() -> EncryptedKeyValueStore<InMemoryKeyValueStore, InMemoryKeyProvider> {
        EncryptedKeyValueStore::new(
            InMemoryKeyValueStore::new(),
            GcmCrypto::new(InMemoryKeyProvider::new()),
            "prefs",
        )
    }

    #[derive(Debug, PartialEq, Clone, Copy)]
    enum Theme {
        Light,
        Dark,
    }

    impl AsRef<str> for Theme {
        fn as_ref(&self) -> &str {
            match self {
                Theme::Light => "Light",
                Theme::Dark => "Dark",
            }
        }
    }

    fn theme_from_name(name: &str) -> Option<Theme> {
        match name {
            "Light" => Some(Theme::Light),
            "Dark" => Some(Theme::Dark),
            _ => None,
        }
    }

    #[tokio::test]
    async fn int_round_trips_and_missing_uses_default() {
        let prefs = store();
        prefs.put_i32("int", 42).await.expect("put");
        assert_eq!(prefs.get_i32("int", -1).await, 42);
        assert_eq!(prefs.get_i32("missing", 7).await, 7);
    }

    #[tokio::test]
    async fn delegate_never_sees_plaintext() {
        let prefs = store();
        let secret = "correct horse battery staple";
        prefs.put_string("pw", Some(secret)).await.expect("put");

        let raw = prefs
            .delegate()
            .get_string("pw")
            .await
            .expect("raw read")
            .expect("raw value present");
        assert_ne!(raw, secret);
        assert_ne!(raw, STANDARD.encode(secret));
        assert_eq!(prefs.get_string("pw", "").await, secret);
    }

    #[tokio::test]
    async fn none_removes_the_entry() {
        let prefs = store();
        prefs.put_string("k", Some("v")).await.expect("put");
        prefs.put_string("k", None).await.expect("remove via none");
        assert!(!prefs.contains("k").await.expect("contains"));
        assert_eq!(prefs.get_string("k", "fallback").await, "fallback");
    }

    #[tokio::test]
    async fn empty_string_round_trips() {
        let prefs = store();
        prefs.put_string("empty", Some("")).await.expect("put");
        assert_eq!(
            prefs.try_get_string("empty").await.expect("read"),
            Some(String::new())
        );
    }

    #[tokio::test]
    async fn string_sets_round_trip() {
        let prefs = store();
        let set: BTreeSet<String> = ["alpha", "", "gamma \u{1F600}"]
            .into_iter()
            .map(String::from)
            .collect();
        prefs.put_string_set("set", Some(&set)).await.expect("put");
        assert_eq!(prefs.get_string_set("set", BTreeSet::new()).await, set);

        let empty = BTreeSet::new();
        prefs.put_string_set("none", Some(&empty)).await.expect("put");
        assert_eq!(
            prefs.try_get_string_set("none").await.expect("read"),
            Some(empty)
        );
    }

    #[tokio::test]
    async fn doubles_round_trip_bit_exact() {
        let prefs = store();
        for value in [0.1, -0.0, f64::MAX, f64::MIN_POSITIVE, f64::INFINITY, f64::NAN] {
            prefs.put_f64("d", value).await.expect("put");
            let back = prefs.get_f64("d", 1.5).await;
            assert_eq!(back.to_bits(), value.to_bits());
        }
    }

    #[tokio::test]
    async fn other_primitives_round_trip() {
        let prefs = store();
        prefs.put_i64("long", i64::MIN).await.unwrap();
        prefs.put_f32("float", -0.0).await.unwrap();
        prefs.put_bool("flag", true).await.unwrap();
        prefs.put_bytes("blob", &[0, 1, 2, 255]).await.unwrap();

        assert_eq!(prefs.get_i64("long", 0).await, i64::MIN);
        assert_eq!(prefs.get_f32("float", 1.0).await.to_bits(), (-0.0f32).to_bits());
        assert!(prefs.get_bool("flag", false).await);
        assert_eq!(prefs.get_bytes("blob").await, Some(vec![0, 1, 2, 255]));
        assert_eq!(prefs.get_bytes("nothing").await, None);
    }

    #[tokio::test]
    async fn wrong_type_falls_back_to_default() {
        let prefs = store();
        prefs.put_string("word", Some("not a number")).await.unwrap();
        assert_eq!(prefs.get_i32("word", 5).await, 5);
        assert!(matches!(
            prefs.try_get_string_set("word").await,
            Err(PrefsError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn enums_map_names_with_fallback() {
        let prefs = store();
        prefs.put_enum("theme", Theme::Dark).await.unwrap();
        assert_eq!(
            prefs.get_enum("theme", Theme::Light, theme_from_name).await,
            Theme::Dark
        );

        prefs.put_string("theme", Some("Sepia")).await.unwrap();
        assert_eq!(
            prefs.get_enum("theme", Theme::Light, theme_from_name).await,
            Theme::Light
        );
    }

    #[tokio::test]
    async fn tampered_values_read_as_default() {
        let prefs = store();
        prefs.put_string("k", Some("value")).await.unwrap();

        let raw = prefs.delegate().get_string("k").await.unwrap().unwrap();
        let mut bytes = STANDARD.decode(raw).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        prefs
            .delegate()
            .put_string("k", &STANDARD.encode(bytes))
            .await
            .unwrap();

        assert_eq!(prefs.get_string("k", "default").await, "default");
        assert!(matches!(
            prefs.try_get_string("k").await,
            Err(PrefsError::Crypto { .. })
        ));

        prefs.delegate().put_string("k", "%%not base64%%").await.unwrap();
        assert_eq!(prefs.get_string("k", "default").await, "default");
    }

    struct FailingKeys;

    #[async_trait::async_trait]
    impl SecretKeyProvider for FailingKeys {
        async fn load_key(&self, _alias: &str, _bits: u32) -> Result<KeyMaterial, KeyError> {
            Err(KeyError::Keyring("no keystore".into()))
        }
    }

    #[tokio::test]
    async fn encryption_failure_is_reported_and_drops_old_value() {
        let delegate = InMemoryKeyValueStore::new();
        delegate.put_string("k", "stale").await.unwrap();
        let prefs = EncryptedKeyValueStore::new(delegate, GcmCrypto::new(FailingKeys), "prefs");

        let err = prefs
            .put_string("k", Some("new"))
            .await
            .expect_err("encrypt should fail");
        assert!(matches!(err, PrefsError::Crypto { .. }));
        assert!(!prefs.contains("k").await.unwrap());
    }

    /// Delegate whose `remove` always fails.
    struct StuckStore(InMemoryKeyValueStore);

    #[async_trait::async_trait]
    impl KeyValueStore for StuckStore {
        async fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
            self.0.get_string(key).await
        }

        async fn put_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
            self.0.put_string(key, value).await
        }

        async fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PrefsError> {
            self.0.get_string_set(key).await
        }

        async fn put_string_set(
            &self,
            key: &str,
            values: &BTreeSet<String>,
        ) -> Result<(), PrefsError> {
            self.0.put_string_set(key, values).await
        }

        async fn remove(&self, _key: &str) -> Result<(), PrefsError> {
            Err(PrefsError::Storage {
                reason: "read-only".into(),
            })
        }

        async fn clear(&self) -> Result<(), PrefsError> {
            self.0.clear().await
        }

        async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
            self.0.contains(key).await
        }

        async fn entries(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
            self.0.entries().await
        }
    }

    #[tokio::test]
    async fn encryption_failure_wins_over_cleanup_failure() {
        let prefs = EncryptedKeyValueStore::new(
            StuckStore(InMemoryKeyValueStore::new()),
            GcmCrypto::new(FailingKeys),
            "prefs",
        );

        let err = prefs
            .put_string("k", Some("new"))
            .await
            .expect_err("encrypt should fail");
        assert!(matches!(err, PrefsError::Crypto { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn bulk_export_is_refused() {
        let prefs = store();
        prefs.put_i32("a", 1).await.unwrap();
        assert_eq!(
            prefs.get_all().await,
            Err(PrefsError::Unsupported {
                operation: "get_all"
            })
        );
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let prefs = store();
        prefs.put_i32("a", 1).await.unwrap();
        prefs.put_bool("b", true).await.unwrap();
        prefs.clear().await.unwrap();
        assert!(!prefs.contains("a").await.unwrap());
        assert!(!prefs.contains("b").await.unwrap());
    }

    #[test]
    fn string_set_decoder_rejects_garbage() {
        assert!(decode_string_set(&[]).is_err());
        assert!(decode_string_set(&[1, 0, 0, 0, 9, 0, 0, 0, b'a']).is_err());
        assert!(decode_string_set(&[0, 0, 0, 0, 1]).is_err());
        assert_eq!(decode_string_set(&[0, 0, 0, 0]), Ok(BTreeSet::new()));
    }
}
