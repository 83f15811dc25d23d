//! Encrypted preference storage.
//! Values are sealed with AES-GCM under keys held by the OS keyring (or test
//! doubles) and written through a plain `KeyValueStore` delegate.

pub mod crypto;
pub mod encrypted_prefs;
pub mod file_prefs;
pub mod key_provider;
pub mod secure_prefs;
