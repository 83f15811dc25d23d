use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use uu_storage::{
    file_prefs::FilePreferences, key_provider::KeyringKeyProvider, secure_prefs::SecurePrefs,
};
use tracing::debug;

/// Encrypted preferences backed by a JSON file and the OS keychain.
pub type Prefs = SecurePrefs<FilePreferences, KeyringKeyProvider>;

/// Process-wide preferences instance; initialized on first use by [`prefs`].
static PREFS: Prefs = SecurePrefs::new();

/// Resolve the default data directory for UU.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("uu"))
}

fn data_dir_for(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// The process-wide preferences, initialized from `config` if needed.
pub fn prefs(config: &Config) -> Result<&'static Prefs> {
    if !PREFS.is_initialized() {
        let root = data_dir_for(config)?;
        debug!(?root, store = config.store_name(), "initializing encrypted preferences");
        PREFS.init(
            config.store_name(),
            FilePreferences::open(root, config.store_name()),
            KeyringKeyProvider::new(config.keyring_service()),
        );
    }
    Ok(&PREFS)
}

/// Helper for tests to build preferences rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_prefs(
    root: impl Into<PathBuf>,
) -> SecurePrefs<FilePreferences, uu_storage::key_provider::InMemoryKeyProvider> {
    let prefs = SecurePrefs::new();
    prefs.init(
        "test-prefs",
        FilePreferences::open(root.into(), "test-prefs"),
        uu_storage::key_provider::InMemoryKeyProvider::new(),
    );
    prefs
}
