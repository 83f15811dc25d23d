use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};
use uu_core::prefs::{wrong_shape, KeyValueStore, PrefValue, PrefsError};

/// Plain preference store persisted as one JSON document per store name.
///
/// Every mutation rewrites the document atomically through a temp file in
/// the same directory. The in-process mutex serializes read-modify-write.
pub struct FilePreferences {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FilePreferences {
    pub fn open(root: impl AsRef<Path>, store_name: &str) -> Self {
        let path = root
            .as_ref()
            .join(format!("{}.json", sanitize_name(store_name)));
        debug!(?path, "opening preference file");
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, PrefsError> {
        self.guard.lock().map_err(|err| PrefsError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }

    fn update<F>(&self, mutate: F) -> Result<(), PrefsError>
    where
        F: FnOnce(&mut Document),
    {
        let _guard = self.lock()?;
        let mut doc = read_document(&self.path)?;
        mutate(&mut doc);
        write_document(&self.path, &doc)
    }

    fn snapshot(&self) -> Result<Document, PrefsError> {
        let _guard = self.lock()?;
        read_document(&self.path)
    }
}

type Document = BTreeMap<String, StoredValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
enum StoredValue {
    String(String),
    StringSet(BTreeSet<String>),
}

impl From<StoredValue> for PrefValue {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::String(s) => PrefValue::String(s),
            StoredValue::StringSet(set) => PrefValue::StringSet(set),
        }
    }
}

#[async_trait]
impl KeyValueStore for FilePreferences {
    async fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        match self.snapshot()?.remove(key) {
            None => Ok(None),
            Some(StoredValue::String(value)) => Ok(Some(value)),
            Some(StoredValue::StringSet(_)) => Err(wrong_shape(key, "string set")),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.update(|doc| {
            doc.insert(key.to_string(), StoredValue::String(value.to_string()));
        })
    }

    async fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PrefsError> {
        match self.snapshot()?.remove(key) {
            None => Ok(None),
            Some(StoredValue::StringSet(values)) => Ok(Some(values)),
            Some(StoredValue::String(_)) => Err(wrong_shape(key, "string")),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put_string_set(
        &self,
        key: &str,
        values: &BTreeSet<String>,
    ) -> Result<(), PrefsError> {
        self.update(|doc| {
            doc.insert(key.to_string(), StoredValue::StringSet(values.clone()));
        })
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.update(|doc| {
            doc.remove(key);
        })
    }

    #[instrument(skip_all)]
    async fn clear(&self) -> Result<(), PrefsError> {
        let _guard = self.lock()?;
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.snapshot()?.contains_key(key))
    }

    async fn entries(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .map(|(k, v)| (k, v.into()))
            .collect())
    }
}

fn read_document(path: &Path) -> Result<Document, PrefsError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    if buf.is_empty() {
        return Ok(Document::new());
    }
    serde_json::from_slice(&buf).map_err(storage_err)
}

fn write_document(path: &Path, doc: &Document) -> Result<(), PrefsError> {
    let parent = path.parent().ok_or_else(|| PrefsError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec_pretty(doc).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn sanitize_name(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name)
}

fn storage_err<E: ToString>(err: E) -> PrefsError {
    PrefsError::Storage {
        reason: err.to_string(),
    }
}
