//! Durable key-value storage for the refresh token
//!
//! The token store only ever touches one key, but the collaborator interface
//! is a generic `get`/`set`/`remove` so hosts can plug in whatever they
//! already persist settings with. Two backends ship here:
//!
//! - `MemoryStorage`: process-local map, nothing survives a restart
//! - `FileStorage`: JSON map in one file, atomic temp-file + rename writes

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable key-value collaborator.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeyValueStorage>`).
pub trait KeyValueStorage: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()>;

    /// Removing an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()>;
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated storage, e.g. to simulate a restart with a persisted token.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .lock()
                .await
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

/// File-backed storage.
///
/// The whole map is rewritten on every mutation. A tokio Mutex serializes
/// writers; reads are served from the in-memory copy loaded at startup. The
/// in-memory copy only changes once the file write succeeded, so memory and
/// disk never disagree.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Load the map from `path`, creating it as `{}` if it does not exist.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading {}: {e}", path.display())))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing {}: {e}", path.display())))?;
            info!(path = %path.display(), keys = entries.len(), "loaded session storage");
            entries
        } else {
            info!(path = %path.display(), "session storage not found, starting empty");
            let entries = BTreeMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStorage for FileStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let mut updated = entries.clone();
            updated.insert(key.to_owned(), value.to_owned());
            write_atomic(&self.path, &updated).await?;
            *entries = updated;
            debug!(key, "stored value");
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if !entries.contains_key(key) {
                return Ok(());
            }
            let mut updated = entries.clone();
            updated.remove(key);
            write_atomic(&self.path, &updated).await?;
            *entries = updated;
            debug!(key, "removed value");
            Ok(())
        })
    }
}

/// Write the map to `path` atomically with 0600 permissions on unix.
async fn write_atomic(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::Storage(format!("serializing session storage: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("storage path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp storage file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting storage file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp storage file: {e}")))?;

    debug!(path = %path.display(), "persisted session storage");
    Ok(())
}
