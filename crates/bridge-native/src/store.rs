use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use bridge_platform::filesystem::{Backend, FsError, SyncReport};

pub use bridge_platform::filesystem::Snapshot;

/// Durable side of a mount
#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> Result<Snapshot, FsError>;
    async fn save(&self, snapshot: &Snapshot) -> Result<SyncReport, FsError>;
}

pub fn open_store(backend: &Backend) -> Arc<dyn Store> {
    match backend {
        Backend::LocalDir { root } => Arc::new(LocalDirStore::new(root.clone())),
        Backend::Persistent { store } => Arc::new(PersistentStore::new(store.clone())),
    }
}

fn digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Entry keys must stay below the mount point
pub(crate) fn check_entry_key(rel: &str) -> Result<(), FsError> {
    let escapes = rel.is_empty()
        || rel.starts_with('/')
        || rel.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if escapes {
        return Err(FsError::Corrupt(format!("invalid entry path '{}'", rel)));
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> FsError {
    FsError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Mirrors the mounted tree into a directory on the host
pub struct LocalDirStore {
    root: PathBuf,
    // Files seen in the directory at the last flush. Save only removes these,
    // never files that appeared on disk behind our back.
    known: Mutex<BTreeSet<String>>,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            known: Mutex::new(BTreeSet::new()),
        }
    }

    fn known(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn walk(&self) -> Result<Snapshot, FsError> {
        let mut snapshot = Snapshot::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let name = entry.file_name().to_string_lossy().to_string();
                let rel = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };

                if file_type.is_dir() {
                    pending.push((entry.path(), rel));
                } else if file_type.is_file() {
                    let data = tokio::fs::read(entry.path())
                        .await
                        .map_err(|e| io_error(&entry.path(), e))?;
                    snapshot.insert(rel, data);
                } else {
                    debug!("skipping non-regular entry {}", entry.path().display());
                }
            }
        }

        Ok(snapshot)
    }
}

#[async_trait]
impl Store for LocalDirStore {
    async fn load(&self) -> Result<Snapshot, FsError> {
        let snapshot = self.walk().await?;
        *self.known() = snapshot.keys().cloned().collect();
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<SyncReport, FsError> {
        let mut report = SyncReport::default();

        for (rel, data) in snapshot {
            let path = self.root.join(rel);
            match tokio::fs::read(&path).await {
                Ok(existing) if digest(&existing) == digest(data) => {
                    report.unchanged += 1;
                    continue;
                }
                _ => {}
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
            tokio::fs::write(&path, data)
                .await
                .map_err(|e| io_error(&path, e))?;
            report.written += 1;
        }

        let stale: Vec<String> = self
            .known()
            .iter()
            .filter(|rel| !snapshot.contains_key(*rel))
            .cloned()
            .collect();
        for rel in stale {
            let path = self.root.join(&rel);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }

        *self.known() = snapshot.keys().cloned().collect();
        Ok(report)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    sha256: String,
    content: String,
}

const STORE_VERSION: u32 = 1;

/// Key/value store persisted as a single JSON document
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_store(&self) -> Result<StoreFile, FsError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            // A store that was never saved is empty
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreFile {
                    version: STORE_VERSION,
                    entries: BTreeMap::new(),
                })
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let file: StoreFile = serde_json::from_slice(&data)
            .map_err(|e| FsError::Corrupt(format!("{}: {}", self.path.display(), e)))?;
        if file.version != STORE_VERSION {
            return Err(FsError::Corrupt(format!(
                "{}: unsupported store version {}",
                self.path.display(),
                file.version
            )));
        }
        Ok(file)
    }

    async fn write_store(&self, file: &StoreFile) -> Result<(), FsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
        }
        let data = serde_json::to_vec_pretty(file)
            .map_err(|e| FsError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        // Replace atomically so a crash mid-write leaves the old store intact
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }
}

#[async_trait]
impl Store for PersistentStore {
    async fn load(&self) -> Result<Snapshot, FsError> {
        let file = self.read_store().await?;
        let mut snapshot = Snapshot::new();
        for (rel, entry) in file.entries {
            check_entry_key(&rel)?;
            if digest(entry.content.as_bytes()) != entry.sha256 {
                return Err(FsError::Corrupt(format!("checksum mismatch for {}", rel)));
            }
            snapshot.insert(rel, entry.content.into_bytes());
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<SyncReport, FsError> {
        let previous = self.read_store().await?;
        let mut report = SyncReport::default();
        let mut entries = BTreeMap::new();

        for (rel, data) in snapshot {
            let sha256 = digest(data);
            match previous.entries.get(rel) {
                Some(old) if old.sha256 == sha256 => report.unchanged += 1,
                _ => report.written += 1,
            }
            let content =
                String::from_utf8(data.clone()).map_err(|_| FsError::InvalidUtf8(rel.clone()))?;
            entries.insert(rel.clone(), StoredEntry { sha256, content });
        }
        report.removed = previous
            .entries
            .keys()
            .filter(|rel| !snapshot.contains_key(*rel))
            .count();

        if report.written == 0 && report.removed == 0 && self.path.exists() {
            return Ok(report);
        }

        self.write_store(&StoreFile {
            version: STORE_VERSION,
            entries,
        })
        .await?;
        Ok(report)
    }
}
