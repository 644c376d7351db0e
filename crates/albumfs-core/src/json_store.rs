//! Reference backend over a single local JSON file.
//!
//! The store is one document, `{"entries": [...]}`, where each entry carries
//! a slash-joined relative path (`"Trip"` or `"Trip/photo.jpg"`), a kind,
//! base64 content for files and a modification timestamp. Every mutation
//! rewrites the whole file. No caching, no deduplication; this backend exists
//! to exercise the contract without a remote service.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::path::FlatPath;
use crate::vfs::{DirEntry, EntryStat, VirtualFileSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreEntry {
    name: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    #[serde(rename = "contentBase64", default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    modified: DateTime<Utc>,
}

impl StoreEntry {
    fn decoded_size(&self) -> VfsResult<u64> {
        match &self.content {
            None => Ok(0),
            Some(b64) => {
                let bytes = STANDARD
                    .decode(b64)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(bytes.len() as u64)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    entries: Vec<StoreEntry>,
}

#[derive(Serialize)]
struct StoreDocOut<'a> {
    entries: &'a [StoreEntry],
}

/// Flat-record backend persisted as a JSON file.
pub struct JsonFileSystem {
    store_path: PathBuf,
    entries: Mutex<Vec<StoreEntry>>,
}

impl JsonFileSystem {
    /// Opens the store at `path`. A missing file reads as an empty store; the
    /// first mutation creates it.
    pub async fn open(path: impl Into<PathBuf>) -> VfsResult<Self> {
        let store_path = path.into();
        let entries = match tokio::fs::read(&store_path).await {
            Ok(raw) => {
                let doc: StoreDoc = serde_json::from_slice(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                doc.entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %store_path.display(), entries = entries.len(), "opened json store");
        Ok(Self {
            store_path,
            entries: Mutex::new(entries),
        })
    }

    async fn save(&self, entries: &[StoreEntry]) -> VfsResult<()> {
        let doc = serde_json::to_vec_pretty(&StoreDocOut { entries })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.store_path, doc).await?;
        Ok(())
    }
}

/// Store key for a path: the canonical form without the leading separator.
/// The root has no key; entries cannot live there directly.
fn store_key(path: &str) -> VfsResult<Option<String>> {
    match FlatPath::parse(path)? {
        FlatPath::Root => Ok(None),
        FlatPath::Dir(dir) => Ok(Some(dir)),
        FlatPath::Entry { dir, name } => Ok(Some(format!("{dir}/{name}"))),
    }
}

fn parent_of(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

fn leaf_of(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((_, leaf)) => leaf,
        None => name,
    }
}

#[async_trait]
impl VirtualFileSystem for JsonFileSystem {
    async fn login(&self, _username: &str, _password: &str) -> VfsResult<()> {
        // The local store has no authentication.
        Ok(())
    }

    async fn logout(&self) -> VfsResult<()> {
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let dir_key = store_key(path)?.unwrap_or_default();
        let entries = self.entries.lock().await;
        let mut out = Vec::new();
        for entry in entries.iter() {
            if parent_of(&entry.name) != dir_key {
                continue;
            }
            out.push(DirEntry {
                name: leaf_of(&entry.name).to_string(),
                is_dir: entry.kind == EntryKind::Dir,
                size: entry.decoded_size()?,
                mtime: entry.modified,
            });
        }
        Ok(out)
    }

    async fn read_file(&self, path: &str) -> VfsResult<NamedTempFile> {
        let key = store_key(path)?
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let bytes = {
            let entries = self.entries.lock().await;
            let entry = entries
                .iter()
                .find(|e| e.kind == EntryKind::File && e.name == key)
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
            STANDARD
                .decode(entry.content.as_deref().unwrap_or_default())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        };
        let staged = NamedTempFile::new()?;
        tokio::fs::write(staged.path(), &bytes).await?;
        Ok(staged)
    }

    async fn write_file(&self, path: &str, staged: NamedTempFile) -> VfsResult<()> {
        let key = store_key(path)?
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let bytes = tokio::fs::read(staged.path()).await?;
        let encoded = STANDARD.encode(&bytes);

        let mut entries = self.entries.lock().await;
        match entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::File && e.name == key)
        {
            Some(entry) => {
                entry.content = Some(encoded);
                entry.modified = Utc::now();
            }
            None => entries.push(StoreEntry {
                name: key,
                kind: EntryKind::File,
                content: Some(encoded),
                modified: Utc::now(),
            }),
        }
        self.save(&entries).await
    }

    async fn stat(&self, path: &str) -> VfsResult<Option<EntryStat>> {
        let Some(key) = store_key(path)? else {
            return Ok(Some(EntryStat {
                is_dir: true,
                size: 0,
                mtime: Utc::now(),
            }));
        };
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|e| e.name == key)
            .map(|entry| {
                Ok(EntryStat {
                    is_dir: entry.kind == EntryKind::Dir,
                    size: entry.decoded_size()?,
                    mtime: entry.modified,
                })
            })
            .transpose()
    }

    async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> VfsResult<()> {
        let key = store_key(path)?
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.name == key)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
        entry.modified = mtime;
        self.save(&entries).await
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let from_key = store_key(from)?
            .ok_or_else(|| VfsError::InvalidPath(from.to_string()))?;
        let to_key = store_key(to)?
            .ok_or_else(|| VfsError::InvalidPath(to.to_string()))?;

        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.name == to_key) {
            return Err(VfsError::Conflict(format!("target exists: {to}")));
        }
        let kind = entries
            .iter()
            .find(|e| e.name == from_key)
            .map(|e| e.kind)
            .ok_or_else(|| VfsError::NotFound(from.to_string()))?;

        let now = Utc::now();
        if kind == EntryKind::Dir {
            let child_prefix = format!("{from_key}/");
            for entry in entries.iter_mut() {
                if entry.name == from_key {
                    entry.name = to_key.clone();
                    entry.modified = now;
                } else if let Some(rest) = entry.name.strip_prefix(&child_prefix) {
                    entry.name = format!("{to_key}/{rest}");
                    entry.modified = now;
                }
            }
        } else if let Some(entry) = entries.iter_mut().find(|e| e.name == from_key) {
            entry.name = to_key;
            entry.modified = now;
        }
        self.save(&entries).await
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let key = store_key(path)?
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let mut entries = self.entries.lock().await;
        let index = entries
            .iter()
            .position(|e| e.name == key)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?;

        if entries[index].kind == EntryKind::Dir {
            let child_prefix = format!("{key}/");
            if entries.iter().any(|e| e.name.starts_with(&child_prefix)) {
                return Err(VfsError::Conflict(format!("directory not empty: {path}")));
            }
        }
        entries.remove(index);
        self.save(&entries).await
    }

    async fn mkdir(&self, path: &str) -> VfsResult<()> {
        let FlatPath::Dir(dir) = FlatPath::parse(path)? else {
            return Err(VfsError::InvalidPath(path.to_string()));
        };
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.name == dir) {
            return Err(VfsError::Conflict(format!("already exists: {path}")));
        }
        entries.push(StoreEntry {
            name: dir,
            kind: EntryKind::Dir,
            content: None,
            modified: Utc::now(),
        });
        self.save(&entries).await
    }
}
