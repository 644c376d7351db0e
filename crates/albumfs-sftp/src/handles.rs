//! Session-scoped table of SFTP handles.
//!
//! OPENDIR and OPEN hand the client an opaque random token. Each token
//! maps to the canonical path it was opened for plus the staging state
//! accumulated by later requests on that handle.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, OnceCell};

/// Staged download backing READ requests on one file handle.
pub struct ReadStage {
    pub file: NamedTempFile,
    pub size: u64,
}

/// Lazily created staging for one open file.
#[derive(Default)]
pub struct FileState {
    /// Filled by the first READ; later reads reuse the same staging.
    pub read: OnceCell<ReadStage>,
    /// Filled by the first WRITE; handed to the backend on CLOSE.
    pub write: Mutex<Option<NamedTempFile>>,
}

pub enum HandleKind {
    Dir {
        /// Set once the single READDIR batch has been returned.
        listed: AtomicBool,
    },
    File(FileState),
}

pub struct HandleEntry {
    pub path: String,
    pub kind: HandleKind,
}

impl HandleEntry {
    pub fn file(&self) -> Option<&FileState> {
        match &self.kind {
            HandleKind::File(state) => Some(state),
            HandleKind::Dir { .. } => None,
        }
    }

    pub fn dir_listed(&self) -> Option<&AtomicBool> {
        match &self.kind {
            HandleKind::Dir { listed } => Some(listed),
            HandleKind::File(_) => None,
        }
    }
}

/// Live handles of one session, keyed by random hex tokens.
#[derive(Default)]
pub struct HandleTable {
    entries: DashMap<String, Arc<HandleEntry>>,
}

impl HandleTable {
    pub fn open_dir(&self, path: String) -> String {
        self.insert(HandleEntry {
            path,
            kind: HandleKind::Dir {
                listed: AtomicBool::new(false),
            },
        })
    }

    pub fn open_file(&self, path: String) -> String {
        self.insert(HandleEntry {
            path,
            kind: HandleKind::File(FileState::default()),
        })
    }

    pub fn get(&self, token: &str) -> Option<Arc<HandleEntry>> {
        self.entries.get(token).map(|entry| Arc::clone(&entry))
    }

    pub fn remove(&self, token: &str) -> Option<Arc<HandleEntry>> {
        self.entries.remove(token).map(|(_, entry)| entry)
    }

    fn insert(&self, entry: HandleEntry) -> String {
        let entry = Arc::new(entry);
        loop {
            let token = random_token();
            match self.entries.entry(token.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&entry));
                    return token;
                }
                // Collision on 64 random bits; roll again.
                Entry::Occupied(_) => {}
            }
        }
    }
}

fn random_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}
