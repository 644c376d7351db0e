//! The virtual filesystem contract every backend implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::error::VfsResult;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, a single path segment.
    pub name: String,
    /// True for directories, false for regular files.
    pub is_dir: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
}

/// Metadata for a single path, as returned by [`VirtualFileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    /// True for directories, false for regular files.
    pub is_dir: bool,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
}

/// The capability set the protocol session engine consumes.
///
/// Paths are canonical flat strings (`/`, `/<dir>` or `/<dir>/<name>`);
/// anything deeper is invalid and fails fast. Whole objects move through
/// staging files: [`read_file`](Self::read_file) materializes the full
/// content into one, [`write_file`](Self::write_file) consumes one. Byte
/// ranges are the protocol layer's business, not the backend's.
///
/// Implementations take `&self` everywhere; a backend instance is shared by
/// all in-flight requests of one connection.
#[async_trait]
pub trait VirtualFileSystem: Send + Sync {
    /// Validates credentials and establishes whatever session the backend
    /// needs. Called once, during connection authentication.
    async fn login(&self, username: &str, password: &str) -> VfsResult<()>;

    /// Tears down the backend session. Called when the connection ends.
    async fn logout(&self) -> VfsResult<()>;

    /// Lists the direct children of a directory path.
    async fn list_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Downloads the full content behind `path` into a fresh staging file.
    ///
    /// The staging file is deleted when the returned handle is dropped.
    async fn read_file(&self, path: &str) -> VfsResult<NamedTempFile>;

    /// Accepts fully staged content for `path`.
    ///
    /// Backends may defer the actual commit; see
    /// [`set_mtime`](Self::set_mtime). Ownership of the staging file moves to
    /// the backend.
    async fn write_file(&self, path: &str, staged: NamedTempFile) -> VfsResult<()>;

    /// Resolves metadata for a path, `None` when nothing exists there.
    async fn stat(&self, path: &str) -> VfsResult<Option<EntryStat>>;

    /// Sets the modification time of `path`.
    ///
    /// For backends that stage writes, this is the commit signal for content
    /// previously handed to [`write_file`](Self::write_file).
    async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> VfsResult<()>;

    /// Renames an entry. Backends may restrict which entries are renameable.
    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Removes the entry at `path`; directories and files both land here.
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Creates a top-level directory.
    async fn mkdir(&self, path: &str) -> VfsResult<()>;
}
