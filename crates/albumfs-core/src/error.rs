//! Error taxonomy shared by every backend.

use thiserror::Error;

/// Errors surfaced by [`VirtualFileSystem`](crate::VirtualFileSystem)
/// operations.
///
/// The protocol layer maps these onto SFTP status codes: [`VfsError::NotFound`]
/// becomes `NO_SUCH_FILE`, everything else `FAILURE`.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path failed validation: more than two segments, an empty segment,
    /// or a nested path given to an operation that only accepts top-level
    /// ones.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No entry exists at the path, even after a cache refresh.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend does not support this operation on this target.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The target's current state conflicts with the request, e.g. it already
    /// exists or a directory is not empty.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A call to the remote service failed.
    #[error("remote call failed: {0}")]
    Remote(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Local staging or store I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// Wraps an arbitrary error as a remote-call failure.
    pub fn remote<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Remote(Box::new(err))
    }

    /// True when the error means "no such entry" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Convenience alias used across backend implementations.
pub type VfsResult<T> = Result<T, VfsError>;
