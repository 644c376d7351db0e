//! Core abstractions for albumfs: the virtual filesystem contract that the
//! SFTP session engine consumes, flat-path handling for the two-level
//! catalog tree, and a JSON-file reference backend.
//!
//! Backends implement [`VirtualFileSystem`]; the remote Immich backend lives
//! in the `albumfs-immich` crate, the local reference backend in
//! [`json_store`].

mod error;
mod path;
mod vfs;

pub mod json_store;

pub use error::{VfsError, VfsResult};
pub use path::{FlatPath, canonicalize, is_valid_segment};
pub use vfs::{DirEntry, EntryStat, VirtualFileSystem};
