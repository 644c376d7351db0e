//! Flat path handling for the two-level catalog tree.
//!
//! Every path the protocol layer hands to a backend is first run through
//! [`canonicalize`]; backends then split it with [`FlatPath::parse`], which
//! rejects anything deeper than `/<dir>/<entry>`.

use crate::error::{VfsError, VfsResult};

/// Resolves `.` and `..` segments, collapses repeated separators and returns
/// an absolute path with a single leading `/` and no trailing one.
///
/// Pure and idempotent: canonicalizing an already-canonical path returns it
/// unchanged. `..` at the root stays at the root.
pub fn canonicalize(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    format!("/{}", stack.join("/"))
}

/// True when `name` can stand alone as a single path segment.
pub fn is_valid_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// A canonical path split into the catalog's at-most-two levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlatPath {
    /// The catalog root, `/`.
    Root,
    /// A top-level directory, `/<dir>`.
    Dir(String),
    /// An entry inside a top-level directory, `/<dir>/<name>`.
    Entry {
        /// Name of the containing directory.
        dir: String,
        /// Name of the entry itself.
        name: String,
    },
}

impl FlatPath {
    /// Canonicalizes `path` and splits it into its levels, failing fast on
    /// more than two segments.
    pub fn parse(path: &str) -> VfsResult<Self> {
        let canonical = canonicalize(path);
        let mut segments = canonical.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next(), segments.next()) {
            (None, _, _) => Ok(Self::Root),
            (Some(dir), None, _) => Ok(Self::Dir(dir.to_string())),
            (Some(dir), Some(name), None) => Ok(Self::Entry {
                dir: dir.to_string(),
                name: name.to_string(),
            }),
            _ => Err(VfsError::InvalidPath(path.to_string())),
        }
    }

    /// The top-level directory this path touches, if any.
    pub fn dir(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Dir(dir) | Self::Entry { dir, .. } => Some(dir),
        }
    }

    /// The final segment, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Dir(dir) => Some(dir),
            Self::Entry { name, .. } => Some(name),
        }
    }
}
