//! Persistent SSH host key handling.
//!
//! The key lives next to the server's data so clients see a stable host
//! identity across restarts. First run generates an Ed25519 key and
//! tightens its permissions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use russh::keys::ssh_key::{self, LineEnding};
use russh::keys::{Algorithm, PrivateKey};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("host key i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("host key encoding: {0}")]
    Key(#[from] ssh_key::Error),
}

/// Loads the host key at `path`, generating and persisting a fresh
/// Ed25519 key on first run.
pub fn load_or_generate(path: &Path) -> Result<PrivateKey, HostKeyError> {
    if path.exists() {
        return Ok(PrivateKey::read_openssh_file(path)?);
    }
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
    key.write_openssh_file(path, LineEnding::LF)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    info!(path = %path.display(), "generated new host key");
    Ok(key)
}
