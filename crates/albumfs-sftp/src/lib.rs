//! SFTP server exposing a photo catalog as a two-level filesystem.
//!
//! Albums appear as directories under the root and assets as read-only
//! files. Uploads are staged per handle and committed by the SETSTAT a
//! closing client sends. The SSH transport side lives in [`server`],
//! per-channel protocol handling in [`session`].

pub mod handles;
pub mod hostkey;
pub mod server;
pub mod session;
