//! Immich catalog backend for albumfs.
//!
//! This crate maps an Immich instance's albums and assets onto the flat
//! two-level filesystem contract defined in `albumfs-core`. It owns the
//! HTTP client ([`api::ImmichClient`]), the wire-format DTOs ([`model`]),
//! the album visibility filter and cache (`catalog`), and the backend
//! itself ([`ImmichBackend`]) with its pending-upload commit flow.

pub mod api;
mod backend;
mod catalog;
pub mod model;

pub use api::{ApiError, AssetUpload, CatalogApi};
pub use backend::{ImmichBackend, ImmichConfig};
pub use catalog::{NOSYNC_MARKER, filter_albums};
