//! Typed views of the Immich API payloads this backend touches.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One album as returned by the album listing endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumSummary {
    pub id: String,
    pub album_name: String,
    #[serde(default)]
    pub description: String,
}

/// One asset inside an album detail response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub original_file_name: String,
    pub file_created_at: DateTime<Utc>,
    pub file_modified_at: DateTime<Utc>,
    #[serde(default)]
    pub is_trashed: bool,
    #[serde(default)]
    pub exif_info: ExifInfo,
}

impl Asset {
    /// Size in bytes; Immich omits exif data for some assets, which reads
    /// as zero here.
    pub fn size(&self) -> u64 {
        self.exif_info.file_size_in_byte.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExifInfo {
    #[serde(default)]
    pub file_size_in_byte: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumDetail {
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResponse {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkCheckResponse {
    pub results: Vec<BulkCheckResult>,
}

/// Raw result row of `assets/bulk-upload-check`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCheckResult {
    pub action: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub is_trashed: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The deduplication verdict for one staged upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No equivalent content exists; upload it.
    Accept,
    /// Equivalent content already exists under `asset_id`; `trashed` tells
    /// whether it currently sits in the trash.
    Reject { asset_id: String, trashed: bool },
}

impl BulkCheckResult {
    /// Collapses the loosely-typed wire row into a [`CheckOutcome`].
    ///
    /// Returns `None` when the row does not follow the documented shape
    /// (unknown action, or a reject without an asset id).
    pub fn outcome(self) -> Option<CheckOutcome> {
        match self.action.as_str() {
            "accept" => Some(CheckOutcome::Accept),
            "reject" => Some(CheckOutcome::Reject {
                asset_id: self.asset_id?,
                trashed: self.is_trashed.unwrap_or(false),
            }),
            _ => None,
        }
    }
}
