//! Thin typed client for the slice of the Immich HTTP API this backend
//! consumes, behind the [`CatalogApi`] seam so the backend logic can be
//! exercised against a scripted fake.

use std::path::{Path, PathBuf};

use albumfs_core::VfsError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode, header, multipart};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::model::{
    AlbumDetail, AlbumSummary, Asset, BulkCheckResponse, BulkCheckResult, CheckOutcome,
    LoginResponse, UploadResponse,
};

const USER_AGENT: &str = concat!("albumfs/", env!("CARGO_PKG_VERSION"));

/// Longest error-body excerpt kept in an [`ApiError::Status`].
const BODY_EXCERPT_LEN: usize = 200;

/// Errors from talking to the remote catalog.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never completed, or the response body failed to decode.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{method} /api/{endpoint} returned {status}: {body}")]
    Status {
        method: Method,
        endpoint: String,
        status: StatusCode,
        body: String,
    },

    /// The response decoded but did not carry the documented shape.
    #[error("unexpected response from /api/{endpoint}: {detail}")]
    UnexpectedResponse { endpoint: String, detail: String },

    /// Local file I/O while streaming a payload.
    #[error("transfer i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ApiError> for VfsError {
    fn from(err: ApiError) -> Self {
        VfsError::remote(err)
    }
}

/// Everything needed to upload one staged asset.
#[derive(Debug)]
pub struct AssetUpload {
    pub album_id: String,
    pub file_name: String,
    pub device_asset_id: String,
    pub device_id: String,
    /// ISO-8601 with offset, rendered in the configured zone.
    pub file_created_at: String,
    /// ISO-8601 with offset, rendered in the configured zone.
    pub file_modified_at: String,
    /// Staged content to stream as the multipart payload.
    pub payload: PathBuf,
}

/// The remote operations the backend is built on.
///
/// [`ImmichClient`] is the production implementation; tests substitute a
/// scripted fake.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Exchanges credentials for a session token held by the client.
    async fn login(&self, email: &str, password: &str) -> Result<(), ApiError>;

    /// Revokes the session token.
    async fn logout(&self) -> Result<(), ApiError>;

    /// All albums visible to the logged-in user, unfiltered.
    async fn list_albums(&self) -> Result<Vec<AlbumSummary>, ApiError>;

    /// Albums that currently contain `asset_id`, unfiltered.
    async fn albums_containing(&self, asset_id: &str) -> Result<Vec<AlbumSummary>, ApiError>;

    /// The assets of one album.
    async fn album_assets(&self, album_id: &str) -> Result<Vec<Asset>, ApiError>;

    /// Creates an album and returns it.
    async fn create_album(&self, name: &str) -> Result<AlbumSummary, ApiError>;

    /// Asks whether content with this checksum already exists.
    ///
    /// `reference_id` is an opaque correlation id echoed by the server,
    /// conventionally the file name being committed.
    async fn check_duplicate(
        &self,
        checksum_b64: &str,
        reference_id: &str,
    ) -> Result<CheckOutcome, ApiError>;

    /// Uploads a staged asset and returns the new asset id.
    async fn upload_asset(&self, upload: AssetUpload) -> Result<String, ApiError>;

    /// Permanently deletes assets.
    async fn delete_assets(&self, ids: &[String]) -> Result<(), ApiError>;

    /// Deletes an album (not its assets).
    async fn delete_album(&self, album_id: &str) -> Result<(), ApiError>;

    /// Detaches assets from an album without deleting them.
    async fn detach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError>;

    /// Attaches assets to an album; attaching an existing member is a no-op
    /// for the server.
    async fn attach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError>;

    /// Restores trashed assets.
    async fn restore_assets(&self, ids: &[String]) -> Result<(), ApiError>;

    /// Streams an asset's original bytes into `dest`.
    async fn download_original(&self, asset_id: &str, dest: &Path) -> Result<(), ApiError>;
}

/// Bearer-token HTTP client for one Immich instance.
pub struct ImmichClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ImmichClient {
    /// Builds a client for the instance at `base_url` (trailing slashes are
    /// ignored). No request is made until [`CatalogApi::login`].
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url, endpoint)
    }

    async fn authed(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        debug!(%method, endpoint, "immich request");
        let rb = self.http.request(method, self.url(endpoint));
        match self.token.read().await.as_deref() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn expect_success(
        method: Method,
        endpoint: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > BODY_EXCERPT_LEN {
            let mut cut = BODY_EXCERPT_LEN;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(ApiError::Status {
            method,
            endpoint: endpoint.to_string(),
            status,
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: Option<&[(&str, &str)]>,
    ) -> Result<T, ApiError> {
        let mut rb = self
            .authed(Method::GET, endpoint)
            .await
            .header(header::ACCEPT, "application/json");
        if let Some(query) = query {
            rb = rb.query(query);
        }
        let resp = rb.send().await?;
        let resp = Self::expect_success(Method::GET, endpoint, resp).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let mut rb = self
            .authed(method.clone(), endpoint)
            .await
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            rb = rb.json(&body);
        }
        let resp = rb.send().await?;
        let resp = Self::expect_success(method, endpoint, resp).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn send_ok(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        let mut rb = self
            .authed(method.clone(), endpoint)
            .await
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            rb = rb.json(&body);
        }
        let resp = rb.send().await?;
        Self::expect_success(method, endpoint, resp).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogApi for ImmichClient {
    async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let resp: LoginResponse = self
            .send_json(
                Method::POST,
                "auth/login",
                Some(serde_json::json!({ "email": email, "password": password })),
            )
            .await?;
        *self.token.write().await = Some(resp.access_token);
        Ok(())
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.send_ok(Method::POST, "auth/logout", None).await?;
        *self.token.write().await = None;
        Ok(())
    }

    async fn list_albums(&self) -> Result<Vec<AlbumSummary>, ApiError> {
        self.get_json("albums", None).await
    }

    async fn albums_containing(&self, asset_id: &str) -> Result<Vec<AlbumSummary>, ApiError> {
        self.get_json("albums", Some(&[("assetId", asset_id)])).await
    }

    async fn album_assets(&self, album_id: &str) -> Result<Vec<Asset>, ApiError> {
        let detail: AlbumDetail = self.get_json(&format!("albums/{album_id}"), None).await?;
        Ok(detail.assets)
    }

    async fn create_album(&self, name: &str) -> Result<AlbumSummary, ApiError> {
        self.send_json(
            Method::POST,
            "albums",
            Some(serde_json::json!({ "albumName": name })),
        )
        .await
    }

    async fn check_duplicate(
        &self,
        checksum_b64: &str,
        reference_id: &str,
    ) -> Result<CheckOutcome, ApiError> {
        let endpoint = "assets/bulk-upload-check";
        let resp: BulkCheckResponse = self
            .send_json(
                Method::POST,
                endpoint,
                Some(serde_json::json!({
                    "assets": [{ "checksum": checksum_b64, "id": reference_id }]
                })),
            )
            .await?;
        resp.results
            .into_iter()
            .next()
            .and_then(BulkCheckResult::outcome)
            .ok_or_else(|| ApiError::UnexpectedResponse {
                endpoint: endpoint.to_string(),
                detail: "missing or malformed result row".to_string(),
            })
    }

    async fn upload_asset(&self, upload: AssetUpload) -> Result<String, ApiError> {
        let file = tokio::fs::File::open(&upload.payload).await?;
        let payload = multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .file_name(upload.file_name);
        let form = multipart::Form::new()
            .text("fileCreatedAt", upload.file_created_at)
            .text("fileModifiedAt", upload.file_modified_at)
            .text("deviceAssetId", upload.device_asset_id)
            .text("deviceId", upload.device_id)
            .text("albumId", upload.album_id)
            .part("assetData", payload);

        let resp = self
            .authed(Method::POST, "assets")
            .await
            .header(header::ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await?;
        let resp = Self::expect_success(Method::POST, "assets", resp).await?;
        Ok(resp.json::<UploadResponse>().await?.id)
    }

    async fn delete_assets(&self, ids: &[String]) -> Result<(), ApiError> {
        self.send_ok(
            Method::DELETE,
            "assets",
            Some(serde_json::json!({ "ids": ids })),
        )
        .await
    }

    async fn delete_album(&self, album_id: &str) -> Result<(), ApiError> {
        self.send_ok(Method::DELETE, &format!("albums/{album_id}"), None)
            .await
    }

    async fn detach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError> {
        self.send_ok(
            Method::DELETE,
            &format!("albums/{album_id}/assets"),
            Some(serde_json::json!({ "ids": ids })),
        )
        .await
    }

    async fn attach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError> {
        self.send_ok(
            Method::PUT,
            &format!("albums/{album_id}/assets"),
            Some(serde_json::json!({ "ids": ids })),
        )
        .await
    }

    async fn restore_assets(&self, ids: &[String]) -> Result<(), ApiError> {
        self.send_ok(
            Method::POST,
            "trash/restore/assets",
            Some(serde_json::json!({ "ids": ids })),
        )
        .await
    }

    async fn download_original(&self, asset_id: &str, dest: &Path) -> Result<(), ApiError> {
        let endpoint = format!("assets/{asset_id}/original");
        let resp = self.authed(Method::GET, &endpoint).await.send().await?;
        let resp = Self::expect_success(Method::GET, &endpoint, resp).await?;

        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        Ok(())
    }
}
