//! The Immich-backed implementation of the virtual filesystem contract.
//!
//! Albums surface as top-level directories, assets as files. Uploads arrive
//! as staged files via `write_file`, wait in a pending queue, and are
//! committed by `set_mtime`: checksum, duplicate check against the server,
//! then upload / trash-restore / no-op depending on the verdict, and finally
//! attachment to the destination album.

use std::path::Path;
use std::sync::Arc;

use albumfs_core::{DirEntry, EntryStat, FlatPath, VfsError, VfsResult, VirtualFileSystem};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::api::{ApiError, AssetUpload, CatalogApi, ImmichClient};
use crate::catalog::{CatalogCache, NOSYNC_MARKER, filter_albums};
use crate::model::{AlbumSummary, Asset, CheckOutcome};

/// Device identifier stamped on every upload from this gateway.
const DEVICE_ID: &str = "albumfs-sftp";

/// Connection settings for one Immich instance.
#[derive(Debug, Clone)]
pub struct ImmichConfig {
    /// Base URL of the instance, e.g. `https://photos.example.org`.
    pub base_url: String,
    /// IANA zone used when rendering upload timestamps.
    pub timezone: Tz,
}

struct PendingUpload {
    path: String,
    staged: NamedTempFile,
}

/// One connection's view of an Immich catalog.
///
/// Owns the album cache, the per-album asset caches and the pending-upload
/// queue; none of it is shared across connections.
pub struct ImmichBackend {
    api: Arc<dyn CatalogApi>,
    timezone: Tz,
    cache: Mutex<CatalogCache>,
    pending: Mutex<Vec<PendingUpload>>,
}

impl ImmichBackend {
    /// Builds a backend talking to the configured instance.
    pub fn connect(config: &ImmichConfig) -> Result<Self, ApiError> {
        let client = ImmichClient::new(&config.base_url)?;
        Ok(Self::with_api(Arc::new(client), config.timezone))
    }

    /// Builds a backend over any [`CatalogApi`] implementation. Used by
    /// tests to script the remote side.
    pub fn with_api(api: Arc<dyn CatalogApi>, timezone: Tz) -> Self {
        Self {
            api,
            timezone,
            cache: Mutex::new(CatalogCache::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    async fn refresh_albums(&self, cache: &mut CatalogCache) -> VfsResult<()> {
        let raw = self.api.list_albums().await?;
        cache.replace_albums(filter_albums(raw, NOSYNC_MARKER));
        Ok(())
    }

    async fn album_opt(
        &self,
        cache: &mut CatalogCache,
        name: &str,
        refresh: bool,
    ) -> VfsResult<Option<AlbumSummary>> {
        if cache.albums.is_empty() || refresh {
            self.refresh_albums(cache).await?;
        }
        Ok(cache.by_name(name).map(|a| a.summary.clone()))
    }

    async fn album(
        &self,
        cache: &mut CatalogCache,
        name: &str,
        refresh: bool,
    ) -> VfsResult<AlbumSummary> {
        self.album_opt(cache, name, refresh)
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("/{name}")))
    }

    /// Fetches an album's assets and installs them in the cache.
    async fn fetch_assets(
        &self,
        cache: &mut CatalogCache,
        album: &AlbumSummary,
    ) -> VfsResult<Vec<Asset>> {
        let assets = self.api.album_assets(&album.id).await?;
        if let Some(cached) = cache.by_name_mut(&album.album_name) {
            cached.assets = Some(assets.clone());
        }
        Ok(assets)
    }

    async fn asset_opt(
        &self,
        cache: &mut CatalogCache,
        dir: &str,
        name: &str,
        refresh_assets: bool,
    ) -> VfsResult<Option<Asset>> {
        let Some(album) = self.album_opt(cache, dir, false).await? else {
            return Ok(None);
        };
        let need_fetch = refresh_assets
            || cache
                .by_name(dir)
                .and_then(|a| a.assets.as_ref())
                .is_none_or(Vec::is_empty);
        let assets = if need_fetch {
            self.fetch_assets(cache, &album).await?
        } else {
            cache
                .by_name(dir)
                .and_then(|a| a.assets.clone())
                .unwrap_or_default()
        };
        Ok(assets.into_iter().find(|a| a.original_file_name == name))
    }

    async fn asset(
        &self,
        cache: &mut CatalogCache,
        dir: &str,
        name: &str,
        refresh_assets: bool,
    ) -> VfsResult<Asset> {
        self.asset_opt(cache, dir, name, refresh_assets)
            .await?
            .ok_or_else(|| VfsError::NotFound(format!("/{dir}/{name}")))
    }

    /// Fresh membership query for an asset, with the visibility filter
    /// applied; this query is the refresh point before detach steps.
    async fn visible_albums_containing(&self, asset_id: &str) -> VfsResult<Vec<AlbumSummary>> {
        let raw = self.api.albums_containing(asset_id).await?;
        Ok(filter_albums(raw, NOSYNC_MARKER))
    }

    /// Removes one asset reachable through `album`: detach only if it still
    /// belongs to other albums, otherwise delete it for good.
    async fn delete_asset(&self, album: &AlbumSummary, asset: &Asset) -> VfsResult<()> {
        let memberships = self.visible_albums_containing(&asset.id).await?;
        if memberships.len() > 1 {
            debug!(
                asset = %asset.original_file_name,
                albums = memberships.len(),
                "asset is shared, detaching only"
            );
            self.api
                .detach_assets(&album.id, std::slice::from_ref(&asset.id))
                .await?;
        } else {
            self.api
                .delete_assets(std::slice::from_ref(&asset.id))
                .await?;
        }
        Ok(())
    }

    async fn take_pending(&self, path: &str) -> Option<PendingUpload> {
        let mut pending = self.pending.lock().await;
        let idx = pending.iter().position(|p| p.path == path)?;
        Some(pending.remove(idx))
    }

    /// The commit sequence behind `set_mtime`. The pending entry is already
    /// out of the queue; the caller reinserts it if this fails.
    async fn commit_entry(
        &self,
        path: &str,
        entry: &PendingUpload,
        mtime: DateTime<Utc>,
    ) -> VfsResult<()> {
        let FlatPath::Entry { dir, name } = FlatPath::parse(path)? else {
            return Err(VfsError::InvalidPath(path.to_string()));
        };
        let album = {
            let mut cache = self.cache.lock().await;
            self.album(&mut cache, &dir, false).await?
        };

        let checksum = sha1_base64(entry.staged.path()).await?;
        let outcome = self.api.check_duplicate(&checksum, &name).await?;
        debug!(path = %path, ?outcome, "duplicate check");

        let asset_id = match outcome {
            CheckOutcome::Accept => {
                let iso = iso_in_zone(mtime, self.timezone);
                let upload = AssetUpload {
                    album_id: album.id.clone(),
                    file_name: name.clone(),
                    device_asset_id: name.clone(),
                    device_id: DEVICE_ID.to_string(),
                    file_created_at: iso.clone(),
                    file_modified_at: iso,
                    payload: entry.staged.path().to_path_buf(),
                };
                let id = self.api.upload_asset(upload).await?;
                info!(path = %path, asset = %id, "uploaded new asset");
                id
            }
            CheckOutcome::Reject {
                asset_id,
                trashed: true,
            } => {
                // A trashed duplicate comes back by restoring it, after
                // detaching it from every album it still belongs to. No
                // rollback: a failure partway leaves the remote as-is.
                let memberships = self.visible_albums_containing(&asset_id).await?;
                for member in &memberships {
                    self.api
                        .detach_assets(&member.id, std::slice::from_ref(&asset_id))
                        .await?;
                }
                self.api
                    .restore_assets(std::slice::from_ref(&asset_id))
                    .await?;
                info!(path = %path, asset = %asset_id, "restored trashed duplicate");
                asset_id
            }
            CheckOutcome::Reject {
                asset_id,
                trashed: false,
            } => {
                debug!(path = %path, asset = %asset_id, "live duplicate, skipping upload");
                asset_id
            }
        };

        self.api
            .attach_assets(&album.id, std::slice::from_ref(&asset_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VirtualFileSystem for ImmichBackend {
    async fn login(&self, username: &str, password: &str) -> VfsResult<()> {
        self.api.login(username, password).await?;
        info!(user = %username, "immich session established");
        Ok(())
    }

    async fn logout(&self) -> VfsResult<()> {
        self.api.logout().await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        match FlatPath::parse(path)? {
            FlatPath::Root => {
                // The root listing is a refresh point for the album cache.
                let mut cache = self.cache.lock().await;
                self.refresh_albums(&mut cache).await?;
                Ok(cache
                    .albums
                    .iter()
                    .map(|a| DirEntry {
                        name: a.summary.album_name.clone(),
                        is_dir: true,
                        size: 0,
                        mtime: DateTime::UNIX_EPOCH,
                    })
                    .collect())
            }
            FlatPath::Dir(dir) | FlatPath::Entry { dir, .. } => {
                let mut cache = self.cache.lock().await;
                let album = self.album(&mut cache, &dir, false).await?;
                let assets = self.fetch_assets(&mut cache, &album).await?;
                Ok(assets
                    .into_iter()
                    .map(|asset| DirEntry {
                        is_dir: false,
                        size: asset.size(),
                        mtime: asset.file_modified_at,
                        name: asset.original_file_name,
                    })
                    .collect())
            }
        }
    }

    async fn read_file(&self, path: &str) -> VfsResult<NamedTempFile> {
        let FlatPath::Entry { dir, name } = FlatPath::parse(path)? else {
            return Err(VfsError::NotFound(path.to_string()));
        };
        let asset = {
            let mut cache = self.cache.lock().await;
            self.asset(&mut cache, &dir, &name, false).await?
        };
        let staged = NamedTempFile::new()?;
        self.api.download_original(&asset.id, staged.path()).await?;
        debug!(path = %path, asset = %asset.id, "downloaded original into staging");
        Ok(staged)
    }

    async fn write_file(&self, path: &str, staged: NamedTempFile) -> VfsResult<()> {
        let mut pending = self.pending.lock().await;
        // Re-staging a path replaces the earlier uncommitted content.
        if let Some(entry) = pending.iter_mut().find(|p| p.path == path) {
            entry.staged = staged;
        } else {
            pending.push(PendingUpload {
                path: path.to_string(),
                staged,
            });
        }
        debug!(path = %path, queued = pending.len(), "upload staged, awaiting commit");
        Ok(())
    }

    async fn stat(&self, path: &str) -> VfsResult<Option<EntryStat>> {
        match FlatPath::parse(path)? {
            FlatPath::Root => Ok(Some(EntryStat {
                is_dir: true,
                size: 0,
                mtime: Utc::now(),
            })),
            FlatPath::Dir(dir) => {
                let mut cache = self.cache.lock().await;
                Ok(self
                    .album_opt(&mut cache, &dir, true)
                    .await?
                    .map(|_| EntryStat {
                        is_dir: true,
                        size: 0,
                        mtime: DateTime::UNIX_EPOCH,
                    }))
            }
            FlatPath::Entry { dir, name } => {
                let mut cache = self.cache.lock().await;
                Ok(self
                    .asset_opt(&mut cache, &dir, &name, true)
                    .await?
                    .map(|asset| EntryStat {
                        is_dir: false,
                        size: asset.size(),
                        mtime: asset.file_modified_at,
                    }))
            }
        }
    }

    async fn set_mtime(&self, path: &str, mtime: DateTime<Utc>) -> VfsResult<()> {
        let Some(entry) = self.take_pending(path).await else {
            return Err(VfsError::Unsupported(
                "set-mtime only commits a pending upload",
            ));
        };
        match self.commit_entry(path, &entry, mtime).await {
            // Dropping the entry here releases its staging file.
            Ok(()) => Ok(()),
            Err(err) => {
                // Keep the staged content around so the client can retry.
                self.pending.lock().await.push(entry);
                Err(err)
            }
        }
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.iter_mut().find(|p| p.path == from) {
            entry.path = to.to_string();
            debug!(from = %from, to = %to, "renamed pending upload");
            return Ok(());
        }
        Err(VfsError::Unsupported(
            "rename targets a pending upload; committed assets cannot be renamed",
        ))
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        match FlatPath::parse(path)? {
            FlatPath::Root => Err(VfsError::InvalidPath(path.to_string())),
            FlatPath::Dir(dir) => {
                let (album, assets) = {
                    let mut cache = self.cache.lock().await;
                    let album = self.album(&mut cache, &dir, false).await?;
                    let assets = self.fetch_assets(&mut cache, &album).await?;
                    (album, assets)
                };
                // Removing an album deletes its contents outright, shared
                // or not; only single-asset removal checks memberships.
                let ids: Vec<String> = assets.iter().map(|a| a.id.clone()).collect();
                if !ids.is_empty() {
                    self.api.delete_assets(&ids).await?;
                }
                self.api.delete_album(&album.id).await?;
                info!(path = %path, assets = ids.len(), "deleted album and its assets");
                Ok(())
            }
            FlatPath::Entry { dir, name } => {
                let (album, asset) = {
                    let mut cache = self.cache.lock().await;
                    let album = self.album(&mut cache, &dir, false).await?;
                    let asset = self.asset(&mut cache, &dir, &name, false).await?;
                    (album, asset)
                };
                self.delete_asset(&album, &asset).await
            }
        }
    }

    async fn mkdir(&self, path: &str) -> VfsResult<()> {
        let FlatPath::Dir(name) = FlatPath::parse(path)? else {
            return Err(VfsError::InvalidPath(path.to_string()));
        };
        let created = self.api.create_album(&name).await?;
        info!(path = %path, album = %created.id, "created album");
        Ok(())
    }
}

/// Streams a file through SHA-1 and encodes the digest the way the
/// duplicate-check endpoint expects it.
async fn sha1_base64(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

/// ISO-8601 with the zone's UTC offset, e.g. `2024-05-01T14:00:00.000+02:00`.
fn iso_in_zone(mtime: DateTime<Utc>, tz: Tz) -> String {
    mtime
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Millis, false)
}
