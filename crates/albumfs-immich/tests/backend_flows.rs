//! End-to-end backend flows over a scripted in-memory catalog.
//!
//! The fake records every remote call, so these tests pin down not just
//! results but the order of mutations (detach before restore, asset
//! deletion before album deletion, and so on).

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use albumfs_core::{VfsError, VirtualFileSystem};
use albumfs_immich::model::{AlbumSummary, Asset, CheckOutcome, ExifInfo};
use albumfs_immich::{ApiError, AssetUpload, CatalogApi, ImmichBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn album(id: &str, name: &str, description: &str) -> AlbumSummary {
    AlbumSummary {
        id: id.into(),
        album_name: name.into(),
        description: description.into(),
    }
}

fn asset(id: &str, file_name: &str, size: u64) -> Asset {
    Asset {
        id: id.into(),
        original_file_name: file_name.into(),
        file_created_at: ts("2024-03-01T08:00:00Z"),
        file_modified_at: ts("2024-03-02T09:30:00Z"),
        is_trashed: false,
        exif_info: ExifInfo {
            file_size_in_byte: Some(size),
        },
    }
}

fn staged(content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
}

struct StoredUpload {
    album_id: String,
    file_name: String,
    device_id: String,
    file_modified_at: String,
    bytes: Vec<u8>,
}

/// Scripted catalog: seeded state, queued dedup verdicts, a call log.
#[derive(Default)]
struct FakeCatalog {
    albums: Mutex<Vec<AlbumSummary>>,
    assets: Mutex<HashMap<String, Vec<Asset>>>,
    memberships: Mutex<HashMap<String, Vec<AlbumSummary>>>,
    originals: Mutex<HashMap<String, Vec<u8>>>,
    verdicts: Mutex<VecDeque<CheckOutcome>>,
    uploads: Mutex<Vec<StoredUpload>>,
    upload_seq: AtomicUsize,
    fail_login: AtomicBool,
    fail_next_attach: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeCatalog {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_tail(&self, n: usize) -> Vec<String> {
        let calls = self.calls();
        calls[calls.len() - n..].to_vec()
    }

    fn seed_album(&self, album: AlbumSummary, assets: Vec<Asset>) {
        let mut memberships = self.memberships.lock().unwrap();
        for a in &assets {
            memberships
                .entry(a.id.clone())
                .or_default()
                .push(album.clone());
        }
        drop(memberships);
        self.assets.lock().unwrap().insert(album.id.clone(), assets);
        self.albums.lock().unwrap().push(album);
    }

    fn queue_verdict(&self, verdict: CheckOutcome) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    fn set_membership(&self, asset_id: &str, albums: Vec<AlbumSummary>) {
        self.memberships
            .lock()
            .unwrap()
            .insert(asset_id.into(), albums);
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn login(&self, email: &str, _password: &str) -> Result<(), ApiError> {
        self.record(format!("login:{email}"));
        if self.fail_login.load(Ordering::Relaxed) {
            return Err(ApiError::UnexpectedResponse {
                endpoint: "auth/login".into(),
                detail: "bad credentials".into(),
            });
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.record("logout".into());
        Ok(())
    }

    async fn list_albums(&self) -> Result<Vec<AlbumSummary>, ApiError> {
        self.record("albums".into());
        Ok(self.albums.lock().unwrap().clone())
    }

    async fn albums_containing(&self, asset_id: &str) -> Result<Vec<AlbumSummary>, ApiError> {
        self.record(format!("albums-for:{asset_id}"));
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(asset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn album_assets(&self, album_id: &str) -> Result<Vec<Asset>, ApiError> {
        self.record(format!("assets:{album_id}"));
        Ok(self
            .assets
            .lock()
            .unwrap()
            .get(album_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_album(&self, name: &str) -> Result<AlbumSummary, ApiError> {
        self.record(format!("create-album:{name}"));
        let created = album(&format!("album-{name}"), name, "");
        self.albums.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn check_duplicate(
        &self,
        checksum_b64: &str,
        reference_id: &str,
    ) -> Result<CheckOutcome, ApiError> {
        self.record(format!("check:{reference_id}:{checksum_b64}"));
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CheckOutcome::Accept))
    }

    async fn upload_asset(&self, upload: AssetUpload) -> Result<String, ApiError> {
        let bytes = tokio::fs::read(&upload.payload).await?;
        let id = format!("up-{}", self.upload_seq.fetch_add(1, Ordering::Relaxed) + 1);
        self.record(format!("upload:{}:{}", upload.album_id, upload.file_name));
        self.uploads.lock().unwrap().push(StoredUpload {
            album_id: upload.album_id,
            file_name: upload.file_name,
            device_id: upload.device_id,
            file_modified_at: upload.file_modified_at,
            bytes,
        });
        Ok(id)
    }

    async fn delete_assets(&self, ids: &[String]) -> Result<(), ApiError> {
        self.record(format!("delete-assets:{}", ids.join(",")));
        Ok(())
    }

    async fn delete_album(&self, album_id: &str) -> Result<(), ApiError> {
        self.record(format!("delete-album:{album_id}"));
        Ok(())
    }

    async fn detach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError> {
        self.record(format!("detach:{album_id}:{}", ids.join(",")));
        Ok(())
    }

    async fn attach_assets(&self, album_id: &str, ids: &[String]) -> Result<(), ApiError> {
        self.record(format!("attach:{album_id}:{}", ids.join(",")));
        if self.fail_next_attach.swap(false, Ordering::Relaxed) {
            return Err(ApiError::UnexpectedResponse {
                endpoint: format!("albums/{album_id}/assets"),
                detail: "scripted failure".into(),
            });
        }
        Ok(())
    }

    async fn restore_assets(&self, ids: &[String]) -> Result<(), ApiError> {
        self.record(format!("restore:{}", ids.join(",")));
        Ok(())
    }

    async fn download_original(&self, asset_id: &str, dest: &Path) -> Result<(), ApiError> {
        self.record(format!("download:{asset_id}"));
        let bytes = self
            .originals
            .lock()
            .unwrap()
            .get(asset_id)
            .cloned()
            .ok_or_else(|| ApiError::UnexpectedResponse {
                endpoint: format!("assets/{asset_id}/original"),
                detail: "no such original".into(),
            })?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

fn scripted() -> (Arc<FakeCatalog>, ImmichBackend) {
    let api = Arc::new(FakeCatalog::default());
    let backend = ImmichBackend::with_api(api.clone(), chrono_tz::UTC);
    (api, backend)
}

#[tokio::test]
async fn root_listing_applies_visibility_filter() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);
    api.seed_album(album("a2", "travel", ""), vec![]);
    api.seed_album(album("a3", "Hidden", "keep #nosync out"), vec![]);
    api.seed_album(album("a4", "bad/name", ""), vec![]);

    let entries = backend.list_dir("/").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["Travel"]);
    assert!(entries[0].is_dir);
}

#[tokio::test]
async fn album_listing_maps_assets_to_files() {
    let (api, backend) = scripted();
    let mut no_exif = asset("x2", "scan.png", 0);
    no_exif.exif_info = ExifInfo::default();
    api.seed_album(
        album("a1", "Travel", ""),
        vec![asset("x1", "beach.jpg", 1234), no_exif],
    );

    let entries = backend.list_dir("/Travel").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "beach.jpg");
    assert_eq!(entries[0].size, 1234);
    assert_eq!(entries[0].mtime, ts("2024-03-02T09:30:00Z"));
    assert!(!entries[0].is_dir);
    assert_eq!(entries[1].size, 0);
}

#[tokio::test]
async fn listing_a_missing_album_is_not_found() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);
    let err = backend.list_dir("/Nope").await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
}

#[tokio::test]
async fn read_file_stages_the_downloaded_original() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![asset("x1", "beach.jpg", 9)]);
    api.originals
        .lock()
        .unwrap()
        .insert("x1".into(), b"jpeg bytes".to_vec());

    let file = backend.read_file("/Travel/beach.jpg").await.unwrap();
    assert_eq!(std::fs::read(file.path()).unwrap(), b"jpeg bytes");
}

#[tokio::test]
async fn commit_uploads_new_content_and_attaches() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);

    backend
        .write_file("/Travel/new.jpg", staged(b"abc"))
        .await
        .unwrap();
    backend
        .set_mtime("/Travel/new.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    assert_eq!(
        api.calls_tail(3),
        [
            "check:new.jpg:qZk+NkcGgWq6PiVxeFDCbJzQ2J0=",
            "upload:a1:new.jpg",
            "attach:a1:up-1",
        ]
    );
    let uploads = api.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].album_id, "a1");
    assert_eq!(uploads[0].file_name, "new.jpg");
    assert_eq!(uploads[0].device_id, "albumfs-sftp");
    assert_eq!(uploads[0].file_modified_at, "2024-05-01T12:00:00.000+00:00");
    assert_eq!(uploads[0].bytes, b"abc");
    drop(uploads);

    // The commit consumed the pending entry.
    let err = backend
        .set_mtime("/Travel/new.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::Unsupported(_)));
}

#[tokio::test]
async fn commit_skips_upload_for_live_duplicate() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);
    api.queue_verdict(CheckOutcome::Reject {
        asset_id: "x9".into(),
        trashed: false,
    });

    backend
        .write_file("/Travel/copy.jpg", staged(b"same bytes"))
        .await
        .unwrap();
    backend
        .set_mtime("/Travel/copy.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    let calls = api.calls();
    assert!(!calls.iter().any(|c| c.starts_with("upload:")));
    assert_eq!(calls.last().unwrap(), "attach:a1:x9");
}

#[tokio::test]
async fn commit_restores_trashed_duplicate_before_attach() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);
    api.queue_verdict(CheckOutcome::Reject {
        asset_id: "x9".into(),
        trashed: true,
    });
    // The trashed asset still sits in two visible albums and one opted-out
    // album; only the visible ones get a detach call.
    api.set_membership(
        "x9",
        vec![
            album("a2", "Archive", ""),
            album("a3", "Other", ""),
            album("a4", "Hidden", "#nosync"),
        ],
    );

    backend
        .write_file("/Travel/back.jpg", staged(b"old bytes"))
        .await
        .unwrap();
    backend
        .set_mtime("/Travel/back.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    assert_eq!(
        api.calls_tail(5),
        [
            "albums-for:x9",
            "detach:a2:x9",
            "detach:a3:x9",
            "restore:x9",
            "attach:a1:x9",
        ]
    );
}

#[tokio::test]
async fn failed_commit_keeps_the_staged_upload_for_retry() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);
    api.fail_next_attach.store(true, Ordering::Relaxed);
    // Second attempt sees the content already uploaded by the first.
    api.queue_verdict(CheckOutcome::Accept);
    api.queue_verdict(CheckOutcome::Reject {
        asset_id: "up-1".into(),
        trashed: false,
    });

    backend
        .write_file("/Travel/flaky.jpg", staged(b"payload"))
        .await
        .unwrap();
    let err = backend
        .set_mtime("/Travel/flaky.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::Remote(_)));

    backend
        .set_mtime("/Travel/flaky.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    let calls = api.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("upload:")).count(), 1);
    assert_eq!(calls.last().unwrap(), "attach:a1:up-1");
}

#[tokio::test]
async fn commit_against_a_missing_album_keeps_the_staged_upload() {
    let (_api, backend) = scripted();
    backend
        .write_file("/Ghost/a.jpg", staged(b"zz"))
        .await
        .unwrap();

    for _ in 0..2 {
        let err = backend
            .set_mtime("/Ghost/a.jpg", ts("2024-05-01T12:00:00Z"))
            .await
            .unwrap_err();
        // NotFound both times: the entry went back into the queue.
        assert!(matches!(err, VfsError::NotFound(_)));
    }
}

#[tokio::test]
async fn restaging_a_path_replaces_the_pending_content() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);

    backend
        .write_file("/Travel/pic.jpg", staged(b"first"))
        .await
        .unwrap();
    backend
        .write_file("/Travel/pic.jpg", staged(b"second"))
        .await
        .unwrap();
    backend
        .set_mtime("/Travel/pic.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    let uploads = api.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].bytes, b"second");
}

#[tokio::test]
async fn rename_rekeys_a_pending_upload() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);

    backend
        .write_file("/Travel/draft.jpg", staged(b"bytes"))
        .await
        .unwrap();
    backend
        .rename("/Travel/draft.jpg", "/Travel/final.jpg")
        .await
        .unwrap();
    backend
        .set_mtime("/Travel/final.jpg", ts("2024-05-01T12:00:00Z"))
        .await
        .unwrap();

    let uploads = api.uploads.lock().unwrap();
    assert_eq!(uploads[0].file_name, "final.jpg");
    drop(uploads);

    let err = backend
        .rename("/Travel/other.jpg", "/Travel/new.jpg")
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::Unsupported(_)));
}

#[tokio::test]
async fn removing_a_shared_asset_only_detaches_it() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![asset("x1", "pic.jpg", 5)]);
    api.set_membership(
        "x1",
        vec![album("a1", "Travel", ""), album("a2", "Archive", "")],
    );

    backend.remove("/Travel/pic.jpg").await.unwrap();

    let calls = api.calls();
    assert_eq!(calls.last().unwrap(), "detach:a1:x1");
    assert!(!calls.iter().any(|c| c.starts_with("delete-assets:")));
}

#[tokio::test]
async fn removing_the_last_copy_deletes_the_asset() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![asset("x1", "pic.jpg", 5)]);

    backend.remove("/Travel/pic.jpg").await.unwrap();

    let calls = api.calls();
    assert_eq!(calls.last().unwrap(), "delete-assets:x1");
    assert!(!calls.iter().any(|c| c.starts_with("detach:")));
}

#[tokio::test]
async fn removing_an_album_deletes_assets_then_the_album() {
    let (api, backend) = scripted();
    api.seed_album(
        album("a1", "Travel", ""),
        vec![asset("x1", "a.jpg", 1), asset("x2", "b.jpg", 2)],
    );

    backend.remove("/Travel").await.unwrap();

    assert_eq!(
        api.calls_tail(3),
        ["assets:a1", "delete-assets:x1,x2", "delete-album:a1"]
    );
}

#[tokio::test]
async fn removing_an_empty_album_skips_asset_deletion() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Empty", ""), vec![]);

    backend.remove("/Empty").await.unwrap();

    let calls = api.calls();
    assert_eq!(calls.last().unwrap(), "delete-album:a1");
    assert!(!calls.iter().any(|c| c.starts_with("delete-assets:")));
}

#[tokio::test]
async fn mkdir_creates_top_level_albums_only() {
    let (api, backend) = scripted();

    backend.mkdir("/New Album").await.unwrap();
    assert_eq!(api.calls().last().unwrap(), "create-album:New Album");

    let err = backend.mkdir("/New Album/inner").await.unwrap_err();
    assert!(matches!(err, VfsError::InvalidPath(_)));
    let calls = api.calls();
    assert_eq!(
        calls
            .iter()
            .filter(|c| c.starts_with("create-album:"))
            .count(),
        1
    );
}

#[tokio::test]
async fn stat_sees_entries_added_after_the_last_listing() {
    let (api, backend) = scripted();
    api.seed_album(album("a1", "Travel", ""), vec![]);

    assert!(backend.stat("/Travel/pic.jpg").await.unwrap().is_none());

    api.assets
        .lock()
        .unwrap()
        .insert("a1".into(), vec![asset("x1", "pic.jpg", 77)]);
    let stat = backend.stat("/Travel/pic.jpg").await.unwrap().unwrap();
    assert!(!stat.is_dir);
    assert_eq!(stat.size, 77);

    api.seed_album(album("a2", "Late", ""), vec![]);
    let stat = backend.stat("/Late").await.unwrap().unwrap();
    assert!(stat.is_dir);

    assert!(backend.stat("/").await.unwrap().unwrap().is_dir);
}

#[tokio::test]
async fn login_failure_surfaces_as_a_remote_error() {
    let (api, backend) = scripted();
    api.fail_login.store(true, Ordering::Relaxed);
    let err = backend.login("user@example.org", "pw").await.unwrap_err();
    assert!(matches!(err, VfsError::Remote(_)));
}
