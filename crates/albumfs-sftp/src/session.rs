//! Per-channel SFTP request handling.
//!
//! One [`SftpSession`] serves one authenticated channel. Paths from the
//! client are canonicalized before they reach the backend; handles are
//! resolved through the session's [`HandleTable`]. Backend failures map
//! to `NO_SUCH_FILE` for missing entries and `FAILURE` for everything
//! else, matching what stock SFTP clients expect.

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use albumfs_core::{DirEntry, EntryStat, VfsError, VirtualFileSystem, canonicalize};
use chrono::{DateTime, Utc};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::handles::{HandleEntry, HandleTable, ReadStage};

/// Synthetic owner and group reported for every entry.
const OWNER: &str = "nobody";

/// Directories are world-traversable, never writable in place.
const DIR_MODE: u32 = 0o40555;

/// Files are read-only; writes go through the staging flow instead.
const FILE_MODE: u32 = 0o100444;

pub struct SftpSession {
    backend: Arc<dyn VirtualFileSystem>,
    handles: HandleTable,
}

impl SftpSession {
    pub fn new(backend: Arc<dyn VirtualFileSystem>) -> Self {
        Self {
            backend,
            handles: HandleTable::default(),
        }
    }

    fn entry(&self, token: &str) -> Result<Arc<HandleEntry>, StatusCode> {
        self.handles.get(token).ok_or_else(|| {
            debug!(token, "unknown handle");
            StatusCode::Failure
        })
    }
}

fn ok_reply(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn failed(op: &'static str, target: &str, err: &VfsError) -> StatusCode {
    if err.is_not_found() {
        debug!(op, target, "entry not found");
        StatusCode::NoSuchFile
    } else {
        warn!(op, target, error = %err, "backend call failed");
        StatusCode::Failure
    }
}

fn unix_time(mtime: DateTime<Utc>) -> u32 {
    u32::try_from(mtime.timestamp()).unwrap_or(0)
}

fn synth_attrs(permissions: u32, size: u64, mtime: DateTime<Utc>) -> FileAttributes {
    FileAttributes {
        size: Some(size),
        uid: Some(0),
        user: Some(OWNER.to_string()),
        gid: Some(0),
        group: Some(OWNER.to_string()),
        permissions: Some(permissions),
        atime: Some(unix_time(mtime)),
        mtime: Some(unix_time(mtime)),
        ..FileAttributes::default()
    }
}

fn dir_attrs(mtime: DateTime<Utc>) -> FileAttributes {
    synth_attrs(DIR_MODE, 0, mtime)
}

fn file_attrs(size: u64, mtime: DateTime<Utc>) -> FileAttributes {
    synth_attrs(FILE_MODE, size, mtime)
}

fn stat_attrs(stat: &EntryStat) -> FileAttributes {
    if stat.is_dir {
        dir_attrs(stat.mtime)
    } else {
        file_attrs(stat.size, stat.mtime)
    }
}

fn listing_row(entry: DirEntry) -> File {
    let attrs = if entry.is_dir {
        dir_attrs(entry.mtime)
    } else {
        file_attrs(entry.size, entry.mtime)
    };
    File::new(entry.name, attrs)
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, ?extensions, "sftp negotiated");
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let canonical = canonicalize(&path);
        debug!(path, canonical, "realpath");
        Ok(Name {
            id,
            files: vec![File::dummy(canonical)],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        // No backend call here; a bad path surfaces at READDIR.
        let canonical = canonicalize(&path);
        let handle = self.handles.open_dir(canonical.clone());
        debug!(path = %canonical, handle, "opendir");
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entry = self.entry(&handle)?;
        let Some(listed) = entry.dir_listed() else {
            return Err(StatusCode::Failure);
        };
        // The whole listing goes out in one batch; the next call ends it.
        if listed.load(Ordering::SeqCst) {
            return Err(StatusCode::Eof);
        }
        let listing = self
            .backend
            .list_dir(&entry.path)
            .await
            .map_err(|err| failed("readdir", &entry.path, &err))?;
        listed.store(true, Ordering::SeqCst);
        let files = if listing.is_empty() {
            // An empty directory still answers with a "." row so clients
            // render it as present rather than unreadable.
            vec![File::dummy(".")]
        } else {
            listing.into_iter().map(listing_row).collect()
        };
        debug!(path = %entry.path, rows = files.len(), "readdir");
        Ok(Name { id, files })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        // Flags are recorded only for the log; both directions stage
        // lazily, so reads download on first READ and writes create
        // their temp file on first WRITE.
        let canonical = canonicalize(&filename);
        let handle = self.handles.open_file(canonical.clone());
        debug!(path = %canonical, ?pflags, handle, "open");
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let entry = self.entry(&handle)?;
        let Some(state) = entry.file() else {
            return Err(StatusCode::Failure);
        };
        let backend = &self.backend;
        let stage = state
            .read
            .get_or_try_init(|| async {
                let staged = backend
                    .read_file(&entry.path)
                    .await
                    .map_err(|err| failed("read", &entry.path, &err))?;
                let size = staged
                    .as_file()
                    .metadata()
                    .map_err(|err| {
                        warn!(path = %entry.path, error = %err, "staging metadata failed");
                        StatusCode::Failure
                    })?
                    .len();
                debug!(path = %entry.path, size, "download staged");
                Ok(ReadStage { file: staged, size })
            })
            .await?;

        if offset >= stage.size {
            return Err(StatusCode::Eof);
        }
        let mut data = vec![0_u8; len as usize];
        let n = stage.file.as_file().read_at(&mut data, offset).map_err(|err| {
            warn!(path = %entry.path, error = %err, "staging read failed");
            StatusCode::Failure
        })?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let entry = self.entry(&handle)?;
        let Some(state) = entry.file() else {
            return Err(StatusCode::Failure);
        };
        let mut write = state.write.lock().await;
        let staged = match write.take() {
            Some(staged) => staged,
            None => {
                debug!(path = %entry.path, "upload staging started");
                NamedTempFile::new().map_err(|err| {
                    warn!(path = %entry.path, error = %err, "staging create failed");
                    StatusCode::Failure
                })?
            }
        };
        let result = staged.as_file().write_all_at(&data, offset);
        // Keep the staging around even when one chunk fails.
        *write = Some(staged);
        result.map_err(|err| {
            warn!(path = %entry.path, error = %err, "staging write failed");
            StatusCode::Failure
        })?;
        Ok(ok_reply(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        // The handle is gone either way; only the staged upload outcome
        // decides the reply.
        let Some(entry) = self.handles.remove(&handle) else {
            debug!(handle, "close on unknown handle");
            return Err(StatusCode::Failure);
        };
        if let Some(state) = entry.file() {
            let staged = state.write.lock().await.take();
            if let Some(staged) = staged {
                self.backend
                    .write_file(&entry.path, staged)
                    .await
                    .map_err(|err| failed("close", &entry.path, &err))?;
                debug!(path = %entry.path, "staged upload handed to backend");
            }
        }
        Ok(ok_reply(id))
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let canonical = canonicalize(&path);
        let stat = self
            .backend
            .stat(&canonical)
            .await
            .map_err(|err| failed("stat", &canonical, &err))?;
        match stat {
            Some(stat) => Ok(Attrs {
                id,
                attrs: stat_attrs(&stat),
            }),
            None => {
                debug!(path = %canonical, "stat miss");
                Err(StatusCode::NoSuchFile)
            }
        }
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // No symlinks anywhere in this tree.
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let entry = self.entry(&handle)?;
        self.stat(id, entry.path.clone()).await
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let canonical = canonicalize(&path);
        let mtime = attrs
            .mtime
            .and_then(|secs| DateTime::from_timestamp(i64::from(secs), 0))
            .unwrap_or_else(Utc::now);
        self.backend
            .set_mtime(&canonical, mtime)
            .await
            .map_err(|err| failed("setstat", &canonical, &err))?;
        Ok(ok_reply(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = canonicalize(&oldpath);
        let to = canonicalize(&newpath);
        self.backend
            .rename(&from, &to)
            .await
            .map_err(|err| failed("rename", &from, &err))?;
        Ok(ok_reply(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let canonical = canonicalize(&filename);
        self.backend
            .remove(&canonical)
            .await
            .map_err(|err| failed("remove", &canonical, &err))?;
        Ok(ok_reply(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let canonical = canonicalize(&path);
        self.backend
            .remove(&canonical)
            .await
            .map_err(|err| failed("rmdir", &canonical, &err))?;
        Ok(ok_reply(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let canonical = canonicalize(&path);
        self.backend
            .mkdir(&canonical)
            .await
            .map_err(|err| failed("mkdir", &canonical, &err))?;
        Ok(ok_reply(id))
    }
}
