//! Checkpoint files for resumable transfers
//!
//! A checkpoint is JSON of the form
//! `{"Magic": ..., "MD5": <hex md5 of Data>, "Data": {...}}`. The file name
//! is derived from hashes of the destination and source names, so the same
//! transfer pair always finds its own file and a different pair never does.
//! Reading and writing are best effort: a checkpoint that cannot be
//! written only costs resumability.

use crate::crc64::Crc64;
use crate::error::{Error, Result};
use crate::ops::ObjectMeta;
use crate::transfer::download::DownloadRequest;
use crate::transfer::oss_path;
use crate::transfer::upload::UploadRequest;
use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Fixed marker identifying checkpoint files
pub const CHECKPOINT_MAGIC: &str = "92611BED-89E2-46B6-89E5-72F273D4B0A3";

/// Extension of download checkpoints
pub const DOWNLOAD_EXTENSION: &str = "dcp";

/// Extension of upload checkpoints
pub const UPLOAD_EXTENSION: &str = "ucp";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<D> {
    magic: String,
    #[serde(rename = "MD5")]
    md5: String,
    data: D,
}

fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Parses a checkpoint file, returning its payload only if the magic and
/// payload digest check out.
fn parse_envelope<D: DeserializeOwned + Serialize>(raw: &[u8]) -> Option<D> {
    let envelope: Envelope<D> = serde_json::from_slice(raw).ok()?;
    if envelope.magic != CHECKPOINT_MAGIC {
        return None;
    }
    let payload = serde_json::to_vec(&envelope.data).ok()?;
    if md5_hex(&payload) != envelope.md5 {
        return None;
    }
    Some(envelope.data)
}

/// Writes the checkpoint next to its final name, then renames it into place.
async fn write_envelope<D: Serialize>(path: &Path, data: &D) -> Result<()> {
    let payload = serde_json::to_vec(data)?;
    let envelope = Envelope {
        magic: CHECKPOINT_MAGIC.to_string(),
        md5: md5_hex(&payload),
        data,
    };
    let content = serde_json::to_vec(&envelope)?;

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove checkpoint {}: {}", path.display(), e);
        }
    }
}

/// Resolves the directory checkpoint files go in.
///
/// An explicit directory must exist; without one the system temp
/// directory is used.
pub fn resolve_checkpoint_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let Some(dir) = dir else {
        return Ok(std::env::temp_dir());
    };
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(dir.to_path_buf()),
        Ok(_) => Err(Error::CheckpointDir(dir.to_path_buf(), "not a directory".to_string())),
        Err(e) => Err(Error::CheckpointDir(dir.to_path_buf(), e.to_string())),
    }
}

/// Absolute form of `path` without touching the filesystem.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn checkpoint_path(dir: &Path, dest: &str, source: &str, extension: &str) -> PathBuf {
    dir.join(format!(
        "{}-{}.{}",
        md5_hex(dest.as_bytes()),
        md5_hex(source.as_bytes()),
        extension
    ))
}

/// Identity of a download source: the object path plus its version and range
/// as query parameters.
fn download_source(name: &str, version_id: &str, range: &str) -> String {
    let mut params = Vec::new();
    if !version_id.is_empty() {
        params.push(format!("versionId={}", version_id));
    }
    if !range.is_empty() {
        params.push(format!("range={}", range));
    }
    if params.is_empty() {
        name.to_string()
    } else {
        format!("{}?{}", name, params.join("&"))
    }
}

/// Modification time in the form stored in upload checkpoints
pub fn format_mtime(modified: SystemTime) -> String {
    DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadObjectInfo {
    pub name: String,
    pub version_id: String,
    pub range: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadObjectMeta {
    pub size: u64,
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Absolute object offset everything before which is on disk
    #[serde(rename = "Offset")]
    pub offset: u64,
    /// CRC-64 of the bytes between the range start and `offset`
    #[serde(rename = "CRC64")]
    pub crc64: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadData {
    pub object_info: DownloadObjectInfo,
    pub object_meta: DownloadObjectMeta,
    pub file_path: String,
    pub part_size: u64,
    pub download_info: DownloadProgress,
}

/// Resume state of one download
#[derive(Debug)]
pub struct DownloadCheckpoint {
    path: PathBuf,
    local_path: PathBuf,
    range_start: u64,
    verify_data: bool,
    loaded: bool,
    data: DownloadData,
}

impl DownloadCheckpoint {
    /// Builds the in-memory checkpoint for downloading into `local_path`.
    pub fn open(
        request: &DownloadRequest,
        local_path: &Path,
        checkpoint_dir: Option<&Path>,
        meta: &ObjectMeta,
        part_size: u64,
        verify_data: bool,
    ) -> Result<Self> {
        let dir = resolve_checkpoint_dir(checkpoint_dir)?;
        let local_path = absolute_path(local_path)?;

        let name = oss_path(&request.bucket, &request.key);
        let version_id = request.version_id.clone().unwrap_or_default();
        let range = request.range.map(|r| r.to_string()).unwrap_or_default();
        let range_start = request.range.map(|r| r.start).unwrap_or(0);

        let source = download_source(&name, &version_id, &range);
        let file_path = local_path.to_string_lossy().into_owned();
        let path = checkpoint_path(&dir, &file_path, &source, DOWNLOAD_EXTENSION);

        Ok(Self {
            path,
            local_path,
            range_start,
            verify_data,
            loaded: false,
            data: DownloadData {
                object_info: DownloadObjectInfo {
                    name,
                    version_id,
                    range,
                },
                object_meta: DownloadObjectMeta {
                    size: meta.content_length,
                    last_modified: meta.last_modified.clone(),
                    etag: meta.etag.clone(),
                },
                file_path,
                part_size,
                download_info: DownloadProgress {
                    offset: range_start,
                    crc64: 0,
                },
            },
        })
    }

    /// Loads a previous run's progress if it still describes this transfer.
    ///
    /// A file that fails any check is deleted.
    pub async fn load(&mut self) -> bool {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return false,
        };

        let valid = match parse_envelope::<DownloadData>(&raw) {
            Some(stored) if self.matches(&stored).await => Some(stored),
            _ => None,
        };

        match valid {
            Some(stored) => {
                debug!(
                    "Resuming download of {} from offset {}",
                    stored.object_info.name, stored.download_info.offset
                );
                self.data = stored;
                self.loaded = true;
                true
            }
            None => {
                debug!("Discarding stale checkpoint {}", self.path.display());
                self.remove().await;
                false
            }
        }
    }

    async fn matches(&self, stored: &DownloadData) -> bool {
        if stored.object_info != self.data.object_info
            || stored.object_meta != self.data.object_meta
            || stored.file_path != self.data.file_path
            || stored.part_size != self.data.part_size
            || stored.part_size == 0
        {
            return false;
        }

        let offset = stored.download_info.offset;
        if offset < self.range_start || (offset - self.range_start) % stored.part_size != 0 {
            return false;
        }

        if self.verify_data {
            return match crc_of_prefix(&self.local_path, offset - self.range_start).await {
                Ok(crc) => crc == stored.download_info.crc64,
                Err(e) => {
                    debug!("Cannot verify {}: {}", self.local_path.display(), e);
                    false
                }
            };
        }
        true
    }

    /// Persists the current progress; failures are logged, not raised.
    pub async fn dump(&self) -> bool {
        match write_envelope(&self.path, &self.data).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write checkpoint {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub async fn remove(&self) {
        remove_file(&self.path).await;
    }

    /// Records that everything before `offset` is on disk.
    pub fn set_progress(&mut self, offset: u64, crc64: u64) {
        self.data.download_info = DownloadProgress { offset, crc64 };
    }

    pub fn progress(&self) -> DownloadProgress {
        self.data.download_info
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &DownloadData {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn data_mut(&mut self) -> &mut DownloadData {
        &mut self.data
    }
}

async fn crc_of_prefix(path: &Path, len: u64) -> Result<u64> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = file.take(len);
    let mut crc = Crc64::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    if crc.len() != len {
        return Err(Error::Consistency(format!(
            "local file holds {} bytes, checkpoint expects {}",
            crc.len(),
            len
        )));
    }
    Ok(crc.value())
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadFileMeta {
    pub size: u64,
    pub last_modified: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadObjectInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadProgress {
    pub upload_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadData {
    pub file_path: String,
    pub file_meta: UploadFileMeta,
    pub object_info: UploadObjectInfo,
    pub part_size: u64,
    pub upload_info: UploadProgress,
}

/// Resume state of one upload: the multipart session it belongs to
#[derive(Debug)]
pub struct UploadCheckpoint {
    path: PathBuf,
    loaded: bool,
    data: UploadData,
}

impl UploadCheckpoint {
    /// Builds the in-memory checkpoint for uploading `local_path`.
    pub fn open(
        request: &UploadRequest,
        local_path: &Path,
        checkpoint_dir: Option<&Path>,
        file_size: u64,
        modified: SystemTime,
        part_size: u64,
    ) -> Result<Self> {
        let dir = resolve_checkpoint_dir(checkpoint_dir)?;
        let local_path = absolute_path(local_path)?;
        let name = oss_path(&request.bucket, &request.key);
        let file_path = local_path.to_string_lossy().into_owned();
        let path = checkpoint_path(&dir, &name, &file_path, UPLOAD_EXTENSION);

        Ok(Self {
            path,
            loaded: false,
            data: UploadData {
                file_path,
                file_meta: UploadFileMeta {
                    size: file_size,
                    last_modified: format_mtime(modified),
                },
                object_info: UploadObjectInfo { name },
                part_size,
                upload_info: UploadProgress::default(),
            },
        })
    }

    /// Loads the session id of a previous run if the file and object are unchanged.
    ///
    /// A file that fails any check is deleted.
    pub async fn load(&mut self) -> bool {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return false,
        };

        match parse_envelope::<UploadData>(&raw) {
            Some(stored)
                if stored.file_path == self.data.file_path
                    && stored.file_meta == self.data.file_meta
                    && stored.object_info == self.data.object_info
                    && stored.part_size == self.data.part_size
                    && !stored.upload_info.upload_id.is_empty() =>
            {
                debug!(
                    "Found upload session {} for {}",
                    stored.upload_info.upload_id, stored.object_info.name
                );
                self.data = stored;
                self.loaded = true;
                true
            }
            _ => {
                debug!("Discarding stale checkpoint {}", self.path.display());
                self.remove().await;
                false
            }
        }
    }

    /// Persists the session id; failures are logged, not raised.
    pub async fn dump(&self) -> bool {
        match write_envelope(&self.path, &self.data).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write checkpoint {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub async fn remove(&self) {
        remove_file(&self.path).await;
    }

    pub fn upload_id(&self) -> Option<&str> {
        let id = self.data.upload_info.upload_id.as_str();
        (!id.is_empty()).then_some(id)
    }

    pub fn set_upload_id(&mut self, upload_id: &str) {
        self.data.upload_info.upload_id = upload_id.to_string();
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &UploadData {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn data_mut(&mut self) -> &mut UploadData {
        &mut self.data
    }
}
