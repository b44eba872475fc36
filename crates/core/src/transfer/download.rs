//! Download: ranged gets written at their offsets, resumable through a checkpoint

use super::{
    adjust_part_size, oss_path, range_header, run_parts, validate_bucket_name, validate_object_key,
    verify_crc, ErrorAggregate, Part, PartConsumer, PartIter, PartResult, PartWorker, Progress,
    ProgressCallback, TransferOptions, DEFAULT_PART_SIZE, TEMP_FILE_SUFFIX,
};
use crate::checkpoint::DownloadCheckpoint;
use crate::crc64::{self, Crc64};
use crate::error::{Error, Result};
use crate::ops::{GetObjectRequest, HeadObjectRequest, ObjectClient, ObjectMeta};
use async_trait::async_trait;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Inclusive byte range, `bytes=start-end` or `bytes=start-`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Resolves against an object of `size` bytes to `[start, end)`.
    ///
    /// An end past the object is clamped to its last byte.
    pub fn resolve(&self, size: u64) -> Result<(u64, u64)> {
        if self.start >= size {
            return Err(Error::InvalidInput(format!(
                "range {} starts beyond object size {}",
                self, size
            )));
        }
        let end = match self.end {
            Some(end) if end < self.start => {
                return Err(Error::InvalidInput(format!("range {} ends before it starts", self)))
            }
            Some(end) => end.saturating_add(1).min(size),
            None => size,
        };
        Ok((self.start, end))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

impl FromStr for ByteRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid range: {:?}", s));
        let bounds = s.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        let (start, end) = bounds.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        if matches!(end, Some(end) if end < start) {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// What to download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub range: Option<ByteRange>,
    pub progress: Option<ProgressCallback>,
}

impl DownloadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            range: None,
            progress: None,
        }
    }

    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Writer that can be repositioned, so parts may land out of order
pub trait SeekWrite: AsyncWrite + AsyncSeek + Send + Unpin {}

impl<T: AsyncWrite + AsyncSeek + Send + Unpin> SeekWrite for T {}

/// Where downloaded bytes go
pub enum DownloadDestination {
    /// Local file; parallel and resumable
    File(PathBuf),
    /// Seekable writer positioned at the start of the data; parallel
    Seekable(Box<dyn SeekWrite>),
    /// Plain writer; parts are fetched one at a time in order
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
}

impl fmt::Debug for DownloadDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadDestination::File(path) => f.debug_tuple("File").field(path).finish(),
            DownloadDestination::Seekable(_) => f.write_str("Seekable"),
            DownloadDestination::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResult {
    /// Size of the downloaded data, including bytes resumed from a checkpoint
    pub written: u64,
}

enum Sink {
    Seekable(Mutex<Box<dyn SeekWrite>>),
    Stream(Mutex<Box<dyn AsyncWrite + Send + Unpin>>),
}

impl Sink {
    async fn write_at(&self, position: u64, data: &[u8]) -> Result<()> {
        match self {
            Sink::Seekable(writer) => {
                let mut writer = writer.lock().await;
                writer.seek(SeekFrom::Start(position)).await?;
                writer.write_all(data).await?;
            }
            Sink::Stream(writer) => {
                writer.lock().await.write_all(data).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        match self {
            Sink::Seekable(writer) => writer.lock().await.flush().await?,
            Sink::Stream(writer) => writer.lock().await.flush().await?,
        }
        Ok(())
    }
}

struct DownloadWorker {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    version_id: Option<String>,
    etag: String,
    range_start: u64,
    sink: Sink,
}

#[async_trait]
impl PartWorker for DownloadWorker {
    async fn transfer_part(&self, part: Part) -> Result<PartResult> {
        debug!("Fetching part {} ({} bytes at {})", part.number, part.size, part.offset);
        let output = self
            .client
            .get_object(GetObjectRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                version_id: self.version_id.clone(),
                range: Some(range_header(part.offset, part.size)),
                if_match: Some(self.etag.clone()),
            })
            .await?;

        if output.body.len() as u64 != part.size {
            return Err(Error::Consistency(format!(
                "part {} returned {} bytes, expected {}",
                part.number,
                output.body.len(),
                part.size
            )));
        }

        let crc = crc64::checksum(&output.body);
        self.sink
            .write_at(part.offset - self.range_start, &output.body)
            .await?;

        Ok(PartResult {
            number: part.number,
            offset: part.offset,
            size: part.size,
            etag: output.etag,
            crc64: Some(crc),
        })
    }
}

struct DownloadConsumer {
    next_offset: u64,
    crc: Crc64,
    progress: Progress,
    checkpoint: Option<DownloadCheckpoint>,
}

#[async_trait]
impl PartConsumer for DownloadConsumer {
    async fn consume(&mut self, done: PartResult) -> Result<()> {
        if done.offset != self.next_offset {
            return Err(Error::Consistency(format!(
                "part {} starts at {}, expected {}",
                done.number, done.offset, self.next_offset
            )));
        }
        self.next_offset += done.size;
        if let Some(crc) = done.crc64 {
            self.crc.combine(crc, done.size);
        }
        self.progress.advance(done.size);

        if let Some(checkpoint) = &mut self.checkpoint {
            checkpoint.set_progress(self.next_offset, self.crc.value());
            checkpoint.dump().await;
        }
        Ok(())
    }
}

/// Downloads objects in parallel ranged parts
pub struct Downloader {
    client: Arc<dyn ObjectClient>,
    options: TransferOptions,
}

impl Downloader {
    pub fn new(client: Arc<dyn ObjectClient>, options: TransferOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Downloads into a local file.
    pub async fn download_file(
        &self,
        request: DownloadRequest,
        path: impl AsRef<Path>,
    ) -> Result<DownloadResult> {
        self.download(request, DownloadDestination::File(path.as_ref().to_path_buf()))
            .await
    }

    pub async fn download(
        &self,
        request: DownloadRequest,
        destination: DownloadDestination,
    ) -> Result<DownloadResult> {
        self.download_with_options(request, destination, &self.options)
            .await
    }

    /// Downloads with per-call options replacing the downloader's.
    pub async fn download_with_options(
        &self,
        request: DownloadRequest,
        destination: DownloadDestination,
        options: &TransferOptions,
    ) -> Result<DownloadResult> {
        validate_bucket_name(&request.bucket)?;
        validate_object_key(&request.key)?;
        let options = options.resolved(DEFAULT_PART_SIZE);
        let path = oss_path(&request.bucket, &request.key);

        let meta = self
            .client
            .head_object(HeadObjectRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                version_id: request.version_id.clone(),
            })
            .await
            .map_err(|e| e.wrap("download", path.clone(), None))?;

        self.run(&request, destination, &options, &meta)
            .await
            .map_err(|e| e.wrap("download", path, None))
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        destination: DownloadDestination,
        options: &TransferOptions,
        meta: &ObjectMeta,
    ) -> Result<DownloadResult> {
        let (start, end) = match request.range {
            Some(range) => range.resolve(meta.content_length)?,
            None => (0, meta.content_length),
        };
        let total = end - start;
        let part_size = adjust_part_size(total, options.part_size);

        let mut checkpoint = None;
        let mut file_paths = None;
        let (sink, seekable) = match destination {
            DownloadDestination::File(target) => {
                let write_path = if options.use_temp_file {
                    let mut temp = target.as_os_str().to_owned();
                    temp.push(TEMP_FILE_SUFFIX);
                    PathBuf::from(temp)
                } else {
                    target.clone()
                };
                if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }

                if options.enable_checkpoint {
                    let mut cp = DownloadCheckpoint::open(
                        request,
                        &write_path,
                        options.checkpoint_dir.as_deref(),
                        meta,
                        part_size,
                        options.verify_data,
                    )?;
                    cp.load().await;
                    checkpoint = Some(cp);
                }

                let resuming = checkpoint.as_ref().is_some_and(|cp| cp.loaded());
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(!resuming)
                    .open(&write_path)
                    .await?;
                file_paths = Some((write_path, target));
                (Sink::Seekable(Mutex::new(Box::new(file))), true)
            }
            DownloadDestination::Seekable(writer) => (Sink::Seekable(Mutex::new(writer)), true),
            DownloadDestination::Stream(writer) => (Sink::Stream(Mutex::new(writer)), false),
        };

        let (offset, crc) = match &checkpoint {
            Some(cp) if cp.loaded() => {
                let progress = cp.progress();
                (progress.offset, Crc64::with_initial(progress.crc64, progress.offset - start))
            }
            _ => (start, Crc64::new()),
        };

        let mut progress = Progress::new(request.progress.clone(), total);
        progress.resume(offset - start);

        let parallel = if seekable && total > part_size {
            options.parallel_num
        } else {
            1
        };
        debug!(
            "Downloading {} bytes of oss://{}/{} from offset {}, part size {}, parallel {}",
            total, request.bucket, request.key, offset, part_size, parallel
        );

        let errors = Arc::new(ErrorAggregate::default());
        let worker = DownloadWorker {
            client: self.client.clone(),
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            version_id: request.version_id.clone(),
            etag: meta.etag.clone(),
            range_start: start,
            sink,
        };
        let mut consumer = DownloadConsumer {
            next_offset: offset,
            crc,
            progress,
            checkpoint,
        };

        // part numbers only label log lines here
        let first_number = ((offset - start) / part_size) as u32 + 1;
        let parts = PartIter::new(first_number, offset, end, part_size, errors.clone());
        run_parts(
            &worker,
            futures::stream::iter(parts.map(Ok)),
            parallel,
            &errors,
            &mut consumer,
        )
        .await;

        let flushed = worker.sink.flush().await;
        drop(worker);

        if let Some(err) = errors.take_first() {
            if consumer.checkpoint.is_none() {
                if let Some((write_path, target)) = &file_paths {
                    if write_path != target {
                        let _ = tokio::fs::remove_file(write_path).await;
                    }
                }
            }
            return Err(err);
        }
        flushed?;

        if options.enable_crc && request.range.is_none() {
            if let Err(err) = verify_crc(consumer.crc.value(), meta.hash_crc64.as_deref()) {
                if let Some(cp) = &consumer.checkpoint {
                    cp.remove().await;
                }
                if let Some((write_path, _)) = &file_paths {
                    let _ = tokio::fs::remove_file(write_path).await;
                }
                return Err(err);
            }
        }

        if let Some((write_path, target)) = &file_paths {
            if write_path != target {
                tokio::fs::rename(write_path, target).await?;
            }
        }
        if let Some(cp) = &consumer.checkpoint {
            cp.remove().await;
        }

        info!(
            "Downloaded oss://{}/{} ({} bytes)",
            request.bucket,
            request.key,
            consumer.progress.transferred()
        );
        Ok(DownloadResult {
            written: consumer.progress.transferred(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!("bytes=0-99".parse::<ByteRange>().unwrap(), ByteRange::new(0, Some(99)));
        assert_eq!("bytes=100-".parse::<ByteRange>().unwrap(), ByteRange::new(100, None));
        assert!("0-99".parse::<ByteRange>().is_err());
        assert!("bytes=9-1".parse::<ByteRange>().is_err());
        assert!("bytes=a-b".parse::<ByteRange>().is_err());
    }

    #[test]
    fn test_range_display() {
        assert_eq!(ByteRange::new(5, Some(10)).to_string(), "bytes=5-10");
        assert_eq!(ByteRange::new(5, None).to_string(), "bytes=5-");
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(ByteRange::new(0, Some(99)).resolve(1000).unwrap(), (0, 100));
        assert_eq!(ByteRange::new(900, None).resolve(1000).unwrap(), (900, 1000));
        assert_eq!(ByteRange::new(900, Some(5000)).resolve(1000).unwrap(), (900, 1000));
        assert!(ByteRange::new(1000, None).resolve(1000).is_err());
    }

    #[test]
    fn test_resolve_range_ending_at_u64_max() {
        let range: ByteRange = "bytes=0-18446744073709551615".parse().unwrap();
        assert_eq!(range.resolve(1000).unwrap(), (0, 1000));
        assert_eq!(ByteRange::new(10, Some(u64::MAX)).resolve(20).unwrap(), (10, 20));
    }
}
