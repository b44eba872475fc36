//! Upload: single put for small sources, resumable multipart otherwise

use super::{
    adjust_part_size, oss_path, run_parts, validate_bucket_name, validate_object_key, verify_crc,
    ErrorAggregate, Part, PartConsumer, PartIter, PartResult, PartWorker, Progress,
    ProgressCallback, TransferOptions, TransferResult, DEFAULT_PART_SIZE, MAX_PARTS,
};
use crate::checkpoint::UploadCheckpoint;
use crate::crc64::{self, Crc64};
use crate::error::{Error, Result};
use crate::ops::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedPart,
    InitiateMultipartUploadRequest, ListPartsRequest, ObjectClient, PutObjectRequest,
    UploadPartRequest, UploadedPart,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Where to upload and with which object attributes
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    /// Url-encoded `k=v&k2=v2`
    pub tagging: Option<String>,
    pub progress: Option<ProgressCallback>,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Bytes to upload
pub enum UploadSource {
    /// Local file; size is known, parts are read at their offsets in parallel
    File(PathBuf),
    /// Stream of unknown size; parts are read and sent one at a time
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::File(path) => f.debug_tuple("File").field(path).finish(),
            UploadSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// Reads up to `size` bytes, stopping early only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, size: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(64 * 1024 * 1024) as usize);
    reader.take(size).read_to_end(&mut buf).await?;
    Ok(buf)
}

struct UploadWorker {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    upload_id: String,
    file: Option<PathBuf>,
}

impl UploadWorker {
    async fn read_section(&self, part: &Part) -> Result<Vec<u8>> {
        let path = self.file.as_ref().ok_or_else(|| {
            Error::Consistency(format!("part {} has no data source", part.number))
        })?;
        // a handle per part keeps concurrent reads independent
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(part.offset)).await?;
        let mut buf = vec![0u8; part.size as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl PartWorker for UploadWorker {
    async fn transfer_part(&self, mut part: Part) -> Result<PartResult> {
        let body = match part.body.take() {
            Some(body) => body,
            None => self.read_section(&part).await?,
        };
        let crc = crc64::checksum(&body);
        debug!("Uploading part {} ({} bytes at {})", part.number, part.size, part.offset);

        let output = self
            .client
            .upload_part(UploadPartRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                upload_id: self.upload_id.clone(),
                part_number: part.number,
                body,
            })
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

struct UploadConsumer {
    parts: Vec<CompletedPart>,
    crc: Crc64,
    crc_known: bool,
    progress: Progress,
}

#[async_trait]
impl PartConsumer for UploadConsumer {
    async fn consume(&mut self, done: PartResult) -> Result<()> {
        self.parts.push(CompletedPart {
            part_number: done.number,
            etag: done.etag,
        });
        match done.crc64 {
            Some(crc) => self.crc.combine(crc, done.size),
            None => self.crc_known = false,
        }
        self.progress.advance(done.size);
        Ok(())
    }
}

/// Parts a previous run already stored in the session
struct ResumedParts {
    parts: Vec<UploadedPart>,
}

impl ResumedParts {
    fn next_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    fn bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Parts sorted by number must run 1..n without gaps, each exactly
    /// `part_size` long except a shorter last one that ends the file.
    fn fits(&self, part_size: u64, file_size: u64) -> bool {
        let count = self.parts.len();
        let contiguous = self.parts.iter().enumerate().all(|(i, p)| {
            p.part_number as usize == i + 1
                && (p.size == part_size || (i + 1 == count && p.size < part_size))
        });
        let bytes = self.bytes();
        // a short last part is only valid when it ends the file
        let aligned = bytes % part_size == 0 || bytes == file_size;
        contiguous && aligned && bytes <= file_size
    }
}

/// State for a sequential stream source
struct ReaderState {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    first: Option<Vec<u8>>,
    next_number: u32,
    offset: u64,
    done: bool,
    errors: Arc<ErrorAggregate>,
}

fn reader_parts(state: ReaderState, part_size: u64) -> BoxStream<'static, Result<Part>> {
    stream::unfold(state, move |mut state| async move {
        if state.done || state.errors.has_error() {
            return None;
        }
        let body = match state.first.take() {
            Some(body) => body,
            None => match read_chunk(&mut state.reader, part_size).await {
                Ok(body) => body,
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            },
        };
        if body.is_empty() {
            return None;
        }
        if (body.len() as u64) < part_size {
            state.done = true;
        }
        if state.next_number as u64 > MAX_PARTS {
            state.done = true;
            return Some((
                Err(Error::InvalidInput(format!(
                    "stream needs more than {} parts of {} bytes",
                    MAX_PARTS, part_size
                ))),
                state,
            ));
        }

        let part = Part {
            number: state.next_number,
            offset: state.offset,
            size: body.len() as u64,
            body: Some(body),
        };
        state.next_number += 1;
        state.offset += part.size;
        Some((Ok(part), state))
    })
    .boxed()
}

/// Uploads files and streams, switching to multipart above the part size
pub struct Uploader {
    client: Arc<dyn ObjectClient>,
    options: TransferOptions,
}

impl Uploader {
    pub fn new(client: Arc<dyn ObjectClient>, options: TransferOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Uploads a local file.
    pub async fn upload_file(
        &self,
        request: UploadRequest,
        path: impl AsRef<Path>,
    ) -> Result<TransferResult> {
        self.upload(request, UploadSource::File(path.as_ref().to_path_buf()))
            .await
    }

    pub async fn upload(&self, request: UploadRequest, source: UploadSource) -> Result<TransferResult> {
        self.upload_with_options(request, source, &self.options).await
    }

    /// Uploads with per-call options replacing the uploader's.
    pub async fn upload_with_options(
        &self,
        request: UploadRequest,
        source: UploadSource,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        validate_bucket_name(&request.bucket)?;
        validate_object_key(&request.key)?;
        let options = options.resolved(DEFAULT_PART_SIZE);
        let path = oss_path(&request.bucket, &request.key);

        match source {
            UploadSource::File(file) => self
                .upload_from_file(&request, &file, &options)
                .await
                .map_err(|(e, upload_id)| e.wrap("upload", path, upload_id)),
            UploadSource::Reader(mut reader) => {
                let first = read_chunk(&mut reader, options.part_size)
                    .await
                    .map_err(|e| e.wrap("upload", path.clone(), None))?;
                if (first.len() as u64) < options.part_size {
                    return self
                        .put_single(&request, first, &options)
                        .await
                        .map_err(|e| e.wrap("upload", path, None));
                }

                let state = ReaderState {
                    reader,
                    first: Some(first),
                    next_number: 1,
                    offset: 0,
                    done: false,
                    errors: Arc::new(ErrorAggregate::default()),
                };
                self.upload_stream(&request, &options, state)
                    .await
                    .map_err(|(e, upload_id)| e.wrap("upload", path, upload_id))
            }
        }
    }

    async fn upload_from_file(
        &self,
        request: &UploadRequest,
        file: &Path,
        options: &TransferOptions,
    ) -> std::result::Result<TransferResult, (Error, Option<String>)> {
        let meta = tokio::fs::metadata(file).await.map_err(|e| (Error::from(e), None))?;
        if !meta.is_file() {
            return Err((
                Error::InvalidInput(format!("{} is not a regular file", file.display())),
                None,
            ));
        }
        let size = meta.len();
        let part_size = adjust_part_size(size, options.part_size);

        if size <= part_size {
            let body = tokio::fs::read(file).await.map_err(|e| (Error::from(e), None))?;
            return self
                .put_single(request, body, options)
                .await
                .map_err(|e| (e, None));
        }

        let mut checkpoint = None;
        if options.enable_checkpoint {
            let modified = meta.modified().map_err(|e| (Error::from(e), None))?;
            let mut cp = UploadCheckpoint::open(
                request,
                file,
                options.checkpoint_dir.as_deref(),
                size,
                modified,
                part_size,
            )
            .map_err(|e| (e, None))?;
            cp.load().await;
            checkpoint = Some(cp);
        }

        let errors = Arc::new(ErrorAggregate::default());
        let state = FileState {
            path: file.to_path_buf(),
            size,
            errors,
        };
        self.upload_file_multipart(request, options, part_size, checkpoint, state)
            .await
    }

    async fn put_single(
        &self,
        request: &UploadRequest,
        body: Vec<u8>,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        let len = body.len() as u64;
        let crc = crc64::checksum(&body);
        debug!("Uploading {} bytes to oss://{}/{} in one request", len, request.bucket, request.key);

        let output = self
            .client
            .put_object(PutObjectRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                body,
                content_type: request.content_type.clone(),
                metadata: request.metadata.clone(),
                storage_class: request.storage_class.clone(),
                tagging: request.tagging.clone(),
            })
            .await?;

        let mut progress = Progress::new(request.progress.clone(), len);
        progress.advance(len);

        if options.enable_crc {
            verify_crc(crc, output.hash_crc64.as_deref())?;
        }
        Ok(TransferResult::from_output(output, None))
    }

    async fn upload_file_multipart(
        &self,
        request: &UploadRequest,
        options: &TransferOptions,
        part_size: u64,
        mut checkpoint: Option<UploadCheckpoint>,
        state: FileState,
    ) -> std::result::Result<TransferResult, (Error, Option<String>)> {
        let mut resumed = None;
        if let Some(upload_id) = checkpoint.as_ref().and_then(|cp| cp.upload_id()) {
            match self
                .confirm_session(request, upload_id, part_size, state.size)
                .await
            {
                Some(parts) => resumed = Some((upload_id.to_string(), parts)),
                None => {
                    debug!("Upload session {} cannot be resumed, starting over", upload_id);
                }
            }
        }

        let (upload_id, resumed_parts) = match resumed {
            Some((upload_id, parts)) => (upload_id, Some(parts)),
            None => {
                let id = self.initiate(request).await.map_err(|e| (e, None))?;
                if let Some(cp) = &mut checkpoint {
                    cp.set_upload_id(&id);
                    cp.dump().await;
                }
                (id, None)
            }
        };

        let (first_number, offset) = match &resumed_parts {
            Some(parts) => (parts.next_number(), parts.bytes()),
            None => (1, 0),
        };
        let parts = stream::iter(
            PartIter::new(first_number, offset, state.size, part_size, state.errors.clone())
                .map(Ok::<Part, Error>),
        )
        .boxed();

        self.drive(
            request,
            options,
            options.parallel_num,
            upload_id,
            Some(state.path),
            state.size,
            resumed_parts,
            parts,
            state.errors,
            checkpoint,
        )
        .await
    }

    /// Parts are read and sent one at a time, in order; the total size is
    /// unknown so progress reports a total of 0.
    async fn upload_stream(
        &self,
        request: &UploadRequest,
        options: &TransferOptions,
        state: ReaderState,
    ) -> std::result::Result<TransferResult, (Error, Option<String>)> {
        let upload_id = self.initiate(request).await.map_err(|e| (e, None))?;
        let errors = state.errors.clone();
        let parts = reader_parts(state, options.part_size);
        self.drive(request, options, 1, upload_id, None, 0, None, parts, errors, None)
            .await
    }

    /// Lists the parts of a stored session, all pages of them; `None` when
    /// the session is gone or its parts do not fit the file.
    async fn confirm_session(
        &self,
        request: &UploadRequest,
        upload_id: &str,
        part_size: u64,
        file_size: u64,
    ) -> Option<ResumedParts> {
        let mut parts = Vec::new();
        let mut marker = None;
        loop {
            let page = match self
                .client
                .list_parts(ListPartsRequest {
                    bucket: request.bucket.clone(),
                    key: request.key.clone(),
                    upload_id: upload_id.to_string(),
                    part_number_marker: marker,
                })
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    debug!("Listing parts of {} failed: {}", upload_id, e);
                    return None;
                }
            };
            parts.extend(page.parts);
            match page.next_part_number_marker {
                Some(next) if page.is_truncated => marker = Some(next),
                _ => break,
            }
        }

        parts.sort_by_key(|p| p.part_number);
        let resumed = ResumedParts { parts };
        resumed.fits(part_size, file_size).then_some(resumed)
    }

    async fn initiate(&self, request: &UploadRequest) -> Result<String> {
        let upload_id = self
            .client
            .initiate_multipart_upload(InitiateMultipartUploadRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                content_type: request.content_type.clone(),
                metadata: request.metadata.clone(),
                storage_class: request.storage_class.clone(),
                tagging: request.tagging.clone(),
                server_side_encryption: None,
            })
            .await?;
        info!(
            "Opened upload session {} for oss://{}/{}",
            upload_id, request.bucket, request.key
        );
        Ok(upload_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        request: &UploadRequest,
        options: &TransferOptions,
        parallel: usize,
        upload_id: String,
        file: Option<PathBuf>,
        total: u64,
        resumed: Option<ResumedParts>,
        parts: BoxStream<'static, Result<Part>>,
        errors: Arc<ErrorAggregate>,
        checkpoint: Option<UploadCheckpoint>,
    ) -> std::result::Result<TransferResult, (Error, Option<String>)> {
        let mut consumer = UploadConsumer {
            parts: Vec::new(),
            crc: Crc64::new(),
            crc_known: true,
            progress: Progress::new(request.progress.clone(), total),
        };
        if let Some(resumed) = &resumed {
            for part in &resumed.parts {
                consumer.parts.push(CompletedPart {
                    part_number: part.part_number,
                    etag: part.etag.clone(),
                });
                match part.hash_crc64.as_deref().and_then(|c| c.parse::<u64>().ok()) {
                    Some(crc) => consumer.crc.combine(crc, part.size),
                    None => consumer.crc_known = false,
                }
            }
            consumer.progress.resume(resumed.bytes());
        }

        let worker = UploadWorker {
            client: self.client.clone(),
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            upload_id: upload_id.clone(),
            file,
        };
        run_parts(&worker, parts, parallel, &errors, &mut consumer).await;

        let keep_parts = options.leave_parts_on_error || checkpoint.is_some();
        if let Some(err) = errors.take_first() {
            if !keep_parts {
                self.abort(request, &upload_id).await;
            }
            return Err((err, Some(upload_id)));
        }

        consumer.parts.sort_by_key(|p| p.part_number);
        let output = match self
            .client
            .complete_multipart_upload(CompleteMultipartUploadRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                upload_id: upload_id.clone(),
                parts: consumer.parts,
            })
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if !keep_parts {
                    self.abort(request, &upload_id).await;
                }
                return Err((err, Some(upload_id)));
            }
        };

        if options.enable_crc && consumer.crc_known {
            verify_crc(consumer.crc.value(), output.hash_crc64.as_deref())
                .map_err(|e| (e, Some(upload_id.clone())))?;
        }
        if let Some(cp) = &checkpoint {
            cp.remove().await;
        }

        info!(
            "Completed upload session {} for oss://{}/{}",
            upload_id, request.bucket, request.key
        );
        Ok(TransferResult::from_output(output, Some(upload_id)))
    }

    async fn abort(&self, request: &UploadRequest, upload_id: &str) {
        warn!("Aborting upload session {} for oss://{}/{}", upload_id, request.bucket, request.key);
        if let Err(e) = self
            .client
            .abort_multipart_upload(AbortMultipartUploadRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                upload_id: upload_id.to_string(),
            })
            .await
        {
            warn!("Failed to abort upload session {}: {}", upload_id, e);
        }
    }
}

/// State for a seekable file source
struct FileState {
    path: PathBuf,
    size: u64,
    errors: Arc<ErrorAggregate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_chunk_stops_at_size() {
        let data = vec![7u8; 100];
        let mut reader = &data[..];
        let first = read_chunk(&mut reader, 60).await.unwrap();
        let second = read_chunk(&mut reader, 60).await.unwrap();
        let third = read_chunk(&mut reader, 60).await.unwrap();
        assert_eq!((first.len(), second.len(), third.len()), (60, 40, 0));
    }

    #[tokio::test]
    async fn test_reader_parts_sequence() {
        let data: Vec<u8> = (0..25u8).collect();
        let state = ReaderState {
            reader: Box::new(std::io::Cursor::new(data[10..].to_vec())),
            first: Some(data[..10].to_vec()),
            next_number: 1,
            offset: 0,
            done: false,
            errors: Arc::new(ErrorAggregate::default()),
        };
        let parts: Vec<Part> = reader_parts(state, 10)
            .map(|p| p.unwrap())
            .collect()
            .await;
        let layout: Vec<(u32, u64, u64)> = parts.iter().map(|p| (p.number, p.offset, p.size)).collect();
        assert_eq!(layout, vec![(1, 0, 10), (2, 10, 10), (3, 20, 5)]);
        assert_eq!(parts[2].body.as_deref(), Some(&data[20..]));
    }

    #[test]
    fn test_resumed_parts() {
        let resumed = ResumedParts {
            parts: vec![
                UploadedPart {
                    part_number: 1,
                    etag: "a".to_string(),
                    size: 10,
                    hash_crc64: None,
                },
                UploadedPart {
                    part_number: 2,
                    etag: "b".to_string(),
                    size: 10,
                    hash_crc64: None,
                },
            ],
        };
        assert_eq!(resumed.next_number(), 3);
        assert_eq!(resumed.bytes(), 20);
    }

    fn listed(sizes: &[(u32, u64)]) -> ResumedParts {
        ResumedParts {
            parts: sizes
                .iter()
                .map(|&(part_number, size)| UploadedPart {
                    part_number,
                    etag: format!("e{}", part_number),
                    size,
                    hash_crc64: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_resumable_session_layouts() {
        assert!(listed(&[]).fits(10, 35));
        assert!(listed(&[(1, 10), (2, 10)]).fits(10, 35));
        // everything uploaded, short tail included
        assert!(listed(&[(1, 10), (2, 10), (3, 10), (4, 5)]).fits(10, 35));
        // gap in numbering
        assert!(!listed(&[(1, 10), (3, 10)]).fits(10, 35));
        // short part that does not end the file
        assert!(!listed(&[(1, 10), (2, 4)]).fits(10, 35));
        assert!(!listed(&[(1, 4), (2, 10)]).fits(10, 35));
    }

    #[test]
    fn test_oversized_last_part_rejects_session() {
        // total is aligned and within the file, but the last part is too big
        assert!(!listed(&[(1, 10), (2, 20)]).fits(10, 35));
        assert!(!listed(&[(1, 10), (2, 25)]).fits(10, 35));
        assert!(!listed(&[(1, 35)]).fits(10, 35));
    }
}
