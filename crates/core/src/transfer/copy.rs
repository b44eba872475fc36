//! Server-side copy: shallow copy when possible, multipart part-copy otherwise

use super::{
    adjust_part_size, oss_path, range_header, run_parts, validate_bucket_name, validate_object_key,
    verify_crc, ErrorAggregate, Part, PartConsumer, PartIter, PartResult, PartWorker, Progress,
    ProgressCallback, TransferOptions, TransferResult, DEFAULT_COPY_PART_SIZE,
};
use crate::error::{Error, Result};
use crate::ops::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedPart, CopyObjectRequest,
    GetObjectTaggingRequest, HeadObjectRequest, InitiateMultipartUploadRequest, ObjectClient,
    ObjectMeta, UploadPartCopyRequest,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the destination's metadata comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetadataDirective {
    /// Source object's content type and user metadata
    #[default]
    Copy,
    /// The request's `content_type` and `metadata`
    Replace,
}

/// Where the destination's tags come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaggingDirective {
    #[default]
    Copy,
    Replace,
}

#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub bucket: String,
    pub key: String,
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: Option<String>,
    pub storage_class: Option<String>,
    pub metadata_directive: MetadataDirective,
    pub metadata: HashMap<String, String>,
    pub content_type: Option<String>,
    pub tagging_directive: TaggingDirective,
    pub tagging: Option<String>,
    pub server_side_encryption: Option<String>,
    pub progress: Option<ProgressCallback>,
}

impl CopyRequest {
    pub fn new(
        source_bucket: impl Into<String>,
        source_key: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            ..Default::default()
        }
    }

    pub fn with_source_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.source_version_id = Some(version_id.into());
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    /// Replaces the source metadata with the given content type and entries.
    pub fn with_metadata(
        mut self,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        self.metadata_directive = MetadataDirective::Replace;
        self.content_type = content_type;
        self.metadata = metadata;
        self
    }

    /// Replaces the source tags with a url-encoded `k=v&k2=v2` string.
    pub fn with_tagging(mut self, tagging: impl Into<String>) -> Self {
        self.tagging_directive = TaggingDirective::Replace;
        self.tagging = Some(tagging.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// A shallow copy needs the service to duplicate the object in place: same
/// bucket, same storage class and the same encryption as the source.
fn shallow_copy_eligible(request: &CopyRequest, source: &ObjectMeta, options: &TransferOptions) -> bool {
    !options.disable_shallow_copy
        && request.storage_class.is_none()
        && request.source_bucket == request.bucket
        && (request.server_side_encryption.is_none()
            || request.server_side_encryption == source.server_side_encryption)
}

struct CopyWorker {
    client: Arc<dyn ObjectClient>,
    request: CopyRequest,
    upload_id: String,
    source_etag: String,
}

#[async_trait]
impl PartWorker for CopyWorker {
    async fn transfer_part(&self, part: Part) -> Result<PartResult> {
        debug!("Copying part {} ({} bytes at {})", part.number, part.size, part.offset);
        let output = self
            .client
            .upload_part_copy(UploadPartCopyRequest {
                bucket: self.request.bucket.clone(),
                key: self.request.key.clone(),
                upload_id: self.upload_id.clone(),
                part_number: part.number,
                source_bucket: self.request.source_bucket.clone(),
                source_key: self.request.source_key.clone(),
                source_version_id: self.request.source_version_id.clone(),
                source_range: range_header(part.offset, part.size),
                source_if_match: Some(self.source_etag.clone()),
            })
            .await?;

        Ok(PartResult {
            number: part.number,
            offset: part.offset,
            size: part.size,
            etag: output.etag,
            crc64: None,
        })
    }
}

struct CopyConsumer {
    parts: Vec<CompletedPart>,
    progress: Progress,
}

#[async_trait]
impl PartConsumer for CopyConsumer {
    async fn consume(&mut self, done: PartResult) -> Result<()> {
        self.parts.push(CompletedPart {
            part_number: done.number,
            etag: done.etag,
        });
        self.progress.advance(done.size);
        Ok(())
    }
}

/// Copies objects between keys and buckets without moving data through the client
pub struct Copier {
    client: Arc<dyn ObjectClient>,
    options: TransferOptions,
}

impl Copier {
    pub fn new(client: Arc<dyn ObjectClient>, options: TransferOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub async fn copy(&self, request: CopyRequest) -> Result<TransferResult> {
        self.copy_with_options(request, &self.options).await
    }

    /// Copies with per-call options replacing the copier's.
    pub async fn copy_with_options(
        &self,
        request: CopyRequest,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        validate_bucket_name(&request.bucket)?;
        validate_object_key(&request.key)?;
        validate_bucket_name(&request.source_bucket)?;
        validate_object_key(&request.source_key)?;
        let options = options.resolved(DEFAULT_COPY_PART_SIZE);
        let path = oss_path(&request.bucket, &request.key);

        let source = self
            .client
            .head_object(HeadObjectRequest {
                bucket: request.source_bucket.clone(),
                key: request.source_key.clone(),
                version_id: request.source_version_id.clone(),
            })
            .await
            .map_err(|e| e.wrap("copy", path.clone(), None))?;

        let part_size = adjust_part_size(source.content_length, options.part_size);

        if shallow_copy_eligible(&request, &source, &options) {
            debug!(
                "Shallow copy {} -> {}",
                oss_path(&request.source_bucket, &request.source_key),
                path
            );
            let attempt = tokio::time::timeout(
                options.shallow_copy_timeout,
                self.copy_single(&request, &source, &options),
            )
            .await;
            match attempt {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(err)) if !err.is_timeout() => return Err(err.wrap("copy", path, None)),
                Ok(Err(err)) => {
                    warn!("Shallow copy to {} timed out ({}), switching to multipart", path, err);
                }
                Err(_) => {
                    warn!(
                        "Shallow copy to {} did not finish within {:?}, switching to multipart",
                        path, options.shallow_copy_timeout
                    );
                }
            }
        } else if source.content_length <= part_size {
            return self
                .copy_single(&request, &source, &options)
                .await
                .map_err(|e| e.wrap("copy", path, None));
        }

        self.copy_multipart(&request, &source, &options, part_size)
            .await
            .map_err(|(e, upload_id)| e.wrap("copy", path, upload_id))
    }

    async fn copy_single(
        &self,
        request: &CopyRequest,
        source: &ObjectMeta,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        let replace_metadata = request.metadata_directive == MetadataDirective::Replace;
        let replace_tagging = request.tagging_directive == TaggingDirective::Replace;
        let output = self
            .client
            .copy_object(CopyObjectRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                source_bucket: request.source_bucket.clone(),
                source_key: request.source_key.clone(),
                source_version_id: request.source_version_id.clone(),
                source_if_match: Some(source.etag.clone()),
                storage_class: request.storage_class.clone(),
                replace_metadata,
                metadata: request.metadata.clone(),
                content_type: request.content_type.clone(),
                replace_tagging,
                tagging: request.tagging.clone(),
                server_side_encryption: request.server_side_encryption.clone(),
            })
            .await?;

        let mut progress = Progress::new(request.progress.clone(), source.content_length);
        progress.advance(source.content_length);

        if options.enable_crc {
            if let Some(source_crc) = source.hash_crc64.as_deref() {
                check_same_crc(source_crc, output.hash_crc64.as_deref())?;
            }
        }
        Ok(TransferResult::from_output(output, None))
    }

    /// Content type, metadata and tags the multipart session starts with.
    async fn session_attributes(
        &self,
        request: &CopyRequest,
        source: &ObjectMeta,
    ) -> Result<(Option<String>, HashMap<String, String>, Option<String>)> {
        let (content_type, metadata) = match request.metadata_directive {
            MetadataDirective::Copy => (source.content_type.clone(), source.metadata.clone()),
            MetadataDirective::Replace => (request.content_type.clone(), request.metadata.clone()),
        };
        let tagging = match request.tagging_directive {
            TaggingDirective::Replace => request.tagging.clone(),
            TaggingDirective::Copy if source.tagging_count > 0 => {
                let tags = self
                    .client
                    .get_object_tagging(GetObjectTaggingRequest {
                        bucket: request.source_bucket.clone(),
                        key: request.source_key.clone(),
                        version_id: request.source_version_id.clone(),
                    })
                    .await?;
                Some(tags).filter(|t| !t.is_empty())
            }
            TaggingDirective::Copy => None,
        };
        Ok((content_type, metadata, tagging))
    }

    async fn copy_multipart(
        &self,
        request: &CopyRequest,
        source: &ObjectMeta,
        options: &TransferOptions,
        part_size: u64,
    ) -> std::result::Result<TransferResult, (Error, Option<String>)> {
        let (content_type, metadata, tagging) = self
            .session_attributes(request, source)
            .await
            .map_err(|e| (e, None))?;

        let upload_id = self
            .client
            .initiate_multipart_upload(InitiateMultipartUploadRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                content_type,
                metadata,
                storage_class: request.storage_class.clone(),
                tagging,
                server_side_encryption: request.server_side_encryption.clone(),
            })
            .await
            .map_err(|e| (e, None))?;
        info!(
            "Opened copy session {} for {} ({} bytes, part size {})",
            upload_id,
            oss_path(&request.bucket, &request.key),
            source.content_length,
            part_size
        );

        let errors = Arc::new(ErrorAggregate::default());
        let worker = CopyWorker {
            client: self.client.clone(),
            request: request.clone(),
            upload_id: upload_id.clone(),
            source_etag: source.etag.clone(),
        };
        let mut consumer = CopyConsumer {
            parts: Vec::new(),
            progress: Progress::new(request.progress.clone(), source.content_length),
        };
        let parts = PartIter::new(1, 0, source.content_length, part_size, errors.clone());
        run_parts(
            &worker,
            futures::stream::iter(parts.map(Ok)),
            options.parallel_num,
            &errors,
            &mut consumer,
        )
        .await;

        if let Some(err) = errors.take_first() {
            if !options.leave_parts_on_error {
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
                if !options.leave_parts_on_error {
                    self.abort(request, &upload_id).await;
                }
                return Err((err, Some(upload_id)));
            }
        };

        if options.enable_crc {
            if let Some(source_crc) = source.hash_crc64.as_deref() {
                check_same_crc(source_crc, output.hash_crc64.as_deref())
                    .map_err(|e| (e, Some(upload_id.clone())))?;
            }
        }

        info!(
            "Completed copy session {} for {}",
            upload_id,
            oss_path(&request.bucket, &request.key)
        );
        Ok(TransferResult::from_output(output, Some(upload_id)))
    }

    async fn abort(&self, request: &CopyRequest, upload_id: &str) {
        warn!(
            "Aborting copy session {} for {}",
            upload_id,
            oss_path(&request.bucket, &request.key)
        );
        if let Err(e) = self
            .client
            .abort_multipart_upload(AbortMultipartUploadRequest {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                upload_id: upload_id.to_string(),
            })
            .await
        {
            warn!("Failed to abort copy session {}: {}", upload_id, e);
        }
    }
}

/// Compares the source checksum with the destination's, both as reported.
fn check_same_crc(source_crc: &str, dest_crc: Option<&str>) -> Result<()> {
    match source_crc.parse::<u64>() {
        Ok(source) => verify_crc(source, dest_crc),
        Err(_) => Err(Error::Inconsistent {
            client_crc: source_crc.to_string(),
            server_crc: dest_crc.unwrap_or_default().to_string(),
        }),
    }
}
