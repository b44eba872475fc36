//! `ObjectClient` backed by the AWS S3 SDK, for S3-compatible endpoints

use crate::config::{AdvancedConfig, ConfigFile, EndpointConfig};
use crate::error::{Error, Result};
use crate::ops::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CopyObjectRequest,
    GetObjectOutput, GetObjectRequest, GetObjectTaggingRequest, HeadObjectRequest,
    InitiateMultipartUploadRequest, ListPartsOutput, ListPartsRequest, ObjectClient, ObjectMeta,
    ObjectWriteOutput, PutObjectRequest, ResponseMeta, UploadPartCopyOutput,
    UploadPartCopyRequest, UploadPartOutput, UploadPartRequest, UploadedPart,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{
        retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion, Credentials, Region,
    },
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, MetadataDirective, ServerSideEncryption,
        StorageClass, TaggingDirective,
    },
    Client,
};
use aws_smithy_types::date_time::Format;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Characters left as-is in an encoded object key; `/` separates segments
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Characters left as-is in a tag key or value
const TAG_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// S3-compatible client
///
/// The SDK signs every request, retries with backoff and replays bodies;
/// this type only maps between the engine's models and the SDK's.
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
}

impl S3Client {
    /// Create a client for an endpoint
    pub fn new(endpoint: &EndpointConfig, advanced: &AdvancedConfig) -> Result<Self> {
        let access_key_id = endpoint.access_key_id.as_deref().ok_or_else(|| {
            Error::Config("access_key_id is not configured".to_string())
        })?;
        let secret_access_key = endpoint.secret_access_key.as_deref().ok_or_else(|| {
            Error::Config("secret_access_key is not configured".to_string())
        })?;
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "ossxfer");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&endpoint.url)
            .region(Region::new(endpoint.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(endpoint.force_path_style)
            .retry_config(RetryConfig::standard().with_max_attempts(advanced.max_retries.max(1)))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(Duration::from_secs(advanced.timeout))
                    .build(),
            )
            .build();

        Ok(Self {
            client: Client::from_conf(config),
        })
    }

    /// Create a client from a loaded configuration file
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        let advanced = config.advanced.clone().unwrap_or_default();
        Self::new(&config.endpoint, &advanced)
    }
}

/// `bucket/key[?versionId=v]`, the copy-source header value
fn copy_source(bucket: &str, key: &str, version_id: Option<&str>) -> String {
    let mut source = format!("{}/{}", bucket, utf8_percent_encode(key, KEY_ENCODE_SET));
    if let Some(version_id) = version_id {
        source.push_str("?versionId=");
        source.push_str(&utf8_percent_encode(version_id, TAG_ENCODE_SET).to_string());
    }
    source
}

fn encode_tags<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    tags.map(|(k, v)| {
        format!(
            "{}={}",
            utf8_percent_encode(k, TAG_ENCODE_SET),
            utf8_percent_encode(v, TAG_ENCODE_SET)
        )
    })
    .collect::<Vec<_>>()
    .join("&")
}

fn http_date(value: Option<&aws_smithy_types::DateTime>) -> String {
    value
        .and_then(|dt| dt.fmt(Format::HttpDate).ok())
        .unwrap_or_default()
}

fn non_empty(metadata: HashMap<String, String>) -> Option<HashMap<String, String>> {
    if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    }
}

fn write_output(etag: Option<&str>, version_id: Option<&str>) -> ObjectWriteOutput {
    ObjectWriteOutput {
        etag: etag.unwrap_or_default().to_string(),
        version_id: version_id.map(str::to_string),
        hash_crc64: None,
        meta: ResponseMeta::ok(),
    }
}

fn part_number(number: u32) -> Result<i32> {
    i32::try_from(number)
        .map_err(|_| Error::InvalidInput(format!("part number {} out of range", number)))
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn head_object(&self, request: HeadObjectRequest) -> Result<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .set_version_id(request.version_id)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("HeadObject"))?;

        Ok(ObjectMeta {
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().unwrap_or_default().to_string(),
            last_modified: http_date(output.last_modified()),
            version_id: output.version_id().map(str::to_string),
            content_type: output.content_type().map(str::to_string),
            metadata: output.metadata().cloned().unwrap_or_default(),
            server_side_encryption: output
                .server_side_encryption()
                .map(|sse| sse.as_str().to_string()),
            // the SDK does not model x-amz-tagging-count on head
            tagging_count: 0,
            hash_crc64: None,
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput> {
        let output = self
            .client
            .get_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .set_version_id(request.version_id)
            .set_range(request.range)
            .set_if_match(request.if_match)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("GetObject"))?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        let body = output.body.collect().await?.into_bytes().to_vec();
        Ok(GetObjectOutput {
            body,
            etag,
            hash_crc64: None,
        })
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<ObjectWriteOutput> {
        let output = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .body(ByteStream::from(request.body))
            .set_content_type(request.content_type)
            .set_metadata(non_empty(request.metadata))
            .set_storage_class(request.storage_class.as_deref().map(StorageClass::from))
            .set_tagging(request.tagging)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("PutObject"))?;

        Ok(write_output(output.e_tag(), output.version_id()))
    }

    async fn initiate_multipart_upload(
        &self,
        request: InitiateMultipartUploadRequest,
    ) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .set_content_type(request.content_type)
            .set_metadata(non_empty(request.metadata))
            .set_storage_class(request.storage_class.as_deref().map(StorageClass::from))
            .set_tagging(request.tagging)
            .set_server_side_encryption(
                request
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            )
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("InitiateMultipartUpload"))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Network("InitiateMultipartUpload returned no upload id".to_string()))
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput> {
        let output = self
            .client
            .upload_part()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(part_number(request.part_number)?)
            .body(ByteStream::from(request.body))
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("UploadPart"))?;

        Ok(UploadPartOutput {
            etag: output.e_tag().unwrap_or_default().to_string(),
            hash_crc64: None,
        })
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> Result<UploadPartCopyOutput> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(part_number(request.part_number)?)
            .copy_source(copy_source(
                &request.source_bucket,
                &request.source_key,
                request.source_version_id.as_deref(),
            ))
            .copy_source_range(&request.source_range)
            .set_copy_source_if_match(request.source_if_match)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("UploadPartCopy"))?;

        Ok(UploadPartCopyOutput {
            etag: output
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn list_parts(&self, request: ListPartsRequest) -> Result<ListPartsOutput> {
        let output = self
            .client
            .list_parts()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .set_part_number_marker(request.part_number_marker.map(|m| m.to_string()))
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("ListParts"))?;

        let parts = output
            .parts()
            .iter()
            .map(|part| UploadedPart {
                part_number: part.part_number().unwrap_or(0).max(0) as u32,
                etag: part.e_tag().unwrap_or_default().to_string(),
                size: part.size().unwrap_or(0).max(0) as u64,
                hash_crc64: None,
            })
            .collect();

        Ok(ListPartsOutput {
            parts,
            is_truncated: output.is_truncated().unwrap_or(false),
            next_part_number_marker: output
                .next_part_number_marker()
                .and_then(|m| m.parse().ok()),
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<ObjectWriteOutput> {
        let mut parts = Vec::with_capacity(request.parts.len());
        for part in &request.parts {
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number(part.part_number)?)
                    .e_tag(&part.etag)
                    .build(),
            );
        }
        debug!("Completing {} with {} parts", request.upload_id, parts.len());

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("CompleteMultipartUpload"))?;

        Ok(write_output(output.e_tag(), output.version_id()))
    }

    async fn abort_multipart_upload(&self, request: AbortMultipartUploadRequest) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("AbortMultipartUpload"))?;
        Ok(())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<ObjectWriteOutput> {
        let mut builder = self
            .client
            .copy_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .copy_source(copy_source(
                &request.source_bucket,
                &request.source_key,
                request.source_version_id.as_deref(),
            ))
            .set_copy_source_if_match(request.source_if_match)
            .set_storage_class(request.storage_class.as_deref().map(StorageClass::from))
            .set_server_side_encryption(
                request
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            );
        if request.replace_metadata {
            builder = builder
                .metadata_directive(MetadataDirective::Replace)
                .set_content_type(request.content_type)
                .set_metadata(non_empty(request.metadata));
        }
        if request.replace_tagging {
            builder = builder
                .tagging_directive(TaggingDirective::Replace)
                .set_tagging(request.tagging);
        }

        let output = builder
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("CopyObject"))?;

        Ok(write_output(
            output.copy_object_result().and_then(|r| r.e_tag()),
            output.version_id(),
        ))
    }

    async fn get_object_tagging(&self, request: GetObjectTaggingRequest) -> Result<String> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(&request.bucket)
            .key(&request.key)
            .set_version_id(request.version_id)
            .send()
            .await
            .map_err(|e| Error::from(e).with_operation("GetObjectTagging"))?;

        Ok(encode_tags(
            output.tag_set().iter().map(|tag| (tag.key(), tag.value())),
        ))
    }
}
