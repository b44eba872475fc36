//! Remote operations the transfer engine drives
//!
//! Signing, retries and transport live behind [`ObjectClient`]; the engine
//! only sees typed requests and typed results or errors.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Response header carrying the service-side CRC-64 of an object.
pub const HEADER_HASH_CRC64: &str = "x-oss-hash-crc64ecma";

/// Status, code and headers of a finished request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl ResponseMeta {
    pub fn ok() -> Self {
        Self {
            status: "200 OK".to_string(),
            status_code: 200,
            headers: HashMap::new(),
        }
    }
}

/// Object metadata returned by a head call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_length: u64,
    pub etag: String,
    pub last_modified: String,
    pub version_id: Option<String>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub server_side_encryption: Option<String>,
    pub tagging_count: u32,
    /// Base-10 CRC-64 of the whole object, as the service reports it
    pub hash_crc64: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HeadObjectRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    /// `bytes=a-b`
    pub range: Option<String>,
    pub if_match: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectOutput {
    pub body: Vec<u8>,
    pub etag: String,
    pub hash_crc64: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    pub tagging: Option<String>,
}

/// Result of put, copy and complete-multipart calls
#[derive(Debug, Clone, Default)]
pub struct ObjectWriteOutput {
    pub etag: String,
    pub version_id: Option<String>,
    pub hash_crc64: Option<String>,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Default)]
pub struct InitiateMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    pub tagging: Option<String>,
    pub server_side_encryption: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartOutput {
    pub etag: String,
    pub hash_crc64: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartCopyRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: Option<String>,
    /// `bytes=a-b`
    pub source_range: String,
    pub source_if_match: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartCopyOutput {
    pub etag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListPartsRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number_marker: Option<u32>,
}

/// A part already stored in a multipart session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub hash_crc64: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPartsOutput {
    pub parts: Vec<UploadedPart>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Sorted by part number
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, Default)]
pub struct AbortMultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct CopyObjectRequest {
    pub bucket: String,
    pub key: String,
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: Option<String>,
    pub source_if_match: Option<String>,
    pub storage_class: Option<String>,
    /// Replace the metadata with `metadata`/`content_type` instead of copying it
    pub replace_metadata: bool,
    pub metadata: HashMap<String, String>,
    pub content_type: Option<String>,
    /// Replace the tags with `tagging` instead of copying them
    pub replace_tagging: bool,
    pub tagging: Option<String>,
    pub server_side_encryption: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectTaggingRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

/// The signed, retried remote operations a transfer needs
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_object(&self, request: HeadObjectRequest) -> Result<ObjectMeta>;

    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput>;

    async fn put_object(&self, request: PutObjectRequest) -> Result<ObjectWriteOutput>;

    async fn initiate_multipart_upload(&self, request: InitiateMultipartUploadRequest) -> Result<String>;

    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput>;

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> Result<UploadPartCopyOutput>;

    async fn list_parts(&self, request: ListPartsRequest) -> Result<ListPartsOutput>;

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<ObjectWriteOutput>;

    async fn abort_multipart_upload(&self, request: AbortMultipartUploadRequest) -> Result<()>;

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<ObjectWriteOutput>;

    /// Tags as a url-encoded `k=v&k2=v2` string
    async fn get_object_tagging(&self, request: GetObjectTaggingRequest) -> Result<String>;
}
