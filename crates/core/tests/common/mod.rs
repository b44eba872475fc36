//! In-memory object store for driving transfers without a network

#![allow(dead_code)]

use async_trait::async_trait;
use ossxfer_core::crc64;
use ossxfer_core::ops::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CopyObjectRequest,
    GetObjectOutput, GetObjectRequest, GetObjectTaggingRequest, HeadObjectRequest,
    InitiateMultipartUploadRequest, ListPartsOutput, ListPartsRequest, ObjectClient, ObjectMeta,
    ObjectWriteOutput, PutObjectRequest, ResponseMeta, UploadPartCopyOutput,
    UploadPartCopyRequest, UploadPartOutput, UploadPartRequest, UploadedPart,
};
use ossxfer_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub tagging: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub tagging: Option<String>,
    pub parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// Object store double
///
/// Records every call, reports CRC-64 headers like the real service, and
/// can fail or delay chosen parts.
#[derive(Default)]
pub struct MockStore {
    pub objects: Mutex<HashMap<(String, String), StoredObject>>,
    pub sessions: Mutex<HashMap<String, Session>>,
    pub calls: Mutex<Vec<String>>,
    /// Part numbers whose upload or part-copy fails
    pub fail_parts: Mutex<HashSet<u32>>,
    /// Range starts whose ranged get fails
    pub fail_get_offsets: Mutex<HashSet<u64>>,
    /// How long a ranged get starting at an offset takes
    pub get_delays: Mutex<HashMap<u64, Duration>>,
    /// Directory whose `.dcp` offsets are sampled on every ranged get
    pub watch_dir: Mutex<Option<PathBuf>>,
    pub seen_offsets: Mutex<Vec<u64>>,
    pub part_delays: Mutex<HashMap<u32, Duration>>,
    /// How long a single copy call takes
    pub copy_delay: Mutex<Option<Duration>>,
    /// Report no checksum headers
    pub hide_crc: Mutex<bool>,
    /// Report this checksum for every written object instead of the real one
    pub wrong_crc: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    next_upload: AtomicU32,
}

/// Counts an `upload_part` call as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{:016X}\"", crc64::checksum(data))
}

fn not_found(operation: &str) -> Error {
    Error::Service {
        operation: operation.to_string(),
        status_code: 404,
        code: "NoSuchKey".to_string(),
        message: "The specified key does not exist.".to_string(),
        request_id: "mock".to_string(),
    }
}

fn no_upload(operation: &str) -> Error {
    Error::Service {
        operation: operation.to_string(),
        status_code: 404,
        code: "NoSuchUpload".to_string(),
        message: "The specified upload does not exist.".to_string(),
        request_id: "mock".to_string(),
    }
}

/// Parses `bytes=a-b`
fn parse_range(range: &str) -> (usize, usize) {
    let bounds = range.trim_start_matches("bytes=");
    let (a, b) = bounds.split_once('-').expect("range");
    (a.parse().expect("start"), b.parse::<usize>().expect("end") + 1)
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>) {
        let etag = etag_of(&data);
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag,
                ..Default::default()
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn fail_part(&self, number: u32) {
        self.fail_parts.lock().unwrap().insert(number);
    }

    pub fn heal(&self) {
        self.fail_parts.lock().unwrap().clear();
        self.fail_get_offsets.lock().unwrap().clear();
    }

    pub fn delay_part(&self, number: u32, delay: Duration) {
        self.part_delays.lock().unwrap().insert(number, delay);
    }

    pub fn delay_get(&self, offset: u64, delay: Duration) {
        self.get_delays.lock().unwrap().insert(offset, delay);
    }

    /// Most `upload_part` calls ever running at once
    pub fn peak_upload_parts(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn sample_checkpoints(&self) {
        let Some(dir) = self.watch_dir.lock().unwrap().clone() else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|x| x == "dcp") {
                let offset = std::fs::read(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<serde_json::Value>(&raw).ok())
                    .and_then(|v| v["Data"]["DownloadInfo"]["Offset"].as_u64());
                if let Some(offset) = offset {
                    self.seen_offsets.lock().unwrap().push(offset);
                }
            }
        }
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    fn crc_header(&self, data: &[u8]) -> Option<String> {
        if *self.hide_crc.lock().unwrap() {
            return None;
        }
        if let Some(wrong) = self.wrong_crc.lock().unwrap().clone() {
            return Some(wrong);
        }
        Some(crc64::checksum(data).to_string())
    }

    async fn part_gate(&self, number: u32) -> Result<()> {
        let delay = self.part_delays.lock().unwrap().get(&number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_parts.lock().unwrap().contains(&number) {
            return Err(Error::Network(format!("connection reset on part {}", number)));
        }
        Ok(())
    }

    fn store(&self, bucket: &str, key: &str, object: StoredObject) -> ObjectWriteOutput {
        let output = ObjectWriteOutput {
            etag: object.etag.clone(),
            version_id: None,
            hash_crc64: self.crc_header(&object.data),
            meta: ResponseMeta::ok(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), object);
        output
    }
}

#[async_trait]
impl ObjectClient for MockStore {
    async fn head_object(&self, request: HeadObjectRequest) -> Result<ObjectMeta> {
        self.record("head_object");
        let object = self
            .object(&request.bucket, &request.key)
            .ok_or_else(|| not_found("HeadObject"))?;
        let tagging_count = object
            .tagging
            .as_deref()
            .map(|t| t.split('&').filter(|s| !s.is_empty()).count() as u32)
            .unwrap_or(0);
        Ok(ObjectMeta {
            content_length: object.data.len() as u64,
            etag: object.etag.clone(),
            last_modified: "Thu, 01 Jan 2026 00:00:00 GMT".to_string(),
            version_id: None,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            server_side_encryption: None,
            tagging_count,
            hash_crc64: self.crc_header(&object.data),
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput> {
        self.record("get_object");
        let object = self
            .object(&request.bucket, &request.key)
            .ok_or_else(|| not_found("GetObject"))?;
        if let Some(etag) = &request.if_match {
            if etag != &object.etag {
                return Err(Error::Service {
                    operation: "GetObject".to_string(),
                    status_code: 412,
                    code: "PreconditionFailed".to_string(),
                    message: "etag changed".to_string(),
                    request_id: "mock".to_string(),
                });
            }
        }
        let body = match &request.range {
            Some(range) => {
                let (start, end) = parse_range(range);
                self.sample_checkpoints();
                let delay = self.get_delays.lock().unwrap().get(&(start as u64)).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_get_offsets.lock().unwrap().contains(&(start as u64)) {
                    return Err(Error::Network(format!("connection reset at {}", start)));
                }
                object.data[start..end.min(object.data.len())].to_vec()
            }
            None => object.data.clone(),
        };
        Ok(GetObjectOutput {
            body,
            etag: object.etag.clone(),
            hash_crc64: self.crc_header(&object.data),
        })
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<ObjectWriteOutput> {
        self.record("put_object");
        let etag = etag_of(&request.body);
        Ok(self.store(
            &request.bucket,
            &request.key,
            StoredObject {
                data: request.body,
                etag,
                content_type: request.content_type,
                metadata: request.metadata,
                tagging: request.tagging,
            },
        ))
    }

    async fn initiate_multipart_upload(&self, request: InitiateMultipartUploadRequest) -> Result<String> {
        self.record("initiate_multipart_upload");
        let id = format!("upload-{:04}", self.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
        self.sessions.lock().unwrap().insert(
            id.clone(),
            Session {
                bucket: request.bucket,
                key: request.key,
                content_type: request.content_type,
                metadata: request.metadata,
                tagging: request.tagging,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput> {
        self.record("upload_part");
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.part_gate(request.part_number).await?;
        let etag = etag_of(&request.body);
        let hash_crc64 = self.crc_header(&request.body);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&request.upload_id)
            .ok_or_else(|| no_upload("UploadPart"))?;
        session
            .parts
            .insert(request.part_number, (etag.clone(), request.body));
        Ok(UploadPartOutput { etag, hash_crc64 })
    }

    async fn upload_part_copy(&self, request: UploadPartCopyRequest) -> Result<UploadPartCopyOutput> {
        self.record("upload_part_copy");
        self.part_gate(request.part_number).await?;
        let source = self
            .object(&request.source_bucket, &request.source_key)
            .ok_or_else(|| not_found("UploadPartCopy"))?;
        let (start, end) = parse_range(&request.source_range);
        let data = source.data[start..end].to_vec();
        let etag = etag_of(&data);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&request.upload_id)
            .ok_or_else(|| no_upload("UploadPartCopy"))?;
        session.parts.insert(request.part_number, (etag.clone(), data));
        Ok(UploadPartCopyOutput { etag })
    }

    async fn list_parts(&self, request: ListPartsRequest) -> Result<ListPartsOutput> {
        self.record("list_parts");
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(&request.upload_id)
            .ok_or_else(|| no_upload("ListParts"))?;
        // two parts per page to exercise pagination
        let marker = request.part_number_marker.unwrap_or(0);
        let remaining: Vec<_> = session.parts.range(marker + 1..).collect();
        let page: Vec<UploadedPart> = remaining
            .iter()
            .take(2)
            .map(|(number, (etag, data))| UploadedPart {
                part_number: **number,
                etag: etag.clone(),
                size: data.len() as u64,
                hash_crc64: Some(crc64::checksum(data).to_string()),
            })
            .collect();
        let is_truncated = remaining.len() > page.len();
        Ok(ListPartsOutput {
            next_part_number_marker: page.last().map(|p| p.part_number),
            parts: page,
            is_truncated,
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<ObjectWriteOutput> {
        self.record("complete_multipart_upload");
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(&request.upload_id)
            .ok_or_else(|| no_upload("CompleteMultipartUpload"))?;

        let mut data = Vec::new();
        for (i, part) in request.parts.iter().enumerate() {
            assert_eq!(part.part_number as usize, i + 1, "parts must be sorted and contiguous");
            let (etag, body) = session.parts.get(&part.part_number).ok_or_else(|| Error::Service {
                operation: "CompleteMultipartUpload".to_string(),
                status_code: 400,
                code: "InvalidPart".to_string(),
                message: format!("part {} missing", part.part_number),
                request_id: "mock".to_string(),
            })?;
            assert_eq!(etag, &part.etag);
            data.extend_from_slice(body);
        }
        let etag = format!("\"{}-{}\"", etag_of(&data).trim_matches('"'), request.parts.len());
        Ok(self.store(
            &session.bucket,
            &session.key,
            StoredObject {
                data,
                etag,
                content_type: session.content_type,
                metadata: session.metadata,
                tagging: session.tagging,
            },
        ))
    }

    async fn abort_multipart_upload(&self, request: AbortMultipartUploadRequest) -> Result<()> {
        self.record("abort_multipart_upload");
        self.sessions
            .lock()
            .unwrap()
            .remove(&request.upload_id)
            .map(|_| ())
            .ok_or_else(|| no_upload("AbortMultipartUpload"))
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<ObjectWriteOutput> {
        self.record("copy_object");
        let delay = *self.copy_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let source = self
            .object(&request.source_bucket, &request.source_key)
            .ok_or_else(|| not_found("CopyObject"))?;
        let mut object = source.clone();
        if request.replace_metadata {
            object.content_type = request.content_type;
            object.metadata = request.metadata;
        }
        if request.replace_tagging {
            object.tagging = request.tagging;
        }
        Ok(self.store(&request.bucket, &request.key, object))
    }

    async fn get_object_tagging(&self, request: GetObjectTaggingRequest) -> Result<String> {
        self.record("get_object_tagging");
        let object = self
            .object(&request.bucket, &request.key)
            .ok_or_else(|| not_found("GetObjectTagging"))?;
        Ok(object.tagging.unwrap_or_default())
    }
}

/// Deterministic, non-repeating payload
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
