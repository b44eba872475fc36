//! Resumable multipart transfers
//!
//! The three directions share one shape: inspect the remote side, pick a
//! single-shot or multipart strategy, push lazily generated parts through a
//! bounded worker pool, fold the results back in submission order, then
//! finalize or abort the session.

pub mod copy;
pub mod download;
pub mod upload;

use crate::error::{Error, Result};
use crate::ops::ObjectWriteOutput;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default part size for upload and download: 6 MiB
pub const DEFAULT_PART_SIZE: u64 = 6 * 1024 * 1024;

/// Default part size for multipart copy: 64 MiB
pub const DEFAULT_COPY_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of parts in flight
pub const DEFAULT_PARALLEL_NUM: usize = 3;

/// Hard cap on parts per multipart session
pub const MAX_PARTS: u64 = 10_000;

/// How long a shallow copy may take before falling back to multipart copy
pub const DEFAULT_SHALLOW_COPY_TIMEOUT: Duration = Duration::from_secs(30);

/// Suffix of the file a download writes into before the final rename
pub const TEMP_FILE_SUFFIX: &str = ".temp";

/// Per-call transfer options
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Bytes per part
    pub part_size: u64,
    /// Parts in flight at once
    pub parallel_num: usize,
    /// Keep uploaded parts instead of aborting the session on failure
    pub leave_parts_on_error: bool,
    pub enable_checkpoint: bool,
    /// Where checkpoint files live; the system temp directory when unset
    pub checkpoint_dir: Option<PathBuf>,
    /// Re-read already downloaded bytes when resuming a download
    pub verify_data: bool,
    /// Compare the combined CRC-64 with the one the service reports
    pub enable_crc: bool,
    /// Download into `<path>.temp` and rename when done
    pub use_temp_file: bool,
    pub disable_shallow_copy: bool,
    pub shallow_copy_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            parallel_num: DEFAULT_PARALLEL_NUM,
            leave_parts_on_error: false,
            enable_checkpoint: false,
            checkpoint_dir: None,
            verify_data: false,
            enable_crc: true,
            use_temp_file: true,
            disable_shallow_copy: false,
            shallow_copy_timeout: DEFAULT_SHALLOW_COPY_TIMEOUT,
        }
    }
}

impl TransferOptions {
    /// Defaults for server-side copy
    pub fn for_copy() -> Self {
        Self {
            part_size: DEFAULT_COPY_PART_SIZE,
            ..Self::default()
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_parallel_num(mut self, parallel_num: usize) -> Self {
        self.parallel_num = parallel_num;
        self
    }

    pub fn with_checkpoint(mut self, dir: Option<PathBuf>) -> Self {
        self.enable_checkpoint = true;
        self.checkpoint_dir = dir;
        self
    }

    pub fn with_leave_parts_on_error(mut self, leave: bool) -> Self {
        self.leave_parts_on_error = leave;
        self
    }

    pub fn with_verify_data(mut self, verify: bool) -> Self {
        self.verify_data = verify;
        self
    }

    /// Replaces zero sizes with defaults.
    pub(crate) fn resolved(&self, default_part_size: u64) -> Self {
        let mut options = self.clone();
        if options.part_size == 0 {
            options.part_size = default_part_size;
        }
        if options.parallel_num == 0 {
            options.parallel_num = DEFAULT_PARALLEL_NUM;
        }
        options
    }
}

/// Grows `part_size` by doubling until `total_size` fits in [`MAX_PARTS`] parts.
pub fn adjust_part_size(total_size: u64, part_size: u64) -> u64 {
    let mut part_size = if part_size == 0 { DEFAULT_PART_SIZE } else { part_size };
    while total_size.div_ceil(part_size) > MAX_PARTS {
        part_size = part_size.saturating_mul(2);
    }
    part_size
}

/// Progress callback: `(increment, transferred, total)`; `total` is 0 when unknown
#[derive(Clone)]
pub struct ProgressCallback(Arc<dyn Fn(u64, u64, u64) + Send + Sync>);

impl ProgressCallback {
    pub fn new(f: impl Fn(u64, u64, u64) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressCallback")
    }
}

/// Transferred-byte counter feeding the caller's callback
pub(crate) struct Progress {
    callback: Option<ProgressCallback>,
    transferred: u64,
    total: u64,
}

impl Progress {
    pub(crate) fn new(callback: Option<ProgressCallback>, total: u64) -> Self {
        Self {
            callback,
            transferred: 0,
            total,
        }
    }

    /// Counts bytes moved by an earlier run without reporting them as new.
    pub(crate) fn resume(&mut self, transferred: u64) {
        self.transferred = transferred;
    }

    pub(crate) fn advance(&mut self, increment: u64) {
        self.transferred += increment;
        if let Some(callback) = &self.callback {
            (callback.0)(increment, self.transferred, self.total);
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }
}

/// Terminal outcome of an upload or copy
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub etag: String,
    pub version_id: Option<String>,
    pub hash_crc64: Option<String>,
    pub upload_id: Option<String>,
    pub status: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}

impl TransferResult {
    pub(crate) fn from_output(output: ObjectWriteOutput, upload_id: Option<String>) -> Self {
        Self {
            etag: output.etag,
            version_id: output.version_id,
            hash_crc64: output.hash_crc64,
            upload_id,
            status: output.meta.status,
            status_code: output.meta.status_code,
            headers: output.meta.headers,
        }
    }
}

/// Errors collected from concurrent parts
///
/// Once anything is pushed no further parts are generated.
#[derive(Debug, Default)]
pub(crate) struct ErrorAggregate {
    errors: Mutex<Vec<Error>>,
}

impl ErrorAggregate {
    pub(crate) fn push(&self, err: Error) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    pub(crate) fn has_error(&self) -> bool {
        !self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Removes and returns the first error collected.
    pub(crate) fn take_first(&self) -> Option<Error> {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.is_empty() {
            None
        } else {
            let first = errors.remove(0);
            errors.clear();
            Some(first)
        }
    }
}

/// One unit of concurrent work
#[derive(Debug)]
pub(crate) struct Part {
    pub number: u32,
    /// Absolute offset in the source
    pub offset: u64,
    pub size: u64,
    /// Bytes already read, for sources that cannot be read at an offset
    pub body: Option<Vec<u8>>,
}

/// Outcome of one part
#[derive(Debug, Clone)]
pub(crate) struct PartResult {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
    pub etag: String,
    pub crc64: Option<u64>,
}

/// Lazily yields non-overlapping parts of `[offset, end)`
pub(crate) struct PartIter {
    next_number: u32,
    offset: u64,
    end: u64,
    part_size: u64,
    errors: Arc<ErrorAggregate>,
}

impl PartIter {
    pub(crate) fn new(
        first_number: u32,
        offset: u64,
        end: u64,
        part_size: u64,
        errors: Arc<ErrorAggregate>,
    ) -> Self {
        Self {
            next_number: first_number,
            offset,
            end,
            part_size,
            errors,
        }
    }
}

impl Iterator for PartIter {
    type Item = Part;

    fn next(&mut self) -> Option<Part> {
        if self.offset >= self.end || self.errors.has_error() {
            return None;
        }
        let size = self.part_size.min(self.end - self.offset);
        let part = Part {
            number: self.next_number,
            offset: self.offset,
            size,
            body: None,
        };
        self.next_number += 1;
        self.offset += size;
        Some(part)
    }
}

/// Moves one part; runs inside the worker pool
#[async_trait]
pub(crate) trait PartWorker: Send + Sync {
    async fn transfer_part(&self, part: Part) -> Result<PartResult>;
}

/// Folds finished parts into running state, in submission order
#[async_trait]
pub(crate) trait PartConsumer: Send {
    async fn consume(&mut self, done: PartResult) -> Result<()>;
}

/// Runs `parts` through at most `parallel` concurrent workers.
///
/// `consumer` sees results in the order parts were generated, whatever
/// order they finish in. Failures go to `errors`; once there is one, later
/// results are dropped and the generator stops producing parts.
pub(crate) async fn run_parts<W, S, C>(
    worker: &W,
    parts: S,
    parallel: usize,
    errors: &ErrorAggregate,
    consumer: &mut C,
) where
    W: PartWorker,
    S: Stream<Item = Result<Part>> + Send,
    C: PartConsumer,
{
    let results = parts
        .map(|part| async move { worker.transfer_part(part?).await })
        .buffered(parallel.max(1));
    futures::pin_mut!(results);

    while let Some(result) = results.next().await {
        match result {
            Ok(done) => {
                if errors.has_error() {
                    continue;
                }
                if let Err(err) = consumer.consume(done).await {
                    errors.push(err);
                }
            }
            Err(err) => errors.push(err),
        }
    }
}

/// `oss://bucket/key`, the logical path used in errors and checkpoints
pub(crate) fn oss_path(bucket: &str, key: &str) -> String {
    format!("oss://{}/{}", bucket, key)
}

/// `bytes=a-b` for the inclusive range `[start, start + len)`
pub(crate) fn range_header(start: u64, len: u64) -> String {
    format!("bytes={}-{}", start, start + len - 1)
}

/// Compares the combined checksum with the server's, as strings.
pub(crate) fn verify_crc(client_crc: u64, server_crc: Option<&str>) -> Result<()> {
    match server_crc {
        Some(server) if !server.is_empty() => {
            let client = client_crc.to_string();
            if client == server {
                Ok(())
            } else {
                Err(Error::Inconsistent {
                    client_crc: client,
                    server_crc: server.to_string(),
                })
            }
        }
        _ => Ok(()),
    }
}

/// Validate a bucket name
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    let valid = (3..=63).contains(&bucket.len())
        && bucket
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !bucket.starts_with('-')
        && !bucket.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid bucket name: {:?}", bucket)))
    }
}

/// Validate an object key
pub fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 1023 {
        return Err(Error::InvalidInput(format!(
            "object key must be 1 to 1023 bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_options() {
        let options = TransferOptions::default();
        assert_eq!(options.part_size, 6 * 1024 * 1024);
        assert_eq!(options.parallel_num, 3);
        assert!(options.enable_crc);
        assert!(!options.enable_checkpoint);

        let copy = TransferOptions::for_copy();
        assert_eq!(copy.part_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_resolved_replaces_zeros() {
        let options = TransferOptions::default()
            .with_part_size(0)
            .with_parallel_num(0)
            .resolved(DEFAULT_COPY_PART_SIZE);
        assert_eq!(options.part_size, DEFAULT_COPY_PART_SIZE);
        assert_eq!(options.parallel_num, DEFAULT_PARALLEL_NUM);
    }

    #[test]
    fn test_adjust_part_size_small_object() {
        assert_eq!(adjust_part_size(100, 1024), 1024);
        assert_eq!(adjust_part_size(10_000 * 1024, 1024), 1024);
        assert_eq!(adjust_part_size(10_000 * 1024 + 1, 1024), 2048);
    }

    #[test]
    fn test_part_iter_covers_range() {
        let errors = Arc::new(ErrorAggregate::default());
        let parts: Vec<Part> = PartIter::new(1, 10, 35, 10, errors).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].number, parts[0].offset, parts[0].size), (1, 10, 10));
        assert_eq!((parts[1].number, parts[1].offset, parts[1].size), (2, 20, 10));
        assert_eq!((parts[2].number, parts[2].offset, parts[2].size), (3, 30, 5));
    }

    #[test]
    fn test_part_iter_stops_on_error() {
        let errors = Arc::new(ErrorAggregate::default());
        let mut parts = PartIter::new(4, 0, 100, 10, errors.clone());
        assert_eq!(parts.next().map(|p| p.number), Some(4));
        errors.push(Error::Network("reset".to_string()));
        assert!(parts.next().is_none());
    }

    #[test]
    fn test_error_aggregate_keeps_first() {
        let errors = ErrorAggregate::default();
        assert!(errors.take_first().is_none());
        errors.push(Error::Network("first".to_string()));
        errors.push(Error::Network("second".to_string()));
        assert!(errors.has_error());
        let first = errors.take_first().unwrap();
        assert!(first.to_string().contains("first"));
        assert!(!errors.has_error());
    }

    #[test]
    fn test_verify_crc() {
        assert!(verify_crc(42, None).is_ok());
        assert!(verify_crc(42, Some("")).is_ok());
        assert!(verify_crc(42, Some("42")).is_ok());
        let err = verify_crc(42, Some("042")).unwrap_err();
        assert!(matches!(err, Error::Inconsistent { .. }));
    }

    #[test]
    fn test_validate_names() {
        assert!(validate_bucket_name("my-bucket-1").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("-bucket").is_err());
        assert!(validate_bucket_name("Bucket").is_err());
        assert!(validate_object_key("a/b.txt").is_ok());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key(&"k".repeat(1024)).is_err());
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(0, 10), "bytes=0-9");
        assert_eq!(range_header(100, 1), "bytes=100-100");
    }

    struct DelayedWorker;

    #[async_trait]
    impl PartWorker for DelayedWorker {
        async fn transfer_part(&self, part: Part) -> Result<PartResult> {
            // earlier parts finish later
            let delay = 40u64.saturating_sub(part.number as u64 * 10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(PartResult {
                number: part.number,
                offset: part.offset,
                size: part.size,
                etag: format!("etag-{}", part.number),
                crc64: None,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u32>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl PartConsumer for Recorder {
        async fn consume(&mut self, done: PartResult) -> Result<()> {
            if self.fail_on == Some(done.number) {
                return Err(Error::Consistency(format!("part {}", done.number)));
            }
            self.seen.push(done.number);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_parts_keeps_submission_order() {
        let errors = Arc::new(ErrorAggregate::default());
        let parts = PartIter::new(1, 0, 40, 10, errors.clone());
        let mut recorder = Recorder::default();
        run_parts(
            &DelayedWorker,
            futures::stream::iter(parts.map(Ok)),
            4,
            &errors,
            &mut recorder,
        )
        .await;
        assert_eq!(recorder.seen, vec![1, 2, 3, 4]);
        assert!(!errors.has_error());
    }

    #[tokio::test]
    async fn test_run_parts_drops_results_after_failure() {
        let errors = Arc::new(ErrorAggregate::default());
        let parts = PartIter::new(1, 0, 40, 10, errors.clone());
        let mut recorder = Recorder {
            fail_on: Some(2),
            ..Default::default()
        };
        run_parts(
            &DelayedWorker,
            futures::stream::iter(parts.map(Ok)),
            1,
            &errors,
            &mut recorder,
        )
        .await;
        assert_eq!(recorder.seen, vec![1]);
        let err = errors.take_first().unwrap();
        assert!(err.to_string().contains("part 2"));
    }

    proptest! {
        #[test]
        fn adjusted_part_size_respects_cap(total in 0u64..(1u64 << 50), part in 1u64..(1u64 << 30)) {
            let adjusted = adjust_part_size(total, part);
            prop_assert!(adjusted >= part);
            prop_assert!(total.div_ceil(adjusted) <= MAX_PARTS);
        }
    }
}
