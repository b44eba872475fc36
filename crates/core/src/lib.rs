//! ossxfer-core - Resumable multipart transfers for object storage
//!
//! Uploads, downloads and server-side copies of objects of any size, split
//! into parts that move concurrently, verified end to end with a combined
//! CRC-64 and resumable from checkpoint files after a crash.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod crc64;
pub mod error;
pub mod ops;
pub mod transfer;

// Re-export commonly used types
pub use client::S3Client;
pub use config::{config_exists, get_config_path, load_config, load_config_from, save_config, validate_config};
pub use config::{AdvancedConfig, ConfigFile, EndpointConfig, LoggingConfig, TransferConfig};
pub use crc64::Crc64;
pub use error::{Error, Result};
pub use ops::ObjectClient;
pub use transfer::copy::{Copier, CopyRequest, MetadataDirective, TaggingDirective};
pub use transfer::download::{ByteRange, DownloadDestination, DownloadRequest, DownloadResult, Downloader};
pub use transfer::upload::{UploadRequest, UploadSource, Uploader};
pub use transfer::{adjust_part_size, ProgressCallback, TransferOptions, TransferResult};
