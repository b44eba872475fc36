//! Error types for ossxfer-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ossxfer-core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ossxfer-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidConfig(String),

    /// Invalid input (bucket, key, range, options)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The service answered with an error
    #[error("{operation} failed: status {status_code}, code {code}, message {message}, request id {request_id}")]
    Service {
        operation: String,
        status_code: u16,
        code: String,
        message: String,
        request_id: String,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Locally computed and server reported checksums disagree
    #[error("crc is inconsistent, client {client_crc}, server {server_crc}")]
    Inconsistent {
        client_crc: String,
        server_crc: String,
    },

    /// Resumed state or part order no longer matches the source
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Checkpoint directory is unusable
    #[error("Invalid checkpoint directory {0}: {1}")]
    CheckpointDir(PathBuf, String),

    /// A transfer failed; carries the logical path and multipart session
    #[error("{direction} failed, path: {path}{}: {source}", .upload_id.as_deref().map(|id| format!(", upload id: {}", id)).unwrap_or_default())]
    Transfer {
        direction: &'static str,
        path: String,
        upload_id: Option<String>,
        #[source]
        source: Box<Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the failure was a timeout, possibly behind a transfer wrapper.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Transfer { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Multipart session id carried by a wrapped transfer error.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Error::Transfer { upload_id, .. } => upload_id.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of a service error, looking through transfer wrappers.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Service { status_code, .. } => Some(*status_code),
            Error::Transfer { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Names the operation on a service error produced by a generic conversion.
    pub fn with_operation(mut self, name: &str) -> Self {
        if let Error::Service { operation, .. } = &mut self {
            *operation = name.to_string();
        }
        self
    }

    pub(crate) fn wrap(self, direction: &'static str, path: String, upload_id: Option<String>) -> Self {
        Error::Transfer {
            direction,
            path,
            upload_id,
            source: Box::new(self),
        }
    }
}

// Generic SdkError conversion for all S3 operations
impl<E> From<aws_sdk_s3::error::SdkError<E>> for Error
where
    E: aws_sdk_s3::error::ProvideErrorMetadata
        + aws_sdk_s3::operation::RequestId
        + std::error::Error
        + Send
        + Sync
        + 'static,
{
    fn from(err: aws_sdk_s3::error::SdkError<E>) -> Self {
        use aws_sdk_s3::error::SdkError;

        match &err {
            SdkError::TimeoutError(_) => Error::Timeout(format!("{:?}", err)),
            SdkError::DispatchFailure(failure) => {
                if failure.is_timeout() {
                    Error::Timeout(format!("{:?}", failure))
                } else {
                    Error::Network(format!("{:?}", failure))
                }
            }
            SdkError::ServiceError(service) => {
                let inner = service.err();
                Error::Service {
                    operation: String::new(),
                    status_code: service.raw().status().as_u16(),
                    code: inner.code().unwrap_or("Unknown").to_string(),
                    message: inner.message().unwrap_or("").to_string(),
                    request_id: inner.request_id().unwrap_or("").to_string(),
                }
            }
            _ => Error::Network(format!("{:?}", err)),
        }
    }
}

// ByteStreamError conversion
impl From<aws_sdk_s3::primitives::ByteStreamError> for Error {
    fn from(err: aws_sdk_s3::primitives::ByteStreamError) -> Self {
        Error::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_names_upload_id() {
        let err = Error::Network("connection reset".to_string()).wrap(
            "upload",
            "oss://bucket/key".to_string(),
            Some("0004B9894A22E5B1888A1E29F823****".to_string()),
        );

        let text = err.to_string();
        assert!(text.contains("upload failed"));
        assert!(text.contains("oss://bucket/key"));
        assert!(text.contains("0004B9894A22E5B1888A1E29F823****"));
        assert_eq!(err.upload_id(), Some("0004B9894A22E5B1888A1E29F823****"));
    }

    #[test]
    fn test_transfer_error_without_upload_id() {
        let err = Error::Timeout("read".to_string()).wrap("download", "oss://b/k".to_string(), None);
        assert!(!err.to_string().contains("upload id"));
        assert!(err.is_timeout());
        assert_eq!(err.upload_id(), None);
    }

    #[test]
    fn test_status_code_through_wrapper() {
        let err = Error::Service {
            operation: "UploadPart".to_string(),
            status_code: 403,
            code: "AccessDenied".to_string(),
            message: "denied".to_string(),
            request_id: "id".to_string(),
        }
        .wrap("copy", "oss://b/k".to_string(), Some("u".to_string()));
        assert_eq!(err.status_code(), Some(403));
        assert!(!err.is_timeout());
    }
}
