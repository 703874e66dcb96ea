//! Error types for the AWS SDK storage client.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use ja_storage::{S3Action, StorageClientError, StorageError};
use thiserror::Error;

/// Errors raised by the client itself rather than by S3.
#[derive(Error, Debug)]
pub enum CrtError {
    /// Settings cannot produce a working client.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The response body stopped mid-transfer.
    #[error("Failed to read response body for {key}: {message}")]
    Body { key: String, message: String },

    /// A response lacked a field the operation needs, e.g. an upload id.
    #[error("Missing {field} in response for {key}")]
    MissingField { field: &'static str, key: String },
}

impl From<CrtError> for StorageError {
    fn from(err: CrtError) -> Self {
        match err {
            CrtError::Config { message } => StorageError::InvalidConfig { message },
            CrtError::Body { .. } => StorageError::Transport {
                action: S3Action::DownloadFile,
                message: err.to_string(),
            },
            CrtError::MissingField { .. } => StorageError::Other {
                message: err.to_string(),
            },
        }
    }
}

/// Join the provider's error code and message as they appear in S3 responses.
pub(crate) fn provider_message(code: Option<&str>, message: Option<&str>) -> String {
    match (code, message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code.to_string(),
        (None, Some(message)) => message.to_string(),
        (None, None) => String::new(),
    }
}

/// Classify an SDK failure.
///
/// Anything that produced an HTTP response becomes a [`StorageClientError`]
/// with that status code; everything else is a transport error.
pub(crate) fn map_sdk_error<E>(
    err: SdkError<E>,
    action: S3Action,
    bucket: &str,
    key_or_prefix: &str,
) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(status_code) => StorageClientError::new(
            action,
            status_code,
            bucket,
            key_or_prefix,
            provider_message(err.code(), err.message()),
        )
        .into(),
        None => StorageError::Transport {
            action,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

/// HTTP status of a failed call, if the server answered.
pub(crate) fn status_code<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_message() {
        assert_eq!(
            provider_message(Some("AccessDenied"), Some("Access Denied")),
            "AccessDenied: Access Denied"
        );
        assert_eq!(provider_message(Some("NoSuchKey"), None), "NoSuchKey");
        assert_eq!(provider_message(None, None), "");
    }

    #[test]
    fn test_config_error_maps_to_invalid_config() {
        let err: StorageError = CrtError::Config {
            message: "region must not be empty".into(),
        }
        .into();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));
    }

    #[test]
    fn test_body_error_is_transport() {
        let err: StorageError = CrtError::Body {
            key: "Root/Data/abc".into(),
            message: "connection reset".into(),
        }
        .into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Root/Data/abc"));
    }
}
