//! Error types for storage operations.

use std::fmt;

use ja_common::{PathError, SummaryStatistics};
use ja_model::ManifestError;
use thiserror::Error;

use crate::cache_db::CacheError;

/// Object storage call that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Action {
    /// Upload of a local file (single PUT or multipart).
    UploadFile,
    /// Upload of an in-memory buffer, e.g. a manifest.
    UploadBinary,
    /// Download of an object into a local file.
    DownloadFile,
    /// Download of an object into memory.
    DownloadBinary,
    /// Paginated listing under a prefix.
    ListObjects,
    /// HEAD request used as an existence check.
    HeadObject,
}

impl S3Action {
    /// Phrase used in error messages, e.g. "uploading file".
    pub fn description(&self) -> &'static str {
        match self {
            S3Action::UploadFile => "uploading file",
            S3Action::UploadBinary => "uploading binary file",
            S3Action::DownloadFile => "downloading file",
            S3Action::DownloadBinary => "downloading binary file",
            S3Action::ListObjects => "listing bucket contents",
            S3Action::HeadObject => "checking if object exists",
        }
    }

    /// IAM permission the caller needs for this action.
    pub fn permission(&self) -> &'static str {
        match self {
            S3Action::UploadFile | S3Action::UploadBinary => "s3:PutObject",
            S3Action::DownloadFile | S3Action::DownloadBinary => "s3:GetObject",
            S3Action::ListObjects | S3Action::HeadObject => "s3:ListBucket",
        }
    }

    /// KMS permission needed when the bucket is encrypted with a customer key.
    fn kms_permission(&self) -> Option<&'static str> {
        match self {
            S3Action::UploadFile | S3Action::UploadBinary => Some("kms:GenerateDataKey"),
            S3Action::DownloadFile | S3Action::DownloadBinary => Some("kms:Decrypt"),
            S3Action::ListObjects | S3Action::HeadObject => None,
        }
    }
}

impl fmt::Display for S3Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An object storage call failed with a status code.
///
/// The message carries guidance chosen by status code followed by the
/// provider's own error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClientError {
    pub action: S3Action,
    pub status_code: u16,
    pub bucket: String,
    pub key_or_prefix: String,
    pub message: String,
}

impl StorageClientError {
    /// Build an error, prefixing the provider message with guidance for `status_code`.
    ///
    /// # Arguments
    /// * `action` - The call that failed
    /// * `status_code` - HTTP status code returned by the provider
    /// * `bucket` - Bucket the call targeted
    /// * `key_or_prefix` - Object key, or prefix for listings
    /// * `provider_message` - Error text returned by the provider
    pub fn new(
        action: S3Action,
        status_code: u16,
        bucket: impl Into<String>,
        key_or_prefix: impl Into<String>,
        provider_message: impl AsRef<str>,
    ) -> Self {
        let provider_message: &str = provider_message.as_ref();
        let guidance: String = status_code_guidance(action, status_code, provider_message);
        let message: String = match (guidance.is_empty(), provider_message.is_empty()) {
            (true, _) => provider_message.to_string(),
            (false, true) => guidance,
            (false, false) => format!("{} {}", guidance, provider_message),
        };
        Self {
            action,
            status_code,
            bucket: bucket.into(),
            key_or_prefix: key_or_prefix.into(),
            message,
        }
    }

    /// Append the local file involved, e.g. "(Failed to upload /a/b.txt)".
    pub fn with_local_path(mut self, verb: &str, path: &std::path::Path) -> Self {
        self.message = format!("{} (Failed to {} {})", self.message, verb, path.display());
        self
    }

    /// Transient failures a caller may retry: 408, 500 and 503.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status_code, 408 | 500 | 503)
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }
}

impl fmt::Display for StorageClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error {} in bucket '{}', Target key or prefix: '{}', HTTP Status Code: {}",
            self.action, self.bucket, self.key_or_prefix, self.status_code
        )?;
        if !self.message.is_empty() {
            write!(f, ", {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageClientError {}

fn status_code_guidance(action: S3Action, status_code: u16, provider_message: &str) -> String {
    match status_code {
        403 => match action.kms_permission() {
            Some(kms_permission) if provider_message.contains("kms:") => format!(
                "Forbidden or Access denied. Please check your AWS credentials and Job \
                 Attachments S3 bucket encryption settings. If a customer-managed KMS key is \
                 set, confirm that your AWS IAM Role or User has the '{}' and \
                 'kms:DescribeKey' permissions for the key used to encrypt the bucket.",
                kms_permission
            ),
            _ => format!(
                "Forbidden or Access denied. Please check your AWS credentials, and ensure \
                 that your AWS IAM Role or User has the '{}' permission for this bucket.",
                action.permission()
            ),
        },
        404 => "Not found. Please check your bucket name and object key, and ensure that \
                they exist in the AWS account."
            .to_string(),
        408 => "Request timeout. Please consider retrying later, or ensure your network \
                connection is stable."
            .to_string(),
        500 => "Internal server error. It might be an issue on AWS's side; please consider \
                retrying later or contacting AWS support."
            .to_string(),
        503 => "Service unavailable. AWS S3 might be down or experiencing high traffic. \
                Please consider retrying after some time."
            .to_string(),
        _ => String::new(),
    }
}

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The object store answered with an error status.
    #[error(transparent)]
    Client(#[from] StorageClientError),

    /// The request never produced a status code (connection, DNS, signing).
    #[error("An issue occurred with AWS service request while {action}: {message}")]
    Transport { action: S3Action, message: String },

    /// The progress callback asked to stop. Carries what was done so far.
    #[error("{operation} cancelled. {summary}")]
    Cancelled {
        operation: &'static str,
        summary: SummaryStatistics,
    },

    #[error("Job attachment settings are missing the S3 bucket name")]
    MissingS3Bucket,

    #[error("Job attachment settings are missing the S3 root prefix")]
    MissingS3RootPrefix,

    /// Nothing at all is stored under an output manifest prefix.
    #[error("Unable to find asset manifest in s3://{bucket}/{prefix}")]
    NoManifestsFound { bucket: String, prefix: String },

    /// An output manifest object carries no `asset-root` metadata.
    #[error("Failed to get asset root from metadata of output manifest: {key}")]
    MissingAssetRoot { key: String },

    /// Output discovery was asked for an inconsistent job/step/task scope.
    #[error("{message}")]
    InvalidOutputScope { message: String },

    /// `set_root_path` named a root that is not among the discovered outputs.
    #[error("The root path {root} was not found in output manifests.")]
    UnknownRoot { root: String },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Invalid transfer or client configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl StorageError {
    /// Only object store responses with 408, 500 or 503 are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Client(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn upload_cancelled(summary: SummaryStatistics) -> Self {
        StorageError::Cancelled {
            operation: "File upload",
            summary,
        }
    }

    pub fn download_cancelled(summary: SummaryStatistics) -> Self {
        StorageError::Cancelled {
            operation: "File download",
            summary,
        }
    }

    /// Statistics attached to a cancellation, if this is one.
    pub fn cancelled_summary(&self) -> Option<&SummaryStatistics> {
        match self {
            StorageError::Cancelled { summary, .. } => Some(summary),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            path: String::new(),
            message: err.to_string(),
        }
    }
}
