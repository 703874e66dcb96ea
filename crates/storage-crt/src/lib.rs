//! AWS SDK S3 backend for job attachments storage.
//!
//! Provides a [`StorageClient`](ja_storage::StorageClient) backed by the AWS
//! SDK for Rust. Failures that carry an HTTP status become
//! [`StorageClientError`](ja_storage::StorageClientError)s so callers can
//! tell retryable responses from permission or configuration problems.
//!
//! # Example
//!
//! ```ignore
//! use ja_storage::{StorageSettings, UploadOrchestrator};
//! use ja_storage_crt::CrtStorageClient;
//!
//! let client = CrtStorageClient::new(StorageSettings::default()).await?;
//! let orchestrator = UploadOrchestrator::new(&client);
//! ```

mod client;
mod error;

pub use client::CrtStorageClient;
pub use error::CrtError;
