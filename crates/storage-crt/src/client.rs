//! AWS SDK S3 client implementation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_smithy_types::timeout::TimeoutConfig;
use tokio::io::AsyncWriteExt;

use ja_storage::{
    ByteProgress, CompletedPart, ObjectInfo, S3Action, StorageClient, StorageError,
    StorageSettings,
};

use crate::error::{map_sdk_error, status_code, CrtError};

/// StorageClient implementation using AWS SDK for Rust.
///
/// Construct once per process and pass it by reference; the SDK client
/// pools connections internally.
pub struct CrtStorageClient {
    s3_client: S3Client,
    /// Sent with every request so buckets owned by another account are refused.
    expected_bucket_owner: Option<String>,
}

impl CrtStorageClient {
    /// Create a client from the default credential chain, or the static
    /// credentials in `settings` if present.
    ///
    /// # Errors
    /// `InvalidConfig` if the region is empty.
    pub async fn new(settings: StorageSettings) -> Result<Self, StorageError> {
        if settings.region.is_empty() {
            return Err(CrtError::Config {
                message: "region must not be empty".into(),
            }
            .into());
        }

        let timeouts: TimeoutConfig = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build();

        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .timeout_config(timeouts);

        if let Some(creds) = &settings.credentials {
            config_loader = config_loader.credentials_provider(Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                "job-attachments",
            ));
        }

        let sdk_config = config_loader.load().await;
        log::debug!("Created S3 client for region {}", settings.region);

        Ok(Self {
            s3_client: S3Client::new(&sdk_config),
            expected_bucket_owner: settings.expected_bucket_owner,
        })
    }

    /// Wrap an existing S3 client.
    pub fn from_client(s3_client: S3Client, expected_bucket_owner: Option<String>) -> Self {
        Self {
            s3_client,
            expected_bucket_owner,
        }
    }

    fn owner(&self) -> Option<String> {
        self.expected_bucket_owner.clone()
    }
}

#[async_trait]
impl StorageClient for CrtStorageClient {
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        let result = self
            .s3_client
            .head_object()
            .bucket(bucket)
            .key(key)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().map(|l| l as u64).unwrap_or(0),
                last_modified: output.last_modified().map(|dt| dt.secs()),
                etag: output.e_tag().map(str::to_string),
                content_type: output.content_type().map(str::to_string),
                metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(err) if status_code(&err) == Some(404) => Ok(None),
            Err(err) => Err(map_sdk_error(err, S3Action::HeadObject, bucket, key)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        self.s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .set_content_type(content_type.map(str::to_string))
            .set_metadata(metadata.cloned())
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadBinary, bucket, key))?;
        Ok(())
    }

    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<(), StorageError> {
        let size: u64 = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| StorageError::io(file_path, e))?
            .len();
        let body: ByteStream = ByteStream::from_path(file_path)
            .await
            .map_err(|e| StorageError::Io {
                path: file_path.display().to_string(),
                message: e.to_string(),
            })?;

        self.s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadFile, bucket, key))?;

        // The SDK does not expose per-chunk upload progress.
        if let Some(progress) = progress {
            progress.on_progress(&size);
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::DownloadBinary, bucket, key))?;

        let data: Vec<u8> = response
            .body
            .collect()
            .await
            .map_err(|e| CrtError::Body {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, StorageError> {
        let response = self
            .s3_client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::DownloadFile, bucket, key))?;

        let mut file: tokio::fs::File = tokio::fs::File::create(file_path)
            .await
            .map_err(|e| StorageError::io(file_path, e))?;

        let mut written: u64 = 0;
        let mut body: ByteStream = response.body;
        while let Some(chunk) = body.try_next().await.map_err(|e| CrtError::Body {
            key: key.to_string(),
            message: e.to_string(),
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(file_path, e))?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                progress.on_progress(&(chunk.len() as u64));
            }
        }

        file.flush()
            .await
            .map_err(|e| StorageError::io(file_path, e))?;
        Ok(written)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .s3_client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .set_expected_bucket_owner(self.owner())
                .send()
                .await
                .map_err(|err| map_sdk_error(err, S3Action::ListObjects, bucket, prefix))?;

            for obj in response.contents() {
                objects.push(ObjectInfo {
                    key: obj.key().unwrap_or_default().to_string(),
                    size: obj.size().map(|s| s as u64).unwrap_or(0),
                    last_modified: obj.last_modified().map(|dt| dt.secs()),
                    etag: obj.e_tag().map(str::to_string),
                    ..ObjectInfo::default()
                });
            }

            match (response.is_truncated(), response.next_continuation_token()) {
                (Some(true), Some(token)) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        log::debug!(
            "Listed {} objects under s3://{}/{}",
            objects.len(),
            bucket,
            prefix
        );
        Ok(objects)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        let output = self
            .s3_client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadFile, bucket, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| {
                CrtError::MissingField {
                    field: "UploadId",
                    key: key.to_string(),
                }
                .into()
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        let output = self
            .s3_client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadFile, bucket, key))?;

        let etag: String = output.e_tag().map(str::to_string).ok_or_else(|| {
            StorageError::from(CrtError::MissingField {
                field: "ETag",
                key: key.to_string(),
            })
        })?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let parts: Vec<S3CompletedPart> = parts
            .into_iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        self.s3_client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadFile, bucket, key))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.s3_client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .set_expected_bucket_owner(self.owner())
            .send()
            .await
            .map_err(|err| map_sdk_error(err, S3Action::UploadFile, bucket, key))?;
        log::debug!("Aborted multipart upload {} of {}", upload_id, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crt_client_is_a_storage_client() {
        fn assert_storage_client<T: StorageClient>() {}
        assert_storage_client::<CrtStorageClient>();
    }

    #[tokio::test]
    async fn test_empty_region_is_rejected() {
        let settings: StorageSettings = StorageSettings {
            region: String::new(),
            ..StorageSettings::default()
        };
        let result: Result<CrtStorageClient, StorageError> = CrtStorageClient::new(settings).await;
        assert!(matches!(result, Err(StorageError::InvalidConfig { .. })));
    }
}
