//! Manifest storage operations for S3.
//!
//! Uploading and downloading manifest documents, the metadata attached to
//! them, and discovery of the output manifests a job has produced.
//!
//! # S3 Key Structure
//!
//! ## Input Manifests
//! ```text
//! s3://{bucket}/{root_prefix}/Manifests/{farm_id}/{queue_id}/Inputs/{guid}/{root_hash}_input
//! ```
//!
//! ## Output Manifests
//! ```text
//! s3://{bucket}/{root_prefix}/Manifests/{farm_id}/{queue_id}/{job_id}/{step_id}/{task_id}/{timestamp}_{session_action_id}/{root_hash}_output
//! ```

use std::collections::{BTreeMap, HashMap};

use futures::stream::{self, StreamExt, TryStreamExt};
use ja_common::hash_bytes;
use ja_model::{decode_manifest, to_ascii_json, AssetManifest, ManifestError};
use regex::Regex;

use crate::error::StorageError;
use crate::traits::{ObjectInfo, StorageClient};
use crate::types::{join_s3_paths, JobAttachmentSettings};

/// S3 metadata key for asset root (ASCII paths).
pub const METADATA_KEY_ASSET_ROOT: &str = "asset-root";

/// S3 metadata key for asset root (JSON-encoded, for non-ASCII paths).
pub const METADATA_KEY_ASSET_ROOT_JSON: &str = "asset-root-json";

/// S3 metadata key for file system location name.
pub const METADATA_KEY_FILE_SYSTEM_LOCATION_NAME: &str = "file-system-location-name";

/// Concurrent manifest downloads during output discovery.
pub const DEFAULT_MANIFEST_DOWNLOAD_CONCURRENCY: usize = 10;

const OUTPUT_MANIFEST_KEY_PATTERN: &str = r"task-.*/.*/.*_output";

/// S3 metadata attached to output manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestS3Metadata {
    /// Root path the manifest was created from.
    pub asset_root: String,
    /// Storage profile location of the root, if any.
    pub file_system_location_name: Option<String>,
}

impl ManifestS3Metadata {
    pub fn new(asset_root: impl Into<String>) -> Self {
        Self {
            asset_root: asset_root.into(),
            file_system_location_name: None,
        }
    }

    pub fn with_location(
        asset_root: impl Into<String>,
        file_system_location_name: Option<&str>,
    ) -> Self {
        Self {
            asset_root: asset_root.into(),
            file_system_location_name: file_system_location_name.map(str::to_string),
        }
    }

    /// Build S3 metadata headers for upload.
    ///
    /// Non-ASCII roots are JSON-encoded with `\uXXXX` escapes into both
    /// `asset-root` and `asset-root-json`, since S3 metadata values must be ASCII.
    pub fn to_s3_metadata(&self) -> Result<HashMap<String, String>, StorageError> {
        let mut metadata: HashMap<String, String> = HashMap::new();

        if self.asset_root.is_ascii() {
            metadata.insert(METADATA_KEY_ASSET_ROOT.to_string(), self.asset_root.clone());
        } else {
            let json_encoded: String =
                to_ascii_json(&self.asset_root).map_err(ManifestError::from)?;
            metadata.insert(METADATA_KEY_ASSET_ROOT.to_string(), json_encoded.clone());
            metadata.insert(METADATA_KEY_ASSET_ROOT_JSON.to_string(), json_encoded);
        }

        if let Some(ref location) = self.file_system_location_name {
            metadata.insert(
                METADATA_KEY_FILE_SYSTEM_LOCATION_NAME.to_string(),
                location.clone(),
            );
        }

        Ok(metadata)
    }

    /// Parse metadata from a HEAD response.
    ///
    /// Prefers `asset-root-json`, falls back to `asset-root`.
    ///
    /// # Returns
    /// `None` if neither root key is present.
    pub fn from_s3_metadata(metadata: &HashMap<String, String>) -> Option<Self> {
        let asset_root: String = metadata
            .get(METADATA_KEY_ASSET_ROOT_JSON)
            .and_then(|v| serde_json::from_str(v).ok())
            .or_else(|| metadata.get(METADATA_KEY_ASSET_ROOT).cloned())?;

        Some(Self {
            asset_root,
            file_system_location_name: metadata
                .get(METADATA_KEY_FILE_SYSTEM_LOCATION_NAME)
                .cloned(),
        })
    }
}

/// Convert a float timestamp (seconds since epoch) to ISO 8601.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffffZ`, e.g. `2025-05-22T22:17:03.409012Z`.
pub fn float_to_iso_datetime_string(timestamp: f64) -> String {
    let seconds: i64 = timestamp.trunc() as i64;
    let microseconds: u32 = (timestamp.fract() * 1_000_000.0).abs().round().min(999_999.0) as u32;

    let dt: chrono::DateTime<chrono::Utc> =
        chrono::DateTime::from_timestamp(seconds, microseconds * 1000)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);

    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Hash naming a root's manifest: xxh128 of location name (if any) followed by the root path.
pub fn compute_root_path_hash(file_system_location_name: Option<&str>, root_path: &str) -> String {
    let data: String = format!("{}{}", file_system_location_name.unwrap_or(""), root_path);
    hash_bytes(data.as_bytes())
}

/// Content type stored with a manifest object.
pub fn manifest_content_type(manifest: &AssetManifest) -> String {
    manifest.manifest_version.content_type()
}

/// Upload an output manifest under `full_output_prefix`.
///
/// The object is tagged with the asset root and location so
/// [`get_output_manifests_by_asset_root`] can recover them.
///
/// # Returns
/// The full key written.
pub async fn upload_output_manifest<C: StorageClient + ?Sized>(
    client: &C,
    bucket: &str,
    full_output_prefix: &str,
    manifest: &AssetManifest,
    root_path: &str,
    file_system_location_name: Option<&str>,
) -> Result<String, StorageError> {
    let manifest_text: String = manifest.encode()?;
    let key: String = join_s3_paths(&[
        full_output_prefix,
        format!(
            "{}_output",
            compute_root_path_hash(file_system_location_name, root_path)
        )
        .as_str(),
    ]);
    let metadata: HashMap<String, String> =
        ManifestS3Metadata::with_location(root_path, file_system_location_name).to_s3_metadata()?;

    log::info!("Uploading output manifest to {}", key);
    client
        .put_object(
            bucket,
            &key,
            manifest_text.as_bytes(),
            Some(&manifest_content_type(manifest)),
            Some(&metadata),
        )
        .await?;
    Ok(key)
}

/// Download and decode the manifest at `key`.
pub async fn download_manifest<C: StorageClient + ?Sized>(
    client: &C,
    bucket: &str,
    key: &str,
) -> Result<AssetManifest, StorageError> {
    let bytes: Vec<u8> = client.get_object(bucket, key).await?;
    let text: String = String::from_utf8(bytes).map_err(|e| StorageError::Other {
        message: format!("Manifest {} is not valid UTF-8: {}", key, e),
    })?;
    Ok(decode_manifest(&text)?)
}

/// Root metadata of the manifest at `key`, or `None` if it carries none.
pub async fn get_manifest_metadata<C: StorageClient + ?Sized>(
    client: &C,
    bucket: &str,
    key: &str,
) -> Result<Option<ManifestS3Metadata>, StorageError> {
    let info: Option<ObjectInfo> = client.head_object(bucket, key).await?;
    Ok(info.and_then(|i| ManifestS3Metadata::from_s3_metadata(&i.metadata)))
}

/// Which outputs of a job to discover.
///
/// A session action requires a task, and a task requires a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputManifestScope {
    pub farm_id: String,
    pub queue_id: String,
    pub job_id: String,
    pub step_id: Option<String>,
    pub task_id: Option<String>,
    pub session_action_id: Option<String>,
}

impl OutputManifestScope {
    /// All outputs of a job.
    pub fn job(
        farm_id: impl Into<String>,
        queue_id: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            farm_id: farm_id.into(),
            queue_id: queue_id.into(),
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_session_action(mut self, session_action_id: impl Into<String>) -> Self {
        self.session_action_id = Some(session_action_id.into());
        self
    }

    /// Listing prefix for this scope, terminated by `/`.
    ///
    /// A session action narrows by folder name after listing, so its prefix
    /// is the task prefix.
    pub fn prefix(&self, settings: &JobAttachmentSettings) -> Result<String, StorageError> {
        if self.session_action_id.is_some() && (self.task_id.is_none() || self.step_id.is_none()) {
            return Err(StorageError::InvalidOutputScope {
                message: "Session Action ID specified, but no Task ID or Step ID. Job, Step, and \
                          Task ID are required to retrieve task outputs."
                    .to_string(),
            });
        }

        let prefix: String = match (&self.step_id, &self.task_id) {
            (Some(step), Some(task)) => settings.full_task_output_prefix(
                &self.farm_id,
                &self.queue_id,
                &self.job_id,
                step,
                task,
            )?,
            (None, Some(_)) => {
                return Err(StorageError::InvalidOutputScope {
                    message: "Task ID specified, but no Step ID. Job, Step, and Task ID are \
                              required to retrieve task outputs."
                        .to_string(),
                })
            }
            (Some(step), None) => {
                settings.full_step_output_prefix(&self.farm_id, &self.queue_id, &self.job_id, step)?
            }
            (None, None) => {
                settings.full_job_output_prefix(&self.farm_id, &self.queue_id, &self.job_id)?
            }
        };
        Ok(format!("{}/", prefix))
    }
}

/// Keep the output manifests of the latest session folder under each task folder.
///
/// Keys must match `task-.*/.*/.*_output`. Session folders start with an
/// ISO timestamp, so the alphabetically last one is the latest. With
/// `session_action_id`, the folder ending in `_{session_action_id}` is kept
/// instead.
pub fn select_latest_task_manifest_keys(
    keys: &[String],
    session_action_id: Option<&str>,
) -> Result<Vec<String>, StorageError> {
    let pattern: Regex = Regex::new(OUTPUT_MANIFEST_KEY_PATTERN).map_err(|e| StorageError::Other {
        message: e.to_string(),
    })?;

    // task folder -> session folder -> keys
    let mut by_task: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for key in keys.iter().filter(|k| pattern.is_match(k)) {
        let parts: Vec<&str> = key.split('/').collect();
        let Some(task_index) = parts.iter().position(|p| p.contains("task-")) else {
            continue;
        };
        let Some(session_folder) = parts.get(task_index + 1) else {
            continue;
        };
        by_task
            .entry(parts[..=task_index].join("/"))
            .or_default()
            .entry(session_folder.to_string())
            .or_default()
            .push(key.clone());
    }

    let mut selected: Vec<String> = Vec::new();
    for (task_folder, sessions) in by_task {
        let chosen: Option<Vec<String>> = match session_action_id {
            Some(id) => {
                let suffix: String = format!("_{}", id);
                sessions
                    .into_iter()
                    .find(|(folder, _)| folder.ends_with(&suffix))
                    .map(|(_, keys)| keys)
            }
            None => sessions.into_iter().next_back().map(|(_, keys)| keys),
        };
        if let Some(mut keys) = chosen {
            log::debug!("Selected {} output manifest(s) under {}", keys.len(), task_folder);
            keys.sort();
            selected.extend(keys);
        }
    }
    Ok(selected)
}

/// List and select the output manifest keys for `scope`.
///
/// # Errors
/// `NoManifestsFound` if nothing is stored under the scope's prefix.
pub async fn discover_output_manifest_keys<C: StorageClient + ?Sized>(
    client: &C,
    settings: &JobAttachmentSettings,
    scope: &OutputManifestScope,
) -> Result<Vec<String>, StorageError> {
    let prefix: String = scope.prefix(settings)?;
    let objects: Vec<ObjectInfo> = client
        .list_objects(&settings.s3_bucket_name, &prefix)
        .await?;
    if objects.is_empty() {
        return Err(StorageError::NoManifestsFound {
            bucket: settings.s3_bucket_name.clone(),
            prefix,
        });
    }

    let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
    select_latest_task_manifest_keys(&keys, scope.session_action_id.as_deref())
}

/// Map each asset root to the output manifests recorded for it.
///
/// Manifests for one root keep the order of their keys. A scope with
/// nothing stored under it yields an empty map.
///
/// # Errors
/// `MissingAssetRoot` if a manifest carries no root metadata.
pub async fn get_output_manifests_by_asset_root<C: StorageClient + ?Sized>(
    client: &C,
    settings: &JobAttachmentSettings,
    scope: &OutputManifestScope,
) -> Result<BTreeMap<String, Vec<AssetManifest>>, StorageError> {
    let keys: Vec<String> = match discover_output_manifest_keys(client, settings, scope).await {
        Ok(keys) => keys,
        Err(e @ StorageError::NoManifestsFound { .. }) => {
            log::warn!("{}", e);
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(e),
    };
    let bucket: &str = settings.s3_bucket_name.as_str();

    let downloaded: Vec<(String, AssetManifest)> = stream::iter(keys)
        .map(|key| async move {
            let manifest: AssetManifest = download_manifest(client, bucket, &key).await?;
            let metadata: ManifestS3Metadata = get_manifest_metadata(client, bucket, &key)
                .await?
                .ok_or_else(|| StorageError::MissingAssetRoot { key: key.clone() })?;
            Ok::<(String, AssetManifest), StorageError>((metadata.asset_root, manifest))
        })
        .buffered(DEFAULT_MANIFEST_DOWNLOAD_CONCURRENCY)
        .try_collect()
        .await?;

    let mut outputs: BTreeMap<String, Vec<AssetManifest>> = BTreeMap::new();
    for (root, manifest) in downloaded {
        outputs.entry(root).or_default().push(manifest);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorageClient;
    use ja_model::ManifestPath;

    const BUCKET: &str = "bucket";

    fn settings() -> JobAttachmentSettings {
        JobAttachmentSettings::new(BUCKET, "Root")
    }

    fn manifest(path: &str) -> AssetManifest {
        AssetManifest::new(vec![ManifestPath::new(path, hash_bytes(path.as_bytes()), 1, 1)])
    }

    #[test]
    fn test_float_to_iso_datetime_string() {
        assert_eq!(
            float_to_iso_datetime_string(1_700_000_000.5),
            "2023-11-14T22:13:20.500000Z"
        );
        assert_eq!(float_to_iso_datetime_string(0.0), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_root_path_hash_includes_location() {
        assert_eq!(compute_root_path_hash(None, "/mnt/root"), hash_bytes(b"/mnt/root"));
        assert_eq!(
            compute_root_path_hash(Some("Loc"), "/mnt/root"),
            hash_bytes(b"Loc/mnt/root")
        );
    }

    #[test]
    fn test_metadata_ascii_and_non_ascii() {
        let ascii: HashMap<String, String> =
            ManifestS3Metadata::with_location("/mnt/root", Some("Loc")).to_s3_metadata().unwrap();
        assert_eq!(ascii.get(METADATA_KEY_ASSET_ROOT).unwrap(), "/mnt/root");
        assert!(!ascii.contains_key(METADATA_KEY_ASSET_ROOT_JSON));
        assert_eq!(ascii.get(METADATA_KEY_FILE_SYSTEM_LOCATION_NAME).unwrap(), "Loc");

        let unicode: HashMap<String, String> = ManifestS3Metadata::new("/mnt/日本").to_s3_metadata().unwrap();
        let encoded: &String = unicode.get(METADATA_KEY_ASSET_ROOT_JSON).unwrap();
        assert_eq!(encoded, "\"/mnt/\\u65e5\\u672c\"");
        assert!(encoded.is_ascii());
        assert_eq!(
            ManifestS3Metadata::from_s3_metadata(&unicode).unwrap().asset_root,
            "/mnt/日本"
        );
    }

    #[test]
    fn test_metadata_escapes_match_manifest_encoding() {
        let metadata: HashMap<String, String> =
            ManifestS3Metadata::new("/mnt/été\n\u{7f}").to_s3_metadata().unwrap();
        let encoded: &String = metadata.get(METADATA_KEY_ASSET_ROOT_JSON).unwrap();
        assert_eq!(encoded, "\"/mnt/\\u00e9t\\u00e9\\n\u{7f}\"");
        assert_eq!(metadata.get(METADATA_KEY_ASSET_ROOT).unwrap(), encoded);
        assert_eq!(
            ManifestS3Metadata::from_s3_metadata(&metadata).unwrap().asset_root,
            "/mnt/été\n\u{7f}"
        );
    }

    #[test]
    fn test_scope_validation() {
        let base: OutputManifestScope = OutputManifestScope::job("farm-1", "queue-1", "job-1");
        assert_eq!(
            base.prefix(&settings()).unwrap(),
            "Root/Manifests/farm-1/queue-1/job-1/"
        );
        assert_eq!(
            base.clone().with_step("step-1").with_task("task-1").prefix(&settings()).unwrap(),
            "Root/Manifests/farm-1/queue-1/job-1/step-1/task-1/"
        );
        assert!(matches!(
            base.clone().with_task("task-1").prefix(&settings()),
            Err(StorageError::InvalidOutputScope { .. })
        ));
        assert!(matches!(
            base.with_step("step-1").with_session_action("sessionaction-1").prefix(&settings()),
            Err(StorageError::InvalidOutputScope { .. })
        ));
    }

    #[test]
    fn test_select_latest_session_per_task() {
        let keys: Vec<String> = vec![
            "p/step-1/task-1/2024-01-01T00:00:00.000000Z_sessionaction-a/h1_output".into(),
            "p/step-1/task-1/2024-01-02T00:00:00.000000Z_sessionaction-b/h1_output".into(),
            "p/step-1/task-1/2024-01-02T00:00:00.000000Z_sessionaction-b/h2_output".into(),
            "p/step-1/task-2/2024-01-01T00:00:00.000000Z_sessionaction-c/h1_output".into(),
            "p/step-1/task-2/2024-01-01T00:00:00.000000Z_sessionaction-c/notes.txt".into(),
        ];

        let latest: Vec<String> = select_latest_task_manifest_keys(&keys, None).unwrap();
        assert_eq!(latest, vec![keys[1].clone(), keys[2].clone(), keys[3].clone()]);

        let pinned: Vec<String> =
            select_latest_task_manifest_keys(&keys, Some("sessionaction-a")).unwrap();
        assert_eq!(pinned, vec![keys[0].clone()]);
    }

    #[tokio::test]
    async fn test_output_manifests_grouped_by_root() {
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let settings: JobAttachmentSettings = settings();
        let task_prefix: String = settings
            .full_output_prefix("farm-1", "queue-1", "job-1", "step-1", "task-1", "2024_sessionaction-1")
            .unwrap();
        let other_task: String = settings
            .full_output_prefix("farm-1", "queue-1", "job-1", "step-1", "task-2", "2024_sessionaction-2")
            .unwrap();

        upload_output_manifest(&client, BUCKET, &task_prefix, &manifest("a.txt"), "/mnt/one", None)
            .await
            .unwrap();
        upload_output_manifest(&client, BUCKET, &other_task, &manifest("b.txt"), "/mnt/one", None)
            .await
            .unwrap();
        upload_output_manifest(&client, BUCKET, &task_prefix, &manifest("c.txt"), "/mnt/two", Some("Loc"))
            .await
            .unwrap();

        let scope: OutputManifestScope = OutputManifestScope::job("farm-1", "queue-1", "job-1");
        let outputs: BTreeMap<String, Vec<AssetManifest>> =
            get_output_manifests_by_asset_root(&client, &settings, &scope).await.unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["/mnt/one"].len(), 2);
        assert_eq!(outputs["/mnt/two"][0].paths()[0].path, "c.txt");
    }

    #[tokio::test]
    async fn test_missing_asset_root_metadata_is_an_error() {
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let key: String = "Root/Manifests/farm-1/queue-1/job-1/step-1/task-1/s_sessionaction-1/h_output".into();
        client.insert_object(BUCKET, &key, manifest("a.txt").encode().unwrap().into_bytes());

        let scope: OutputManifestScope = OutputManifestScope::job("farm-1", "queue-1", "job-1");
        let err: StorageError = get_output_manifests_by_asset_root(&client, &settings(), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingAssetRoot { key: k } if k == key));
    }

    #[tokio::test]
    async fn test_empty_listing_yields_no_outputs() {
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let scope: OutputManifestScope = OutputManifestScope::job("farm-1", "queue-1", "job-1");

        let outputs: BTreeMap<String, Vec<AssetManifest>> =
            get_output_manifests_by_asset_root(&client, &settings(), &scope).await.unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_discover_on_empty_prefix_is_an_error() {
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let scope: OutputManifestScope = OutputManifestScope::job("farm-1", "queue-1", "job-1");

        let err: StorageError = discover_output_manifest_keys(&client, &settings(), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NoManifestsFound { .. }));
        assert_eq!(
            err.to_string(),
            "Unable to find asset manifest in s3://bucket/Root/Manifests/farm-1/queue-1/job-1/"
        );
    }
}
