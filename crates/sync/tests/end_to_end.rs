//! Submit a job, run one session action on a worker, then fetch its outputs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ja_common::SummaryStatistics;
use ja_filesystem::modified_time_us;
use ja_model::{AssetManifest, Attachments, ManifestPath};
use ja_profiles::{AssetRootManifest, AssetUploadGroup, FileSystemLocation, StorageProfile};
use ja_storage::{
    download_manifest, ConflictResolution, JobAttachmentSettings, MemoryStorageClient,
    OutputDownloader, OutputManifestScope,
};
use ja_sync::{unique_dest_dir_name, AssetManager, AssetSync, SessionAction, SyncInputsOptions};
use tempfile::TempDir;

const BUCKET: &str = "e2e-bucket";
const FARM: &str = "farm-e2e";
const QUEUE: &str = "queue-e2e";
const JOB: &str = "job-e2e";

fn write(path: &Path, content: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

#[tokio::test]
async fn test_inputs_and_outputs_round_trip_through_a_session() {
    let client: MemoryStorageClient = MemoryStorageClient::new();
    let settings: JobAttachmentSettings = JobAttachmentSettings::new(BUCKET, "DeadlineCloud");

    // Submitter.
    let project: TempDir = TempDir::new().unwrap();
    let inputs: Vec<PathBuf> = ["scene/a.txt", "scene/b.txt", "scene/tex/c.txt", "d.txt"]
        .iter()
        .zip([b"a", b"b", b"c", b"d"])
        .map(|(name, content)| {
            let path: PathBuf = project.path().join(name);
            write(&path, content);
            path
        })
        .collect();
    let profile: StorageProfile = StorageProfile::with_locations(vec![FileSystemLocation::local(
        "ProjectFiles",
        project.path().to_str().unwrap(),
    )]);

    let manager = AssetManager::new(&client, FARM, QUEUE, settings.clone()).unwrap();
    let group: AssetUploadGroup = manager
        .prepare_paths_for_upload(
            &inputs,
            &[project.path().join("renders")],
            &[],
            Some(&profile),
            true,
        )
        .unwrap();
    let (_, manifests): (SummaryStatistics, Vec<AssetRootManifest>) = manager
        .hash_assets_and_create_manifest(
            &group.asset_groups,
            group.total_input_files,
            group.total_input_bytes,
            None,
        )
        .await
        .unwrap();
    let (upload_stats, attachments): (SummaryStatistics, Attachments) =
        manager.upload_assets(&manifests, None, None).await.unwrap();

    assert_eq!(upload_stats.processed_files, 4);
    assert_eq!(attachments.manifests.len(), 1);
    let root_path: String = attachments.manifests[0].root_path.clone();
    assert_eq!(root_path, project.path().display().to_string());
    assert_eq!(
        attachments.manifests[0].output_relative_directories,
        Some(vec!["renders".to_string()])
    );

    // Worker: inputs.
    let session: TempDir = TempDir::new().unwrap();
    let mut sync: AssetSync<'_, MemoryStorageClient> = AssetSync::new(&client, FARM, "us-west-2");
    let (download_stats, rules) = sync
        .sync_inputs(
            Some(&settings),
            Some(&attachments),
            QUEUE,
            JOB,
            session.path(),
            &SyncInputsOptions::default(),
            None,
        )
        .await
        .unwrap();

    let local_root: PathBuf = session.path().join(unique_dest_dir_name(&root_path));
    assert_eq!(download_stats.processed_files, 4);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].source_path, root_path);
    assert_eq!(std::fs::read(local_root.join("scene/tex/c.txt")).unwrap(), b"c");
    assert_eq!(std::fs::read(local_root.join("d.txt")).unwrap(), b"d");

    let input_manifest_key: String = settings
        .add_root_and_manifest_folder_prefix(
            attachments.manifests[0].input_manifest_path.as_deref().unwrap(),
        )
        .unwrap();
    let input_manifest: AssetManifest =
        download_manifest(&client, BUCKET, &input_manifest_key).await.unwrap();
    assert_eq!(input_manifest.paths().len(), 4);
    for entry in input_manifest.paths() {
        let local_path: PathBuf = local_root.join(&entry.path);
        let mtime_us: i64 = modified_time_us(&std::fs::metadata(&local_path).unwrap()).unwrap();
        assert_eq!(mtime_us, entry.mtime, "{}", entry.path);
    }

    // Worker: the session action writes its outputs.
    let action: SessionAction = SessionAction {
        queue_id: QUEUE.into(),
        job_id: JOB.into(),
        step_id: "step-e2e".into(),
        task_id: "task-e2e".into(),
        session_action_id: "sessionaction-e2e-0".into(),
        start_time: now_secs() - 1.0,
    };
    let outputs: [(&str, &[u8]); 4] = [
        ("renders/frame_1.png", b"frame one"),
        ("renders/frame_2.png", b"frame two"),
        ("renders/passes/depth_1.exr", b"depth one"),
        ("renders/passes/depth_2.exr", b"depth two"),
    ];
    for (name, content) in outputs {
        write(&local_root.join(name), content);
    }

    let output_stats: SummaryStatistics = sync
        .sync_outputs(
            Some(&settings),
            Some(&attachments),
            &action,
            session.path(),
            &HashMap::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(output_stats.processed_files, 4);
    assert_eq!(output_stats.processed_bytes, 36);

    // Submitter: fetch the session action's outputs into a new directory.
    let scope: OutputManifestScope = OutputManifestScope::job(FARM, QUEUE, JOB)
        .with_step("step-e2e")
        .with_task("task-e2e")
        .with_session_action("sessionaction-e2e-0");
    let mut downloader = OutputDownloader::new(&client, settings.clone(), &scope)
        .await
        .unwrap();
    let mut paths_by_root = downloader.get_output_paths_by_root();
    let mut output_paths: Vec<String> = paths_by_root.remove(&root_path).unwrap();
    output_paths.sort();
    assert_eq!(
        output_paths,
        vec![
            "renders/frame_1.png",
            "renders/frame_2.png",
            "renders/passes/depth_1.exr",
            "renders/passes/depth_2.exr",
        ]
    );

    let destination: TempDir = TempDir::new().unwrap();
    let destination_root: String = destination.path().display().to_string();
    downloader.set_root_path(&root_path, &destination_root).unwrap();
    let fetched = downloader
        .download_job_output(ConflictResolution::CreateCopy, None)
        .await
        .unwrap();
    assert_eq!(fetched.summary.processed_files, 4);

    let output_manifest_key: String = client
        .keys(BUCKET)
        .into_iter()
        .find(|k| k.ends_with("_output"))
        .unwrap();
    let output_manifest: AssetManifest =
        download_manifest(&client, BUCKET, &output_manifest_key).await.unwrap();
    for (name, content) in outputs {
        let fetched_path: PathBuf = destination.path().join(name);
        assert_eq!(std::fs::read(&fetched_path).unwrap(), content);

        let entry: &ManifestPath = output_manifest
            .paths()
            .iter()
            .find(|p| p.path == name)
            .unwrap();
        let mtime_us: i64 = modified_time_us(&std::fs::metadata(&fetched_path).unwrap()).unwrap();
        assert_eq!(mtime_us, entry.mtime);
    }
}
