//! Unit tests for directory artifact storage and metadata handling.

use std::io::Write;
use std::sync::Arc;
use std::thread;

use camino::Utf8PathBuf;
use chrono::TimeZone;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{sha256_hex, tar_with_files};

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn artifact_path(&self) -> Utf8PathBuf {
        self.root.join("backup")
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().expect("create temp dir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 temp path");
    Workspace { _tmp: tmp, root }
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .expect("valid start time")
}

fn redis(index: &str) -> ArtifactIdentifier {
    ArtifactIdentifier::indexed("redis", index)
}

fn write_blob(artifact: &DirectoryArtifact, identifier: &ArtifactIdentifier, files: &[(&str, &str)]) {
    let mut file = artifact.create_file(identifier).expect("create blob file");
    file.write_all(&tar_with_files(files)).expect("write blob");
}

fn backed_up(workspace: &Workspace) -> DirectoryArtifact {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    artifact
        .create_metadata_with_start_time(start_time())
        .expect("create metadata");
    for (identifier, contents) in [(redis("0"), "zero"), (ArtifactIdentifier::named("shared"), "both")] {
        write_blob(&artifact, &identifier, &[("data", contents)]);
        let checksum = artifact.calculate_checksum(&identifier).expect("checksum");
        artifact.add_checksum(&identifier, checksum).expect("add checksum");
    }
    artifact
}

#[rstest]
fn create_refuses_existing_path(workspace: Workspace) {
    std::fs::create_dir(workspace.artifact_path()).expect("pre-create directory");

    let err = DirectoryArtifact::create(&workspace.artifact_path()).expect_err("should refuse");

    assert_eq!(
        err,
        ArtifactError::AlreadyExists {
            path: workspace.artifact_path()
        }
    );
}

#[rstest]
fn open_missing_directory_fails(workspace: Workspace) {
    let err = DirectoryArtifact::open(&workspace.artifact_path()).expect_err("should fail");
    assert!(matches!(err, ArtifactError::Io { .. }), "unexpected error: {err:?}");
    assert!(!DirectoryArtifact::exists(&workspace.artifact_path()));
}

#[rstest]
fn metadata_creation_is_write_once(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    artifact
        .create_metadata_with_start_time(start_time())
        .expect("first creation succeeds");

    let err = artifact
        .create_metadata_with_start_time(start_time())
        .expect_err("second creation fails");

    assert_eq!(err, ArtifactError::MetadataExists);
}

#[rstest]
fn metadata_records_formatted_timestamps(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    artifact
        .create_metadata_with_start_time(start_time())
        .expect("create metadata");
    let finish = Utc
        .with_ymd_and_hms(2024, 3, 1, 12, 5, 9)
        .single()
        .expect("valid finish time");
    artifact.add_finish_time(finish).expect("add finish time");

    let activity = artifact.metadata().expect("read metadata").backup_activity;

    assert_eq!(activity.start_time.as_deref(), Some("2024/03/01 12:00:00 UTC"));
    assert_eq!(activity.finish_time.as_deref(), Some("2024/03/01 12:05:09 UTC"));
}

#[rstest]
fn amending_requires_existing_metadata(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");

    assert_eq!(
        artifact.add_finish_time(start_time()),
        Err(ArtifactError::MetadataMissing)
    );
    assert_eq!(
        artifact.add_checksum(&redis("0"), BackupChecksum::new()),
        Err(ArtifactError::MetadataMissing)
    );
}

#[rstest]
fn checksums_land_in_the_matching_section(workspace: Workspace) {
    let artifact = backed_up(&workspace);

    let metadata = artifact.metadata().expect("read metadata");

    assert_eq!(metadata.instances.len(), 1);
    assert_eq!(metadata.blobs.len(), 1);
    assert_eq!(
        metadata.instances.first().map(|record| record.instance_index.as_str()),
        Some("0")
    );
    assert_eq!(
        metadata.blobs.first().map(|record| record.blob_name.as_str()),
        Some("shared")
    );
}

#[rstest]
fn duplicate_checksum_is_rejected(workspace: Workspace) {
    let artifact = backed_up(&workspace);

    let err = artifact
        .add_checksum(&redis("0"), BackupChecksum::new())
        .expect_err("duplicate should fail");

    assert_eq!(err, ArtifactError::DuplicateEntry { identifier: redis("0") });
}

#[rstest]
fn fetch_checksum_returns_none_when_absent(workspace: Workspace) {
    let artifact = backed_up(&workspace);

    assert!(artifact.fetch_checksum(&redis("0")).expect("fetch").is_some());
    assert!(artifact.fetch_checksum(&redis("9")).expect("fetch").is_none());
    assert!(
        artifact
            .fetch_checksum(&ArtifactIdentifier::named("redis"))
            .expect("fetch")
            .is_none(),
        "named lookup must not match an instance record"
    );
}

#[rstest]
fn concurrent_checksum_appends_are_serialised(workspace: Workspace) {
    let artifact = Arc::new(
        DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact"),
    );
    artifact
        .create_metadata_with_start_time(start_time())
        .expect("create metadata");

    let handles: Vec<_> = (0..16)
        .map(|index| {
            let shared = Arc::clone(&artifact);
            thread::spawn(move || {
                let mut checksum = BackupChecksum::new();
                checksum.insert("data", format!("digest-{index}"));
                shared.add_checksum(&redis(&index.to_string()), checksum)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker").expect("append checksum");
    }

    assert_eq!(artifact.instance_identifiers().expect("identifiers").len(), 16);
}

#[rstest]
fn valid_artifact_passes_validation(workspace: Workspace) {
    let artifact = backed_up(&workspace);
    assert!(artifact.valid().expect("validation should run"));
}

#[rstest]
#[case::altered(&[("data", "tampered")])]
#[case::added(&[("data", "zero"), ("extra", "file")])]
#[case::removed(&[])]
fn tampered_blob_fails_validation(workspace: Workspace, #[case] files: &[(&str, &str)]) {
    let artifact = backed_up(&workspace);
    write_blob(&artifact, &redis("0"), files);

    assert!(!artifact.valid().expect("validation should run"));
}

#[rstest]
fn missing_blob_file_fails_validation(workspace: Workspace) {
    let artifact = backed_up(&workspace);
    std::fs::remove_file(workspace.artifact_path().join("shared.tar")).expect("remove blob");

    assert!(!artifact.valid().expect("validation should run"));
}

#[rstest]
fn unreadable_metadata_is_an_error(workspace: Workspace) {
    let artifact = backed_up(&workspace);
    std::fs::write(workspace.artifact_path().join(METADATA_FILE), "instances: {oops")
        .expect("corrupt metadata");

    let result = artifact.valid();

    assert!(
        matches!(result, Err(ArtifactError::MetadataParse { .. })),
        "unexpected result: {result:?}"
    );
}

#[rstest]
fn metadata_accepts_numeric_instance_index(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    std::fs::write(
        workspace.artifact_path().join(METADATA_FILE),
        "backup_activity:\n  start_time: 2024/03/01 12:00:00 UTC\ninstances:\n- instance_name: redis\n  instance_index: 0\n  checksums:\n    data: abc\n",
    )
    .expect("write metadata");

    assert_eq!(artifact.instance_identifiers().expect("identifiers"), [redis("0")]);
}

#[rstest]
fn metadata_with_dot_slash_keys_still_validates(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    write_blob(&artifact, &redis("0"), &[("data", "zero")]);
    std::fs::write(
        workspace.artifact_path().join(METADATA_FILE),
        format!(
            "backup_activity:\n  start_time: 2024/03/01 12:00:00 UTC\ninstances:\n- instance_name: redis\n  instance_index: \"0\"\n  checksums:\n    ./data: {}\n",
            sha256_hex("zero")
        ),
    )
    .expect("write metadata");

    assert!(artifact.valid().expect("validation should run"));
}

#[rstest]
#[case::exact(vec![redis("0"), redis("1")], true)]
#[case::reordered(vec![redis("1"), redis("0")], true)]
#[case::missing(vec![redis("0")], false)]
#[case::extra(vec![redis("0"), redis("1"), redis("2")], false)]
fn deployment_matches_compares_instance_sets(
    workspace: Workspace,
    #[case] supplied: Vec<ArtifactIdentifier>,
    #[case] expected: bool,
) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    artifact
        .create_metadata_with_start_time(start_time())
        .expect("create metadata");
    for index in ["0", "1"] {
        artifact
            .add_checksum(&redis(index), BackupChecksum::new())
            .expect("add checksum");
    }

    assert_eq!(artifact.deployment_matches(&supplied).expect("compare"), expected);
}

#[rstest]
fn manifest_is_write_once(workspace: Workspace) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");
    artifact.save_manifest("name: redis\n").expect("save manifest");

    assert_eq!(artifact.save_manifest("name: other\n"), Err(ArtifactError::ManifestExists));
    assert_eq!(artifact.manifest().expect("read manifest"), "name: redis\n");
}

#[rstest]
#[case(ArtifactIdentifier::named("../escape"))]
#[case(ArtifactIdentifier::indexed("redis", "0/1"))]
#[case(ArtifactIdentifier::named(""))]
fn identifiers_that_leave_the_directory_are_rejected(
    workspace: Workspace,
    #[case] identifier: ArtifactIdentifier,
) {
    let artifact = DirectoryArtifact::create(&workspace.artifact_path()).expect("create artifact");

    let err = artifact.create_file(&identifier).expect_err("should reject");

    assert!(matches!(err, ArtifactError::InvalidIdentifier { .. }), "unexpected error: {err:?}");
}

#[rstest]
fn blob_files_are_named_after_identifiers(workspace: Workspace) {
    backed_up(&workspace);
    assert!(workspace.artifact_path().join("redis-0.tar").is_file());
    assert!(workspace.artifact_path().join("shared.tar").is_file());
}
