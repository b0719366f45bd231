//! Rejected submissions end up preserved in quarantine.

use std::fs::File;
use std::path::{Path, PathBuf};

use skillhost::config::{ArchiveLimits, PathsConfig};
use skillhost::store::gate::ManifestValidator;
use skillhost::store::{quarantine, SkillStore, StoreError};

fn pack_archive(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).expect("create archive");
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (member, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(u64::try_from(contents.len()).expect("member size"));
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, member, contents.as_bytes())
            .expect("append member");
    }
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .expect("finish archive");
    path
}

fn store_at(data_dir: &Path) -> (SkillStore, PathsConfig) {
    let paths = PathsConfig {
        data_dir: data_dir.to_path_buf(),
    };
    paths.ensure_layout().expect("layout");
    let store = SkillStore::new(
        paths.clone(),
        Box::new(ManifestValidator::new(ArchiveLimits::default())),
    );
    (store, paths)
}

#[tokio::test]
async fn rejected_archive_is_preserved_with_its_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let manifest = serde_json::json!({
        "id": "grabber",
        "name": "Grabber",
        "version": "1.0",
        "permissions": ["root_shell"],
        "entry": "skill.py",
    })
    .to_string();
    let archive = pack_archive(
        dir.path(),
        "grabber.tar.gz",
        &[("manifest.json", manifest.as_str()), ("skill.py", "pass")],
    );

    let staged = store
        .stage(&archive, "grabber.tar.gz", "stranger")
        .expect("stage");
    let err = store.validate_and_install(&staged).expect_err("rejected");
    let StoreError::Quarantined(record) = err else {
        panic!("expected quarantine, got {err}");
    };

    assert_eq!(record.skill_id, "grabber");
    assert!(record.location.starts_with(paths.quarantine_dir()));
    assert!(record.location.join("original.tar.gz").is_file());
    assert!(record.location.join("safety_report.json").is_file());
    assert!(record
        .reasons
        .iter()
        .any(|r| r.contains("unknown permission")));

    // Nothing from the rejected archive reached the live directory.
    assert!(store.list().expect("list").is_empty());
    assert!(!staged.exists());

    let listed = quarantine::list_quarantined(&paths.quarantine_dir()).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].skill_id, "grabber");
}

#[tokio::test]
async fn archive_without_manifest_is_quarantined_as_unknown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let archive = pack_archive(
        dir.path(),
        "mystery.tar.gz",
        &[("skill.py", "print('?')"), ("data.txt", "junk")],
    );
    let staged = store
        .stage(&archive, "mystery.tar.gz", "stranger")
        .expect("stage");
    let err = store.validate_and_install(&staged).expect_err("rejected");
    let StoreError::Quarantined(record) = err else {
        panic!("expected quarantine, got {err}");
    };
    assert_eq!(record.skill_id, "unknown");
    assert!(record
        .location
        .starts_with(paths.quarantine_dir().join("unknown")));
}

#[tokio::test]
async fn repeat_rejections_get_distinct_quarantine_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let manifest = serde_json::json!({
        "id": "repeat",
        "name": "Repeat",
        "version": "1.0",
        "permissions": ["root_shell"],
        "entry": "skill.py",
    })
    .to_string();

    let mut locations = Vec::new();
    for _ in 0..2 {
        let archive = pack_archive(
            dir.path(),
            "repeat.tar.gz",
            &[("manifest.json", manifest.as_str()), ("skill.py", "pass")],
        );
        let staged = store
            .stage(&archive, "repeat.tar.gz", "stranger")
            .expect("stage");
        let err = store.validate_and_install(&staged).expect_err("rejected");
        let StoreError::Quarantined(record) = err else {
            panic!("expected quarantine, got {err}");
        };
        locations.push(record.location);
    }

    assert_ne!(locations[0], locations[1]);
    let listed = quarantine::list_quarantined(&paths.quarantine_dir()).expect("list");
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.skill_id == "repeat"));
}

#[tokio::test]
async fn oversized_archive_is_rejected_unopened() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = PathsConfig {
        data_dir: dir.path().to_path_buf(),
    };
    paths.ensure_layout().expect("layout");
    let limits = ArchiveLimits {
        max_archive_mb: 0,
        ..ArchiveLimits::default()
    };
    let store = SkillStore::new(paths, Box::new(ManifestValidator::new(limits)));

    let archive = pack_archive(dir.path(), "big.tar.gz", &[("skill.py", "pass")]);
    let staged = store.stage(&archive, "big.tar.gz", "dev").expect("stage");
    let err = store.validate_and_install(&staged).expect_err("rejected");
    let StoreError::Quarantined(record) = err else {
        panic!("expected quarantine, got {err}");
    };
    assert!(record.reasons.iter().any(|r| r.contains("archive size")));
}
