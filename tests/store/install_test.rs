//! Staging, validation, and promotion of skill packages.

use std::fs::File;
use std::path::{Path, PathBuf};

use skillhost::config::{ArchiveLimits, PathsConfig};
use skillhost::store::gate::ManifestValidator;
use skillhost::store::{SkillStore, StoreError};

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

fn manifest_json(id: &str, version: &str) -> String {
    serde_json::json!({
        "id": id,
        "name": format!("{id} skill"),
        "version": version,
        "permissions": ["fs_read"],
        "entry": "skill.py",
    })
    .to_string()
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
async fn archive_flows_from_staging_to_live() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let manifest = manifest_json("weather", "1.0.0");
    let archive = pack_archive(
        dir.path(),
        "weather.tar.gz",
        &[
            ("manifest.json", manifest.as_str()),
            ("skill.py", "print('forecast')"),
        ],
    );

    let staged = store
        .stage(&archive, "weather.tar.gz", "chat42")
        .expect("stage");
    assert!(staged.starts_with(paths.staging_dir().join("chat42")));

    let descriptor = store.validate_and_install(&staged).expect("install");
    assert_eq!(descriptor.id, "weather");
    assert!(descriptor.source.is_file());

    // The staged archive is consumed, the live and user copies exist.
    assert!(!staged.exists());
    assert!(paths.live_dir().join("weather/manifest.json").is_file());
    assert!(paths.user_skills_dir().join("weather/skill.py").is_file());
}

#[tokio::test]
async fn reinstall_replaces_the_prior_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _paths) = store_at(dir.path());

    for version in ["1.0.0", "2.0.0"] {
        let manifest = manifest_json("notes", version);
        let archive = pack_archive(
            dir.path(),
            "notes.tar.gz",
            &[
                ("manifest.json", manifest.as_str()),
                ("skill.py", "print('notes')"),
            ],
        );
        let staged = store.stage(&archive, "notes.tar.gz", "dev").expect("stage");
        store.validate_and_install(&staged).expect("install");
    }

    let skills = store.list().expect("list");
    assert_eq!(skills.len(), 1);
    assert_eq!(skills[0].version, "2.0.0");
}

#[tokio::test]
async fn prepared_dir_install_validates_the_manifest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _paths) = store_at(dir.path());

    let prepared = dir.path().join("devskill");
    std::fs::create_dir_all(&prepared).expect("mkdir");
    std::fs::write(prepared.join("manifest.json"), manifest_json("dev", "0.1")).expect("write");
    std::fs::write(prepared.join("skill.py"), "print('dev')").expect("write");

    let descriptor = store.install_from_prepared_dir(&prepared).expect("install");
    assert_eq!(descriptor.id, "dev");
    // The source directory is left in place.
    assert!(prepared.join("skill.py").is_file());

    // A broken manifest fails without creating a quarantine record.
    let broken = dir.path().join("broken");
    std::fs::create_dir_all(&broken).expect("mkdir");
    std::fs::write(broken.join("manifest.json"), "{\"id\": \"\"}").expect("write");
    let err = store
        .install_from_prepared_dir(&broken)
        .expect_err("invalid");
    assert!(matches!(err, StoreError::Manifest(_)));
}

#[tokio::test]
async fn delete_removes_live_and_user_copies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let prepared = dir.path().join("gone");
    std::fs::create_dir_all(&prepared).expect("mkdir");
    std::fs::write(prepared.join("manifest.json"), manifest_json("gone", "1.0"))
        .expect("write");
    std::fs::write(prepared.join("skill.py"), "pass").expect("write");
    store.install_from_prepared_dir(&prepared).expect("install");

    store.delete("gone").expect("delete");
    assert!(!paths.live_dir().join("gone").exists());
    assert!(!paths.user_skills_dir().join("gone").exists());
    assert!(matches!(
        store.delete("gone").expect_err("already gone"),
        StoreError::UnknownSkill(_)
    ));
}

#[tokio::test]
async fn resolution_prefers_live_over_builtin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, paths) = store_at(dir.path());

    let builtin = paths.builtin_skills_dir().join("clock");
    std::fs::create_dir_all(&builtin).expect("mkdir");
    std::fs::write(builtin.join("manifest.json"), manifest_json("clock", "0.9"))
        .expect("write");
    std::fs::write(builtin.join("skill.py"), "pass").expect("write");
    assert_eq!(store.resolve("clock"), Some(builtin.clone()));

    let prepared = dir.path().join("clock");
    std::fs::create_dir_all(&prepared).expect("mkdir");
    std::fs::write(prepared.join("manifest.json"), manifest_json("clock", "1.0"))
        .expect("write");
    std::fs::write(prepared.join("skill.py"), "pass").expect("write");
    store.install_from_prepared_dir(&prepared).expect("install");

    assert_eq!(store.resolve("clock"), Some(paths.live_dir().join("clock")));
}
