//! Kill semantics: escalation, idempotence, cleanup.

use std::path::Path;
use std::sync::Arc;

use skillhost::bus::EventBus;
use skillhost::config::{ArchiveLimits, PathsConfig, RuntimeConfig, VaultLimits};
use skillhost::manager::sandbox::EnvPolicy;
use skillhost::manager::{LifecycleManager, KILLED_TOPIC};
use skillhost::skill::SkillContext;
use skillhost::store::gate::ManifestValidator;
use skillhost::store::SkillStore;
use skillhost::vault::CredentialVault;

async fn host_at(data_dir: &Path) -> (Arc<LifecycleManager>, Arc<SkillStore>, Arc<EventBus>) {
    let paths = PathsConfig {
        data_dir: data_dir.to_path_buf(),
    };
    paths.ensure_layout().expect("layout");
    let store = Arc::new(SkillStore::new(
        paths.clone(),
        Box::new(ManifestValidator::new(ArchiveLimits::default())),
    ));
    let bus = Arc::new(EventBus::new());
    let vault = CredentialVault::new(Arc::clone(&bus), VaultLimits::default());
    let runtime = RuntimeConfig {
        program: "sh".to_owned(),
        wait_ceiling_seconds: 10,
        kill_grace_seconds: 1,
        ..RuntimeConfig::default()
    };
    let manager = LifecycleManager::new(
        Arc::clone(&store),
        vault,
        Arc::clone(&bus),
        runtime,
        paths.sandbox_dir(),
        EnvPolicy::default(),
    )
    .await;
    (manager, store, bus)
}

fn install_sleeper(store: &SkillStore, dir: &Path, id: &str) {
    let skill_dir = dir.join("prepared").join(id);
    std::fs::create_dir_all(&skill_dir).expect("mkdir");
    let manifest = serde_json::json!({
        "id": id,
        "name": id,
        "version": "1.0",
        "permissions": [],
        "entry": "skill.sh",
    });
    std::fs::write(skill_dir.join("manifest.json"), manifest.to_string()).expect("manifest");
    std::fs::write(skill_dir.join("skill.sh"), "#!/bin/sh\nsleep 600\n").expect("entry");
    store
        .install_from_prepared_dir(&skill_dir)
        .expect("install");
}

#[tokio::test]
async fn concurrent_kills_yield_one_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, bus) = host_at(dir.path()).await;
    install_sleeper(&store, dir.path(), "sleeper");

    let handle = manager
        .spawn("sleeper", SkillContext::for_task("nap", "alice"))
        .await
        .expect("spawn");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let session = handle.session_id.clone();
        tasks.push(tokio::spawn(async move { manager.kill(&session).await }));
    }
    let mut winners = 0_usize;
    for task in tasks {
        if task.await.expect("join") {
            winners = winners.saturating_add(1);
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(bus.topic_count(KILLED_TOPIC).await, 1);
    assert!(manager.list_active().await.is_empty());
}

#[tokio::test]
async fn kill_of_unknown_session_is_a_safe_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store, bus) = host_at(dir.path()).await;

    assert!(!manager.kill("never_existed").await);
    assert_eq!(bus.topic_count(KILLED_TOPIC).await, 0);
}

#[tokio::test]
async fn kill_scrubs_the_context_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, _bus) = host_at(dir.path()).await;
    install_sleeper(&store, dir.path(), "sleeper");

    let handle = manager
        .spawn("sleeper", SkillContext::for_task("nap", "alice"))
        .await
        .expect("spawn");

    let paths = PathsConfig {
        data_dir: dir.path().to_path_buf(),
    };
    let context_file = paths
        .sandbox_dir()
        .join(&handle.session_id)
        .join("context.json");
    assert!(context_file.is_file());

    assert!(manager.kill(&handle.session_id).await);
    assert!(!context_file.exists());
}

#[tokio::test]
async fn kill_all_clears_every_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, _bus) = host_at(dir.path()).await;
    install_sleeper(&store, dir.path(), "sleeper");

    for _ in 0..3 {
        manager
            .spawn("sleeper", SkillContext::for_task("nap", "alice"))
            .await
            .expect("spawn");
    }
    assert_eq!(manager.list_active().await.len(), 3);
    assert_eq!(manager.kill_all().await, 3);
    assert!(manager.list_active().await.is_empty());
}
