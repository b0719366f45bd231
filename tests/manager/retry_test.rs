//! Failed executions can be replayed through the bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skillhost::bus::EventBus;
use skillhost::config::{ArchiveLimits, PathsConfig, RuntimeConfig, VaultLimits};
use skillhost::manager::sandbox::EnvPolicy;
use skillhost::manager::{
    LifecycleManager, ManagerError, RESULT_TOPIC, RETRY_AVAILABLE_TOPIC, RETRY_REQUEST_TOPIC,
};
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

/// Fails on the first run, succeeds once a marker file exists.
fn install_flaky(store: &SkillStore, dir: &Path) {
    let skill_dir = dir.join("prepared").join("flaky");
    std::fs::create_dir_all(&skill_dir).expect("mkdir");
    let manifest = serde_json::json!({
        "id": "flaky",
        "name": "flaky",
        "version": "1.0",
        "permissions": [],
        "entry": "skill.sh",
    });
    let marker = dir.join("marker");
    let script = format!(
        concat!(
            "#!/bin/sh\n",
            "if [ -f \"{marker}\" ]; then\n",
            "  printf '{{\"session_id\":\"'\"$SKILLHOST_SESSION\"'\",",
            "\"skill\":\"flaky\",\"success\":true,\"result\":{{\"attempt\":2}}}}\\n'\n",
            "else\n",
            "  touch \"{marker}\"\n",
            "  printf '{{\"session_id\":\"'\"$SKILLHOST_SESSION\"'\",",
            "\"skill\":\"flaky\",\"success\":false,\"error\":\"first attempt\"}}\\n'\n",
            "fi\n",
        ),
        marker = marker.display()
    );
    std::fs::write(skill_dir.join("manifest.json"), manifest.to_string()).expect("manifest");
    std::fs::write(skill_dir.join("skill.sh"), script).expect("entry");
    store
        .install_from_prepared_dir(&skill_dir)
        .expect("install");
}

#[tokio::test]
async fn failure_registers_a_retry_under_its_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, bus) = host_at(dir.path()).await;
    install_flaky(&store, dir.path());

    let result = manager
        .use_and_kill("flaky", SkillContext::for_task("go", "alice"), None)
        .await;
    assert!(!result.success);

    let retries = manager.pending_retries().await;
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].0, result.session_id);
    assert_eq!(retries[0].1, "flaky");

    let announcement = bus
        .recent(50)
        .await
        .into_iter()
        .find(|e| e.topic == RETRY_AVAILABLE_TOPIC)
        .expect("retry announced");
    assert_eq!(announcement.payload["session_id"], result.session_id.as_str());
    assert_eq!(announcement.payload["skill_id"], "flaky");
    assert_eq!(announcement.payload["original_error"], "first attempt");
    assert!(announcement.payload["timestamp"].is_string());
}

#[tokio::test]
async fn retry_replays_with_the_original_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, _bus) = host_at(dir.path()).await;
    install_flaky(&store, dir.path());

    let result = manager
        .use_and_kill("flaky", SkillContext::for_task("go", "alice"), None)
        .await;
    assert!(!result.success);

    let (session, _) = manager.pending_retries().await.remove(0);
    let replay = manager.retry(&session).await.expect("replay");
    assert!(replay.success);
    assert_eq!(replay.result, Some(serde_json::json!({"attempt": 2})));

    // A retry entry is consumed by its replay.
    assert!(matches!(
        manager.retry(&session).await.expect_err("consumed"),
        ManagerError::UnknownRetry(_)
    ));
}

#[tokio::test]
async fn retry_request_event_triggers_a_replay() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store, bus) = host_at(dir.path()).await;
    install_flaky(&store, dir.path());

    let result = manager
        .use_and_kill("flaky", SkillContext::for_task("go", "alice"), None)
        .await;
    assert!(!result.success);
    let (session, _) = manager.pending_retries().await.remove(0);

    bus.publish(
        RETRY_REQUEST_TOPIC,
        serde_json::json!({ "session_id": session }),
        "test",
    )
    .await;

    // The replay runs detached; poll the bus for its result event.
    let deadline = tokio::time::Instant::now()
        .checked_add(Duration::from_secs(10))
        .unwrap_or_else(tokio::time::Instant::now);
    loop {
        let replayed = bus
            .recent(100)
            .await
            .into_iter()
            .filter(|e| e.topic == RESULT_TOPIC)
            .any(|e| e.payload["success"] == serde_json::json!(true));
        if replayed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replay never produced a result event"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(manager.pending_retries().await.is_empty());
}
