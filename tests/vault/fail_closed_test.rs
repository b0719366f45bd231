//! Every ambiguous access path must deny.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use skillhost::bus::EventBus;
use skillhost::config::VaultLimits;
use skillhost::vault::{CredentialDenied, CredentialVault, CREDENTIAL_EVENT_TOPIC};

fn creds() -> HashMap<String, String> {
    HashMap::from([
        ("api_key".to_owned(), "sk-123456".to_owned()),
        ("account".to_owned(), "alice".to_owned()),
    ])
}

#[tokio::test]
async fn unknown_session_is_denied() {
    let bus = Arc::new(EventBus::new());
    let vault = CredentialVault::new(bus, VaultLimits::default());
    let denial = vault
        .get("nope_123_abcd", "s1", "u1")
        .await
        .expect_err("denied");
    assert_eq!(denial, CredentialDenied::NotFound);
    assert_eq!(denial.event_type(), "failed");
}

#[tokio::test]
async fn wrong_skill_id_never_reveals_credentials() {
    let bus = Arc::new(EventBus::new());
    let vault = CredentialVault::new(bus, VaultLimits::default());
    let session = vault.store("owner", creds(), Duration::from_secs(60)).await;

    let denial = vault
        .get(&session, "impostor", "u1")
        .await
        .expect_err("denied");
    assert_eq!(denial, CredentialDenied::SkillMismatch);
    // The rightful skill can still redeem after a single mismatch.
    assert!(vault.get(&session, "owner", "u1").await.is_ok());
}

#[tokio::test]
async fn blocked_session_is_denied_even_when_otherwise_valid() {
    let bus = Arc::new(EventBus::new());
    let vault = CredentialVault::new(Arc::clone(&bus), VaultLimits::default());
    let session = vault.store("owner", creds(), Duration::from_secs(60)).await;

    for _ in 0..3 {
        let _ = vault.get(&session, "impostor", "u1").await;
    }

    // Session id, skill id, and TTL are all fine; the block wins anyway.
    assert!(matches!(
        vault.get(&session, "owner", "u1").await.expect_err("denied"),
        CredentialDenied::Blocked(_)
    ));

    let blocked_events = bus
        .recent(50)
        .await
        .into_iter()
        .filter(|e| {
            e.topic == CREDENTIAL_EVENT_TOPIC && e.payload["event_type"] == "blocked"
        })
        .count();
    assert!(blocked_events >= 1);
}

#[tokio::test]
async fn access_limit_erases_the_set() {
    let bus = Arc::new(EventBus::new());
    let limits = VaultLimits {
        max_access_count: 1,
        ..VaultLimits::default()
    };
    let vault = CredentialVault::new(Arc::clone(&bus), limits);
    let session = vault.store("owner", creds(), Duration::from_secs(60)).await;

    assert!(vault.get(&session, "owner", "u1").await.is_ok());
    assert_eq!(
        vault.get(&session, "owner", "u1").await.expect_err("denied"),
        CredentialDenied::LimitReached(1)
    );
    // Erased, so further attempts cannot even find the session.
    assert_eq!(
        vault.get(&session, "owner", "u1").await.expect_err("denied"),
        CredentialDenied::NotFound
    );

    let limit_events = bus
        .recent(50)
        .await
        .into_iter()
        .filter(|e| e.payload["event_type"] == "limit_reached")
        .count();
    assert_eq!(limit_events, 1);
}

#[tokio::test]
async fn every_access_emits_a_notification() {
    let bus = Arc::new(EventBus::new());
    let vault = CredentialVault::new(Arc::clone(&bus), VaultLimits::default());
    let session = vault.store("owner", creds(), Duration::from_secs(60)).await;

    vault.get(&session, "owner", "u1").await.expect("access");
    let _ = vault.get(&session, "impostor", "u1").await;

    let events: Vec<_> = bus
        .recent(50)
        .await
        .into_iter()
        .filter(|e| e.topic == CREDENTIAL_EVENT_TOPIC)
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload["event_type"], "access");
    assert_eq!(events[0].payload["user_id"], "u1");
    assert_eq!(events[1].payload["event_type"], "failed");
}
