//! Ephemeral credential vault with TTL, access limits, and secure erase.
//!
//! Credentials never touch disk. A stored set is keyed by an opaque
//! session id, clamped to a hard maximum TTL, limited in how often it can
//! be redeemed, and destroyed by secure erase (overwrite, then clear) on
//! release or by the background sweep once expired.
//!
//! One vault instance is constructed per composition root and passed
//! explicitly; construction spawns the expiry sweep exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::VaultLimits;

/// Bus topic for credential access notifications.
pub const CREDENTIAL_EVENT_TOPIC: &str = "credential.event";

/// Why the vault refused to hand out credentials. Fails closed: any
/// ambiguous condition is a denial and no partial set is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialDenied {
    /// The session accumulated too many failed attempts and is
    /// permanently blocked, irrespective of validity.
    #[error("session blocked after {0} failed attempts")]
    Blocked(u32),
    /// No credential set exists under this session id.
    #[error("unknown credential session")]
    NotFound,
    /// The presented skill id does not match the stored one.
    #[error("skill id mismatch")]
    SkillMismatch,
    /// The credential set expired and has been erased.
    #[error("credentials expired")]
    Expired,
    /// The configured access limit was reached; the set has been erased.
    #[error("access limit of {0} reached")]
    LimitReached(u32),
}

impl CredentialDenied {
    /// Event type string carried in the credential notification event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::NotFound | Self::SkillMismatch => "failed",
            Self::Expired => "expired",
            Self::LimitReached(_) => "limit_reached",
        }
    }
}

/// A time-boxed credential set tied to one skill/session pair.
#[derive(Debug)]
struct CredentialSet {
    skill_id: String,
    credentials: HashMap<String, String>,
    created_at: DateTime<Utc>,
    expires_at: Instant,
    access_count: u32,
}

#[derive(Default)]
struct VaultState {
    sessions: HashMap<String, CredentialSet>,
    failed_attempts: HashMap<String, u32>,
}

/// In-memory vault of ephemeral skill credentials.
pub struct CredentialVault {
    state: Arc<Mutex<VaultState>>,
    bus: Arc<EventBus>,
    limits: VaultLimits,
}

/// Vault monitoring counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStats {
    /// Sessions currently stored.
    pub active_sessions: usize,
    /// Stored sessions whose expiry has passed but were not yet swept.
    pub expired_sessions: usize,
    /// Sum of all failed attempts across sessions.
    pub failed_attempts_total: u32,
    /// Sessions at or above the block threshold.
    pub blocked_sessions: usize,
}

impl CredentialVault {
    /// Create a vault and start its background expiry sweep.
    ///
    /// The sweep runs on a fixed interval and secure-erases every expired
    /// entry under the same lock as the foreground access path, so secret
    /// lifetime stays bounded even if a consuming skill crashes without
    /// calling [`CredentialVault::release`]. It also drops failure tallies
    /// whose session is gone, except blocked ones, which persist.
    pub fn new(bus: Arc<EventBus>, limits: VaultLimits) -> Arc<Self> {
        let vault = Arc::new(Self {
            state: Arc::new(Mutex::new(VaultState::default())),
            bus,
            limits: limits.clone(),
        });

        let sweep_state = Arc::downgrade(&vault.state);
        let interval = limits.sweep_interval();
        let max_failed = limits.max_failed_attempts;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(state) = sweep_state.upgrade() else {
                    break; // vault dropped, stop sweeping
                };
                let mut state = state.lock().await;
                let now = Instant::now();
                let expired: Vec<String> = state
                    .sessions
                    .iter()
                    .filter(|(_, set)| now >= set.expires_at)
                    .map(|(sid, _)| sid.clone())
                    .collect();
                for session_id in expired {
                    info!(session = %mask_session(&session_id), "sweeping expired credentials");
                    secure_erase(&mut state, &session_id);
                }
                // Failure tallies for sessions that no longer exist are
                // stale; blocked ones stay so the block outlives the set.
                let VaultState {
                    sessions,
                    failed_attempts,
                } = &mut *state;
                failed_attempts
                    .retain(|sid, count| *count >= max_failed || sessions.contains_key(sid));
            }
        });

        vault
    }

    /// Store a credential set for a skill and return its session id.
    ///
    /// The requested TTL is clamped to the configured hard maximum,
    /// regardless of what the caller asked for.
    pub async fn store(
        &self,
        skill_id: &str,
        credentials: HashMap<String, String>,
        ttl: std::time::Duration,
    ) -> String {
        let ttl = ttl.min(self.limits.max_ttl());
        let session_id = generate_session_id(skill_id);

        let set = CredentialSet {
            skill_id: skill_id.to_owned(),
            credentials,
            created_at: Utc::now(),
            expires_at: Instant::now().checked_add(ttl).unwrap_or_else(Instant::now),
            access_count: 0,
        };

        let field_names: Vec<&String> = set.credentials.keys().collect();
        debug!(
            skill = skill_id,
            session = %mask_session(&session_id),
            fields = ?field_names,
            "credentials stored"
        );

        let mut state = self.state.lock().await;
        state.sessions.insert(session_id.clone(), set);
        session_id
    }

    /// Redeem a credential session. Fails closed: blocked, unknown,
    /// mismatched, expired, and over-limit sessions are all denied, and
    /// every outcome emits a notification event addressed to the requester.
    ///
    /// On success the caller receives a copy of the credential map, never
    /// the live one.
    ///
    /// # Errors
    ///
    /// Returns a [`CredentialDenied`] variant describing the refusal.
    pub async fn get(
        &self,
        session_id: &str,
        skill_id: &str,
        requester_id: &str,
    ) -> Result<HashMap<String, String>, CredentialDenied> {
        let max_failed = self.limits.max_failed_attempts;
        let max_access = self.limits.max_access_count;

        let outcome = {
            let mut state = self.state.lock().await;

            let prior_failed = state.failed_attempts.get(session_id).copied().unwrap_or(0);
            if prior_failed >= max_failed {
                // Already blocked; does not re-increment.
                Err(CredentialDenied::Blocked(prior_failed))
            } else if !state.sessions.contains_key(session_id) {
                Err(self.record_failure(&mut state, session_id, CredentialDenied::NotFound))
            } else if state
                .sessions
                .get(session_id)
                .is_some_and(|set| set.skill_id != skill_id)
            {
                Err(self.record_failure(&mut state, session_id, CredentialDenied::SkillMismatch))
            } else if state
                .sessions
                .get(session_id)
                .is_some_and(|set| Instant::now() >= set.expires_at)
            {
                secure_erase(&mut state, session_id);
                Err(self.record_failure(&mut state, session_id, CredentialDenied::Expired))
            } else if state
                .sessions
                .get(session_id)
                .is_some_and(|set| set.access_count >= max_access)
            {
                secure_erase(&mut state, session_id);
                Err(self.record_failure(
                    &mut state,
                    session_id,
                    CredentialDenied::LimitReached(max_access),
                ))
            } else {
                // All checks passed; hand out a copy and count the access.
                match state.sessions.get_mut(session_id) {
                    Some(set) => {
                        set.access_count = set.access_count.saturating_add(1);
                        Ok((set.credentials.clone(), set.access_count))
                    }
                    None => Err(CredentialDenied::NotFound),
                }
            }
        };

        match outcome {
            Ok((credentials, access_number)) => {
                info!(
                    skill = skill_id,
                    session = %mask_session(session_id),
                    access = access_number,
                    "credentials accessed"
                );
                self.notify(
                    requester_id,
                    skill_id,
                    "access",
                    &format!("credential access #{access_number}"),
                )
                .await;
                Ok(credentials)
            }
            Err(denial) => {
                warn!(
                    skill = skill_id,
                    session = %mask_session(session_id),
                    reason = %denial,
                    "credential access denied"
                );
                self.notify(requester_id, skill_id, denial.event_type(), &denial.to_string())
                    .await;
                Err(denial)
            }
        }
    }

    /// Record a failed attempt. A failure that crosses the block threshold
    /// is reported as [`CredentialDenied::Blocked`] so the caller sees the
    /// block the moment it takes effect.
    fn record_failure(
        &self,
        state: &mut VaultState,
        session_id: &str,
        denial: CredentialDenied,
    ) -> CredentialDenied {
        let count = state
            .failed_attempts
            .entry(session_id.to_owned())
            .or_insert(0);
        *count = count.saturating_add(1);
        if *count >= self.limits.max_failed_attempts {
            CredentialDenied::Blocked(*count)
        } else {
            denial
        }
    }

    /// Release and secure-erase a credential session.
    ///
    /// Idempotent: releasing twice is safe. Returns whether an entry was
    /// actually removed.
    pub async fn release(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = secure_erase(&mut state, session_id);
        if removed {
            info!(session = %mask_session(session_id), "credentials released");
        }
        removed
    }

    /// Monitoring counters.
    pub async fn stats(&self) -> VaultStats {
        let state = self.state.lock().await;
        let now = Instant::now();
        VaultStats {
            active_sessions: state.sessions.len(),
            expired_sessions: state
                .sessions
                .values()
                .filter(|set| now >= set.expires_at)
                .count(),
            failed_attempts_total: state
                .failed_attempts
                .values()
                .fold(0_u32, |acc, c| acc.saturating_add(*c)),
            blocked_sessions: state
                .failed_attempts
                .values()
                .filter(|c| **c >= self.limits.max_failed_attempts)
                .count(),
        }
    }

    /// When a stored session was created, if it still exists.
    pub async fn created_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.sessions.get(session_id).map(|set| set.created_at)
    }

    async fn notify(&self, user_id: &str, skill_id: &str, event_type: &str, message: &str) {
        self.bus
            .publish(
                CREDENTIAL_EVENT_TOPIC,
                serde_json::json!({
                    "user_id": user_id,
                    "skill_id": skill_id,
                    "event_type": event_type,
                    "message": message,
                    "timestamp": Utc::now(),
                }),
                "CredentialVault",
            )
            .await;
    }
}

/// Overwrite every value with random data of the same length, then zeros,
/// clear the map, and remove the entry. Returns whether an entry existed.
fn secure_erase(state: &mut VaultState, session_id: &str) -> bool {
    let Some(mut set) = state.sessions.remove(session_id) else {
        return false;
    };

    for value in set.credentials.values_mut() {
        let len = value.len();
        let scrambled: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        // In place, so the buffer that held the plaintext is the one
        // being overwritten rather than swapped out and freed intact.
        value.replace_range(.., &scrambled);
        value.replace_range(.., &"0".repeat(len));
    }
    set.credentials.clear();
    true
}

/// Session ids combine the skill id, a millisecond timestamp, and a random
/// component for practical uniqueness.
fn generate_session_id(skill_id: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let random: [u8; 8] = rand::random();
    format!("{skill_id}_{millis}_{}", hex::encode(random))
}

/// Shorten a session id for logs.
fn mask_session(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(20).collect();
    format!("{prefix}...")
}
