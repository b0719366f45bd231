//! Execution lifecycle: spawn, wait, kill, cleanup, retry.
//!
//! The manager owns every running execution. Each one is tracked in a
//! session table under a single lock; `kill` removes the record
//! atomically, so concurrent kills of the same session resolve to exactly
//! one cleanup cycle. Failed one-shot executions register a retry entry
//! that can be replayed through the event bus.

pub mod runner;
pub mod sandbox;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Event, EventBus, Subscriber};
use crate::config::RuntimeConfig;
use crate::skill::{Permission, SkillContext, TerminalResult};
use crate::store::{SkillStore, StoreError};
use crate::vault::{CredentialDenied, CredentialVault};

use runner::{spawn_process, spawn_routine, terminate, SkillRoutine};
use sandbox::{EnvPolicy, Sandbox};

/// Published when an execution starts.
pub const SPAWNED_TOPIC: &str = "skill.spawned";
/// Published with the terminal result of a one-shot execution.
pub const RESULT_TOPIC: &str = "skill.result";
/// Published after an execution is killed and cleaned up.
pub const KILLED_TOPIC: &str = "skill.killed";
/// Published when a failed execution can be replayed.
pub const RETRY_AVAILABLE_TOPIC: &str = "skill.retry_available";
/// Consumed to replay a registered retry.
pub const RETRY_REQUEST_TOPIC: &str = "skill.retry_request";

const WAIT_SLICE: Duration = Duration::from_millis(250);
const SENDER: &str = "LifecycleManager";

/// Errors from the lifecycle manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Skill lookup or storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Sandbox or process failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The vault refused the attached credential session.
    #[error("credential denied: {0}")]
    Credential(#[from] CredentialDenied),
    /// The execution requires a permission the manifest does not declare.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// No active execution under this session id.
    #[error("unknown session: {0}")]
    UnknownSession(String),
    /// Another caller is already waiting on this session.
    #[error("session {0} already has a waiter")]
    AlreadyWaiting(String),
    /// The deadline elapsed before the skill reported.
    #[error("timed out waiting for session {0}")]
    WaitTimeout(String),
    /// No retry registered under this session id.
    #[error("no retry registered under session {0}")]
    UnknownRetry(String),
}

/// How an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Subprocess inside a sandbox directory.
    Sandboxed,
    /// In-process routine, explicitly permitted and registered.
    Direct,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sandboxed => "sandboxed",
            Self::Direct => "direct",
        })
    }
}

/// Public view of one tracked execution.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    /// Session id correlating spawn, result, and kill.
    pub session_id: String,
    /// Skill being executed.
    pub skill_id: String,
    /// Sandboxed subprocess or direct routine.
    pub mode: ExecMode,
    /// OS pid for sandboxed mode, synthetic id for direct mode.
    pub pid: Option<u32>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
}

struct ExecutionRecord {
    skill_id: String,
    mode: ExecMode,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    child: Option<Child>,
    task: Option<tokio::task::JoinHandle<()>>,
    results: Option<mpsc::Receiver<TerminalResult>>,
    sandbox: Option<Sandbox>,
    credential_session: Option<String>,
}

impl ExecutionRecord {
    fn handle(&self, session_id: &str) -> ExecHandle {
        ExecHandle {
            session_id: session_id.to_owned(),
            skill_id: self.skill_id.clone(),
            mode: self.mode,
            pid: self.pid,
            started_at: self.started_at,
        }
    }
}

struct RetryEntry {
    skill_id: String,
    context: SkillContext,
    error: String,
    created_at: DateTime<Utc>,
}

/// Owns every running execution and its cleanup.
pub struct LifecycleManager {
    store: Arc<SkillStore>,
    vault: Arc<CredentialVault>,
    bus: Arc<EventBus>,
    runtime: RuntimeConfig,
    sandbox_base: PathBuf,
    env_policy: EnvPolicy,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    routines: RwLock<HashMap<String, Arc<dyn SkillRoutine>>>,
    retries: Mutex<HashMap<String, RetryEntry>>,
}

impl LifecycleManager {
    /// Build a manager and subscribe it to retry requests on the bus.
    pub async fn new(
        store: Arc<SkillStore>,
        vault: Arc<CredentialVault>,
        bus: Arc<EventBus>,
        runtime: RuntimeConfig,
        sandbox_base: PathBuf,
        env_policy: EnvPolicy,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            vault,
            bus: Arc::clone(&bus),
            runtime,
            sandbox_base,
            env_policy,
            executions: Mutex::new(HashMap::new()),
            routines: RwLock::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        });

        let listener = Arc::new(RetryListener {
            manager: Arc::downgrade(&manager),
        });
        bus.subscribe(RETRY_REQUEST_TOPIC, listener).await;
        manager
    }

    /// Register an in-process routine for a skill id. The routine only
    /// runs for skills whose manifest grants the direct-device permission.
    pub async fn register_routine(&self, skill_id: &str, routine: Arc<dyn SkillRoutine>) {
        self.routines
            .write()
            .await
            .insert(skill_id.to_owned(), routine);
    }

    /// Start an execution and return its handle.
    ///
    /// Resolves the skill, prepares its context, redeems an attached
    /// credential session against the vault, and launches either a
    /// sandboxed subprocess or, for explicitly permitted skills with a
    /// registered routine, a direct in-process task. Emits a spawn event
    /// and arms a max-lifetime watchdog.
    ///
    /// # Errors
    ///
    /// Fails when the skill is unknown, a credential session is attached
    /// without the credentials permission, the vault denies the session,
    /// or the process cannot be started.
    pub async fn spawn(
        self: &Arc<Self>,
        skill_id: &str,
        mut context: SkillContext,
    ) -> Result<ExecHandle, ManagerError> {
        let (manifest, skill_dir) = self.store.manifest(skill_id)?;
        let session_id = format!("{}_{}", skill_id, Uuid::new_v4().simple());

        context.set("skill_name", serde_json::json!(manifest.name));
        context.set("permissions", serde_json::json!(manifest.permissions));

        let mut credential_session = None;
        if let Some(session) = context.credential_session() {
            if !manifest.has_permission(Permission::Credentials) {
                return Err(ManagerError::PermissionDenied(format!(
                    "skill '{skill_id}' does not declare the credentials permission"
                )));
            }
            let credentials = self
                .vault
                .get(&session, skill_id, &context.user_id())
                .await?;
            context.set("credentials", serde_json::json!(credentials));
            credential_session = Some(session);
        }

        let routine = if manifest.has_permission(Permission::DirectDevice) {
            self.routines.read().await.get(skill_id).cloned()
        } else {
            None
        };

        let record = match routine {
            Some(routine) => {
                let pid = synthetic_pid();
                let (task, results) = spawn_routine(routine, context, &session_id, skill_id);
                ExecutionRecord {
                    skill_id: skill_id.to_owned(),
                    mode: ExecMode::Direct,
                    pid: Some(pid),
                    started_at: Utc::now(),
                    child: None,
                    task: Some(task),
                    results: Some(results),
                    sandbox: None,
                    credential_session,
                }
            }
            None => {
                let sandbox = Sandbox::create(&self.sandbox_base, &session_id)?;
                // Run from a private copy; concurrent executions must not
                // share (or be able to mutate) the live source.
                sandbox.stage_sources(&skill_dir)?;
                context.set(
                    "sandbox_dir",
                    serde_json::json!(sandbox.root().to_string_lossy()),
                );
                sandbox.rewrite_output_paths(&mut context);
                let context_file = sandbox.write_context(&context)?;
                let entry = sandbox.root().join(&manifest.entry);
                let network_allowed = manifest.has_permission(Permission::Network)
                    || manifest.has_permission(Permission::Credentials);
                let entry = if self.runtime.is_python() {
                    sandbox.write_python_launcher(&entry, network_allowed)?
                } else {
                    entry
                };

                let spawned = spawn_process(
                    &self.runtime,
                    &entry,
                    &context_file,
                    sandbox.root(),
                    self.env_policy.filtered_env(),
                    &session_id,
                )?;
                ExecutionRecord {
                    skill_id: skill_id.to_owned(),
                    mode: ExecMode::Sandboxed,
                    pid: spawned.pid,
                    started_at: Utc::now(),
                    child: Some(spawned.child),
                    task: None,
                    results: Some(spawned.results),
                    sandbox: Some(sandbox),
                    credential_session,
                }
            }
        };

        let handle = record.handle(&session_id);
        self.executions
            .lock()
            .await
            .insert(session_id.clone(), record);

        info!(
            session = %session_id,
            skill = skill_id,
            mode = %handle.mode,
            pid = ?handle.pid,
            "execution started"
        );
        self.bus
            .publish(
                SPAWNED_TOPIC,
                serde_json::json!({
                    "session_id": session_id,
                    "skill_id": skill_id,
                    "mode": handle.mode.to_string(),
                    "pid": handle.pid,
                }),
                SENDER,
            )
            .await;

        self.arm_watchdog(&session_id);
        Ok(handle)
    }

    /// Wait for the terminal result of a session, bounded by a deadline.
    ///
    /// The timeout is clamped to the configured wait ceiling. A session
    /// whose skill exits without printing a result yields a synthesized
    /// failure rather than an error.
    ///
    /// # Errors
    ///
    /// [`ManagerError::WaitTimeout`] when the deadline elapses,
    /// [`ManagerError::UnknownSession`] when the session is not tracked,
    /// [`ManagerError::AlreadyWaiting`] when another caller holds the
    /// receiver.
    pub async fn wait_for_result(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<TerminalResult, ManagerError> {
        let wait = timeout.min(self.runtime.wait_ceiling());
        let deadline = Instant::now().checked_add(wait).unwrap_or_else(Instant::now);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ManagerError::WaitTimeout(session_id.to_owned()));
            }

            let (mut results, skill_id) = {
                let mut table = self.executions.lock().await;
                let record = table
                    .get_mut(session_id)
                    .ok_or_else(|| ManagerError::UnknownSession(session_id.to_owned()))?;
                let results = record
                    .results
                    .take()
                    .ok_or_else(|| ManagerError::AlreadyWaiting(session_id.to_owned()))?;
                (results, record.skill_id.clone())
            };

            let slice = WAIT_SLICE.min(remaining);
            let outcome = tokio::time::timeout(slice, results.recv()).await;

            // Hand the receiver back; the record may have been killed
            // while we were waiting, in which case it is simply dropped.
            {
                let mut table = self.executions.lock().await;
                if let Some(record) = table.get_mut(session_id) {
                    record.results = Some(results);
                }
            }

            match outcome {
                Ok(Some(result)) => {
                    debug!(session = session_id, success = result.success, "result received");
                    return Ok(result);
                }
                Ok(None) => {
                    return Ok(TerminalResult::failure(
                        session_id,
                        &skill_id,
                        "skill exited without reporting a result",
                    ));
                }
                Err(_) => continue,
            }
        }
    }

    /// Kill an execution and clean up everything it owned.
    ///
    /// The record is removed from the table atomically, so when several
    /// callers race to kill the same session only one performs the
    /// termination, scrub, credential release, and kill event. Returns
    /// whether this call was the one that did it.
    pub async fn kill(&self, session_id: &str) -> bool {
        let record = self.executions.lock().await.remove(session_id);
        let Some(mut record) = record else {
            return false;
        };

        if let Some(mut child) = record.child.take() {
            terminate(&mut child, record.pid, self.runtime.kill_grace()).await;
        }
        if let Some(task) = record.task.take() {
            task.abort();
        }
        if let Some(sandbox) = record.sandbox.as_ref() {
            if let Err(e) = sandbox.scrub_context() {
                warn!(session = session_id, error = %e, "context scrub failed");
            }
        }
        if let Some(session) = record.credential_session.as_deref() {
            self.vault.release(session).await;
        }

        info!(session = session_id, skill = %record.skill_id, "execution killed");
        self.bus
            .publish(
                KILLED_TOPIC,
                serde_json::json!({
                    "session_id": session_id,
                    "skill_id": record.skill_id,
                    "mode": record.mode.to_string(),
                    "pid": record.pid,
                }),
                SENDER,
            )
            .await;
        true
    }

    /// Run a skill once: spawn, wait, kill, report.
    ///
    /// Never returns an error. A spawn failure is folded into a
    /// failure-shaped result under a freshly minted session id, so callers
    /// and bus listeners see the same shape whether the skill ran or not.
    /// Any failed or timed-out run registers a retry entry keyed by the
    /// session id and announces it on the bus; the result itself is
    /// published either way and carries the wall-clock duration.
    ///
    /// The optional timeout bounds the wait; it is clamped to the
    /// configured wait ceiling, which also applies when no timeout is
    /// given.
    pub async fn use_and_kill(
        self: &Arc<Self>,
        skill_id: &str,
        context: SkillContext,
        timeout: Option<Duration>,
    ) -> TerminalResult {
        let retry_context = context.clone();
        let started = Instant::now();

        let mut result = match self.spawn(skill_id, context).await {
            Ok(handle) => {
                let wait = timeout.unwrap_or_else(|| self.runtime.wait_ceiling());
                let result = match self.wait_for_result(&handle.session_id, wait).await {
                    Ok(result) => result,
                    Err(ManagerError::WaitTimeout(_)) => TerminalResult::failure(
                        &handle.session_id,
                        skill_id,
                        "timed out waiting for result",
                    ),
                    Err(e) => {
                        TerminalResult::failure(&handle.session_id, skill_id, &e.to_string())
                    }
                };
                self.kill(&handle.session_id).await;
                result
            }
            Err(e) => {
                // Nothing was spawned; mint a session id so the failure
                // and its retry entry are addressable like any other run.
                let session_id = format!("{}_{}", skill_id, Uuid::new_v4().simple());
                warn!(session = %session_id, skill = skill_id, error = %e, "spawn failed");
                TerminalResult::failure(&session_id, skill_id, &e.to_string())
            }
        };

        result.duration_ms =
            Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

        if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_owned());
            self.register_retry(&result.session_id, skill_id, retry_context, &error)
                .await;
            self.bus
                .publish(
                    RETRY_AVAILABLE_TOPIC,
                    serde_json::json!({
                        "session_id": result.session_id,
                        "skill_id": skill_id,
                        "original_error": error,
                        "timestamp": Utc::now(),
                    }),
                    SENDER,
                )
                .await;
        }

        self.bus
            .publish(
                RESULT_TOPIC,
                serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
                SENDER,
            )
            .await;
        result
    }

    /// Replay a previously failed execution by the session id its retry
    /// entry was announced under.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownRetry`] when no retry was registered under
    /// that session or it was already consumed.
    pub async fn retry(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<TerminalResult, ManagerError> {
        let entry = self
            .retries
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| ManagerError::UnknownRetry(session_id.to_owned()))?;
        info!(
            session = session_id,
            skill = %entry.skill_id,
            original_error = %entry.error,
            "replaying failed execution"
        );
        Ok(self.use_and_kill(&entry.skill_id, entry.context, None).await)
    }

    /// Handles for every tracked execution.
    pub async fn list_active(&self) -> Vec<ExecHandle> {
        let table = self.executions.lock().await;
        let mut handles: Vec<ExecHandle> = table
            .iter()
            .map(|(session_id, record)| record.handle(session_id))
            .collect();
        handles.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        handles
    }

    /// Failed sessions with a registered retry, newest first, as
    /// `(session_id, skill_id)` pairs.
    pub async fn pending_retries(&self) -> Vec<(String, String)> {
        let retries = self.retries.lock().await;
        let mut entries: Vec<(DateTime<Utc>, String, String)> = retries
            .iter()
            .map(|(session, entry)| (entry.created_at, session.clone(), entry.skill_id.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries
            .into_iter()
            .map(|(_, session, skill_id)| (session, skill_id))
            .collect()
    }

    /// Kill every tracked execution. Used on host shutdown.
    pub async fn kill_all(&self) -> usize {
        let sessions: Vec<String> = {
            let table = self.executions.lock().await;
            table.keys().cloned().collect()
        };
        let mut killed = 0_usize;
        for session in sessions {
            if self.kill(&session).await {
                killed = killed.saturating_add(1);
            }
        }
        killed
    }

    async fn register_retry(
        &self,
        session_id: &str,
        skill_id: &str,
        context: SkillContext,
        error: &str,
    ) {
        self.retries.lock().await.insert(
            session_id.to_owned(),
            RetryEntry {
                skill_id: skill_id.to_owned(),
                context,
                error: error.to_owned(),
                created_at: Utc::now(),
            },
        );
        debug!(session = session_id, skill = skill_id, "retry registered");
    }

    fn arm_watchdog(self: &Arc<Self>, session_id: &str) {
        let weak = Arc::downgrade(self);
        let session = session_id.to_owned();
        let lifetime = self.runtime.max_lifetime();
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(manager) = weak.upgrade() {
                if manager.kill(&session).await {
                    warn!(session = %session, "execution exceeded max lifetime");
                }
            }
        });
    }
}

/// Bus subscriber that replays registered retries on request.
struct RetryListener {
    manager: Weak<LifecycleManager>,
}

#[async_trait]
impl Subscriber for RetryListener {
    async fn on_event(&self, event: Event) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(session) = event
            .payload
            .get("session_id")
            .and_then(serde_json::Value::as_str)
        else {
            warn!(topic = %event.topic, "retry request without a session id");
            return;
        };
        let session = session.to_owned();
        // Replay outside the bus fan-out so a slow retry never stalls
        // other subscribers.
        tokio::spawn(async move {
            if let Err(e) = manager.retry(&session).await {
                warn!(session = %session, error = %e, "retry failed");
            }
        });
    }
}

fn synthetic_pid() -> u32 {
    u32::try_from(Utc::now().timestamp_millis().rem_euclid(100_000)).unwrap_or(0)
}
