//! Process plumbing for sandboxed skill executions.
//!
//! A skill subprocess is handed its entry file and a context file path,
//! runs inside the sandbox directory with a filtered environment, and
//! reports by printing exactly one JSON result line on stdout. A reader
//! task forwards parsed results over a channel so the manager can wait
//! with a deadline instead of polling.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::skill::{SkillContext, TerminalResult};

use super::sandbox::SESSION_ENV_VAR;

const RESULT_CHANNEL_CAPACITY: usize = 8;

/// A running subprocess with its result channel.
pub struct SpawnedProcess {
    /// Handle to the child process.
    pub child: Child,
    /// OS process id, when the child is still running.
    pub pid: Option<u32>,
    /// Receives every result line the child prints.
    pub results: mpsc::Receiver<TerminalResult>,
}

/// Launch a skill subprocess inside its sandbox.
///
/// The environment is cleared and rebuilt from `env`, with the session id
/// injected afterwards so it is always present. Stdout is parsed for
/// result lines; stderr is relayed to the host log.
///
/// # Errors
///
/// Returns the spawn error when the interpreter cannot be started.
pub fn spawn_process(
    runtime: &RuntimeConfig,
    entry: &Path,
    context_file: &Path,
    sandbox_root: &Path,
    env: Vec<(String, String)>,
    session_id: &str,
) -> std::io::Result<SpawnedProcess> {
    let mut command = Command::new(&runtime.program);
    command
        .args(&runtime.args)
        .arg(entry)
        .arg(context_file)
        .current_dir(sandbox_root)
        .env_clear()
        .envs(env)
        .env(SESSION_ENV_VAR, session_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();
    let (tx, results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

    if let Some(stdout) = child.stdout.take() {
        let session = session_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<TerminalResult>(&line) {
                    Ok(result) => {
                        if tx.send(result).await.is_err() {
                            break; // receiver gone, stop reading
                        }
                    }
                    Err(_) => debug!(session = %session, line = %line, "skill stdout"),
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let session = session_id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(session = %session, line = %line, "skill stderr");
            }
        });
    }

    debug!(session = session_id, pid = ?pid, program = %runtime.program, "skill process spawned");
    Ok(SpawnedProcess {
        child,
        pid,
        results,
    })
}

/// Terminate a child cooperatively, then forcefully.
///
/// Sends SIGTERM through the system `kill` utility, waits out the grace
/// period, and escalates to SIGKILL if the child is still running.
pub async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if child.try_wait().ok().flatten().is_some() {
        return; // already exited
    }

    if let Some(pid) = pid {
        let sent = Command::new("kill")
            .arg(pid.to_string())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        if sent {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => debug!(pid, "grace period elapsed, escalating"),
            }
        }
    }

    if let Err(e) = child.start_kill() {
        warn!(pid = ?pid, error = %e, "force kill failed");
    }
    let _ = child.wait().await;
}

/// An in-process skill implementation.
///
/// Bypassing the sandbox is a privileged path: the manager only routes an
/// execution here when the skill's manifest grants the direct-device
/// permission and a routine is registered under its id.
#[async_trait]
pub trait SkillRoutine: Send + Sync {
    /// Run the skill against the prepared context.
    async fn run(&self, context: SkillContext) -> anyhow::Result<serde_json::Value>;
}

/// Run a registered routine on a task, reporting through the same channel
/// shape as a subprocess so the waiting path is uniform.
pub fn spawn_routine(
    routine: std::sync::Arc<dyn SkillRoutine>,
    context: SkillContext,
    session_id: &str,
    skill_id: &str,
) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<TerminalResult>) {
    let (tx, results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
    let session = session_id.to_owned();
    let skill = skill_id.to_owned();
    let task = tokio::spawn(async move {
        let result = match routine.run(context).await {
            Ok(value) => TerminalResult {
                session_id: session.clone(),
                skill_id: skill.clone(),
                success: true,
                result: Some(value),
                error: None,
                timestamp: chrono::Utc::now(),
                duration_ms: None,
            },
            Err(e) => TerminalResult::failure(&session, &skill, &e.to_string()),
        };
        if tx.send(result).await.is_err() {
            debug!(session = %session, "routine result dropped, no waiter");
        }
    });
    (task, results)
}
