//! Configuration loading and management.
//!
//! Loads skillhost configuration from `./skillhost.toml` (or
//! `$SKILLHOST_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level skillhost configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Filesystem layout for skill storage.
    pub paths: PathsConfig,
    /// Skill process runtime settings.
    pub runtime: RuntimeConfig,
    /// Submission archive limits enforced by the safety gate.
    pub archive: ArchiveLimits,
    /// Credential vault limits.
    pub vault: VaultLimits,
}

impl HostConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$SKILLHOST_CONFIG_PATH` or `./skillhost.toml`.
    /// A missing file falls back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: HostConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(HostConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("SKILLHOST_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("skillhost.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SKILLHOST_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SKILLHOST_RUNTIME_PROGRAM") {
            self.runtime.program = v;
        }
        if let Some(v) = env("SKILLHOST_MAX_LIFETIME_SECS") {
            match v.parse() {
                Ok(n) => self.runtime.max_lifetime_seconds = n,
                Err(_) => tracing::warn!(
                    var = "SKILLHOST_MAX_LIFETIME_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("SKILLHOST_MAX_TTL_SECS") {
            match v.parse() {
                Ok(n) => self.vault.max_ttl_seconds = n,
                Err(_) => tracing::warn!(
                    var = "SKILLHOST_MAX_TTL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem layout under one data directory.
///
/// ```text
/// data/
/// ├── vault/staging/      staged submissions, per submitter
/// ├── vault/live/         promoted skills, one dir per skill id
/// ├── vault/quarantine/   rejected submissions, per (skill id, timestamp)
/// ├── skills_user/        flat entry-file references for fast lookup
/// ├── skills_builtin/     skills shipped with the host
/// ├── sandbox/            per-execution sandbox working directories
/// └── logs/               rotating JSON log files
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root data directory.
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "skillhost")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".skillhost"));
        Self { data_dir }
    }
}

impl PathsConfig {
    /// Staging area for submitted archives.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("vault").join("staging")
    }

    /// Live area of promoted skills.
    pub fn live_dir(&self) -> PathBuf {
        self.data_dir.join("vault").join("live")
    }

    /// Quarantine area for rejected submissions.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("vault").join("quarantine")
    }

    /// Flat user-skills area for fast entry lookup.
    pub fn user_skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills_user")
    }

    /// Built-in skills shipped with the host.
    pub fn builtin_skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills_builtin")
    }

    /// Base directory for per-execution sandboxes.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.data_dir.join("sandbox")
    }

    /// Rotating JSON log files for execution runs.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Create the whole layout.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.staging_dir(),
            self.live_dir(),
            self.quarantine_dir(),
            self.user_skills_dir(),
            self.builtin_skills_dir(),
            self.sandbox_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

// ── Runtime config ──────────────────────────────────────────────

/// How skill entry files are executed and bounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter program invoked with the entry file.
    pub program: String,
    /// Extra arguments placed before the entry file.
    pub args: Vec<String>,
    /// Default maximum lifetime of one execution, in seconds.
    pub max_lifetime_seconds: u64,
    /// Hard ceiling on one result wait, independent of caller timeouts.
    pub wait_ceiling_seconds: u64,
    /// Grace period between cooperative terminate and forced kill.
    pub kill_grace_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_owned(),
            args: Vec::new(),
            max_lifetime_seconds: 300,
            wait_ceiling_seconds: 60,
            kill_grace_seconds: 5,
        }
    }
}

impl RuntimeConfig {
    /// Default maximum lifetime as a [`Duration`].
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }

    /// Wait ceiling as a [`Duration`].
    pub fn wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.wait_ceiling_seconds)
    }

    /// Kill grace period as a [`Duration`].
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    /// Whether the configured interpreter is a Python runtime, which
    /// supports the sandbox launcher preamble.
    pub fn is_python(&self) -> bool {
        std::path::Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("python"))
    }
}

// ── Archive limits ──────────────────────────────────────────────

/// Limits the safety gate enforces on submission archives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveLimits {
    /// Maximum archive size on disk, in megabytes.
    pub max_archive_mb: u64,
    /// Maximum number of members inside the archive.
    pub max_members: usize,
    /// Maximum total uncompressed size, in megabytes.
    pub max_uncompressed_mb: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_mb: 15,
            max_members: 60,
            max_uncompressed_mb: 40,
        }
    }
}

// ── Vault limits ────────────────────────────────────────────────

/// Credential vault limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultLimits {
    /// Default TTL for stored credential sets, in seconds.
    pub default_ttl_seconds: u64,
    /// Hard maximum TTL; requested TTLs are clamped to this.
    pub max_ttl_seconds: u64,
    /// Maximum successful redemptions per session.
    pub max_access_count: u32,
    /// Failed attempts after which a session is permanently blocked.
    pub max_failed_attempts: u32,
    /// Interval of the background expiry sweep, in seconds.
    pub sweep_interval_seconds: u64,
}

impl Default for VaultLimits {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            max_ttl_seconds: 600,
            max_access_count: 10,
            max_failed_attempts: 3,
            sweep_interval_seconds: 60,
        }
    }
}

impl VaultLimits {
    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Hard maximum TTL as a [`Duration`].
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_seconds)
    }
}

// ── Tests ───────────────────────────────────────────────────────
