//! Skill model: manifests, permissions, execution context, terminal results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default entry file name inside a skill directory.
pub const DEFAULT_ENTRY: &str = "skill.py";

/// Controlled permission vocabulary a manifest may declare.
///
/// Permissions gate sandbox network blocking, credential availability, and
/// the lower-trust in-process execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read files inside the sandbox directory.
    FsRead,
    /// Write files inside the sandbox directory.
    FsWrite,
    /// Outbound network access from the sandbox.
    Network,
    /// Redeem credential sessions from the vault.
    Credentials,
    /// Direct device/UI access, the explicit gate for in-process
    /// execution, which bypasses process isolation.
    DirectDevice,
}

impl Permission {
    /// Parse a permission name as it appears in a manifest.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "fs_read" => Some(Self::FsRead),
            "fs_write" => Some(Self::FsWrite),
            "network" => Some(Self::Network),
            "credentials" => Some(Self::Credentials),
            "direct_device" => Some(Self::DirectDevice),
            _ => None,
        }
    }

    /// Manifest spelling of this permission.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FsRead => "fs_read",
            Self::FsWrite => "fs_write",
            Self::Network => "network",
            Self::Credentials => "credentials",
            Self::DirectDevice => "direct_device",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Skill metadata shipped alongside the entry source (`manifest.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Unique skill identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version string, free-form.
    pub version: String,
    /// Declared permission set (manifest spelling, validated by the gate).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Entry file name relative to the skill directory.
    #[serde(default = "default_entry")]
    pub entry: String,
}

fn default_entry() -> String {
    DEFAULT_ENTRY.to_owned()
}

impl Manifest {
    /// Load and parse `manifest.json` from a skill directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or not valid JSON.
    pub fn load(skill_dir: &Path) -> anyhow::Result<Self> {
        let path = skill_dir.join("manifest.json");
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid manifest.json: {e}"))?;
        Ok(manifest)
    }

    /// Declared permissions parsed into the controlled vocabulary.
    /// Unknown names are skipped; the safety gate rejects them earlier.
    pub fn parsed_permissions(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .filter_map(|p| Permission::parse(p))
            .collect()
    }

    /// Whether the manifest declares the given permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.parsed_permissions().contains(&permission)
    }
}

/// Immutable descriptor of a promoted, runnable skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Unique skill identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Declared permission names.
    pub permissions: Vec<String>,
    /// Resolved entry source location on disk.
    pub source: PathBuf,
}

/// String-keyed execution context handed to a skill's entry operation.
///
/// Always carries `task`, `user_id` and `timestamp`; the manager adds
/// `skill_name`, `permissions`, `sandbox_dir` and, when a credential
/// session is attached, `credentials`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillContext {
    /// Raw key/value entries.
    pub entries: HashMap<String, serde_json::Value>,
}

impl SkillContext {
    /// Build the minimum context for a task.
    pub fn for_task(task: &str, user_id: &str) -> Self {
        let mut entries = HashMap::new();
        entries.insert("task".to_owned(), serde_json::json!(task));
        entries.insert("user_id".to_owned(), serde_json::json!(user_id));
        entries.insert("timestamp".to_owned(), serde_json::json!(Utc::now()));
        Self { entries }
    }

    /// Insert or replace an entry.
    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.entries.insert(key.to_owned(), value);
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// The `task` entry as a string, empty when absent.
    pub fn task(&self) -> String {
        self.get("task")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    }

    /// The `user_id` entry, `"anon"` when absent.
    pub fn user_id(&self) -> String {
        self.get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("anon")
            .to_owned()
    }

    /// The attached credential session id, if any.
    pub fn credential_session(&self) -> Option<String> {
        self.get("credential_session")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
    }
}

/// Tagged outcome of one skill execution.
///
/// Produced exactly once per execution, by the skill process itself as a
/// single JSON line on its stdout, and consumed exactly once by the
/// waiting caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalResult {
    /// Session id correlating this result with its spawn.
    pub session_id: String,
    /// Skill that produced the result.
    #[serde(default, alias = "skill")]
    pub skill_id: String,
    /// Whether the entry operation succeeded.
    pub success: bool,
    /// Success payload, when `success` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message, when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the skill produced the result.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the run in milliseconds. Set by the host,
    /// never by the skill process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TerminalResult {
    /// Build a failure-shaped result for a session.
    pub fn failure(session_id: &str, skill_id: &str, error: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            skill_id: skill_id.to_owned(),
            success: false,
            result: None,
            error: Some(error.to_owned()),
            timestamp: Utc::now(),
            duration_ms: None,
        }
    }
}
