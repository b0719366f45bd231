//! Per-execution sandbox directories and the environment allow-list.
//!
//! Every subprocess execution gets a private working directory with an
//! `output/` folder for artifacts. Context values that name relative
//! `output/` paths are rewritten to point inside the sandbox, and the
//! child's environment is rebuilt from an explicit allow-list instead of
//! inheriting the host environment. The skill's source tree is copied in
//! rather than executed from the live directory, and Python runtimes get
//! a launcher preamble that masks dangerous modules and, without a
//! network grant, the socket layer.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::skill::SkillContext;

/// Environment variable carrying the execution session id into the child.
pub const SESSION_ENV_VAR: &str = "SKILLHOST_SESSION";

const CONTEXT_FILE: &str = "context.json";
const OUTPUT_DIR: &str = "output";
const LAUNCHER_FILE: &str = "_launcher.py";

/// Modules no skill may import, regardless of declared permissions.
const BLOCKED_MODULES: &[&str] = &["ctypes", "subprocess"];

/// Allow-list of environment variables a skill subprocess may inherit.
///
/// Everything else is stripped; the session variable is injected after
/// filtering so the policy can never mask it.
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    allowed: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            allowed: ["PATH", "HOME", "LANG", "LC_ALL", "TZ", "TMPDIR"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

impl EnvPolicy {
    /// Build a policy from explicit variable names.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a variable passes the policy.
    pub fn allows(&self, name: &str) -> bool {
        self.allowed.iter().any(|a| a == name)
    }

    /// The host environment reduced to the allow-list.
    pub fn filtered_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(name, _)| self.allows(name))
            .collect()
    }
}

/// One execution's private directory tree.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create `<base>/<session_id>/` with its `output/` folder.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the directories cannot be made.
    pub fn create(base: &Path, session_id: &str) -> std::io::Result<Self> {
        let root = base.join(session_id);
        std::fs::create_dir_all(root.join(OUTPUT_DIR))?;
        debug!(sandbox = %root.display(), "sandbox created");
        Ok(Self { root })
    }

    /// The sandbox root, used as the child's working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where artifact files land.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    /// Rewrite top-level string values of the form `output/...` so they
    /// resolve inside this sandbox. Skills address artifacts relatively;
    /// the host decides where they really live.
    pub fn rewrite_output_paths(&self, context: &mut SkillContext) {
        let output = self.output_dir();
        for value in context.entries.values_mut() {
            if let Value::String(s) = value {
                if let Some(rest) = s.strip_prefix("output/") {
                    *value = Value::String(output.join(rest).to_string_lossy().into_owned());
                }
            }
        }
    }

    /// Copy a skill's source tree into the sandbox so the execution never
    /// touches the live directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the copy fails.
    pub fn stage_sources(&self, skill_dir: &Path) -> std::io::Result<()> {
        copy_tree(skill_dir, &self.root)
    }

    /// Write a Python launcher that masks the blocked modules, stubs the
    /// socket layer unless the skill holds a network grant, and then runs
    /// the staged entry file. The child still receives the context file
    /// path as its first argument.
    ///
    /// # Errors
    ///
    /// Returns an error when the launcher cannot be written.
    pub fn write_python_launcher(
        &self,
        entry: &Path,
        network_allowed: bool,
    ) -> std::io::Result<PathBuf> {
        let mut script = String::from("import sys\n");
        for module in BLOCKED_MODULES {
            script.push_str(&format!("sys.modules[\"{module}\"] = None\n"));
        }
        if !network_allowed {
            script.push_str(concat!(
                "import socket\n",
                "def _denied(*_args, **_kwargs):\n",
                "    raise PermissionError(\"network permission not declared\")\n",
                "socket.socket = _denied\n",
                "socket.create_connection = _denied\n",
            ));
        }
        script.push_str(&format!(
            concat!(
                "_entry = r\"{}\"\n",
                "with open(_entry) as _f:\n",
                "    _code = _f.read()\n",
                "exec(compile(_code, _entry, \"exec\"))\n",
            ),
            entry.display()
        ));

        let path = self.root.join(LAUNCHER_FILE);
        std::fs::write(&path, script)?;
        Ok(path)
    }

    /// Serialize the context into the sandbox for the child to read.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub fn write_context(&self, context: &SkillContext) -> std::io::Result<PathBuf> {
        let path = self.root.join(CONTEXT_FILE);
        let json = serde_json::to_string(context).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Scrub and delete the context file. The context can carry redeemed
    /// credentials, so it is overwritten before removal rather than just
    /// unlinked.
    pub fn scrub_context(&self) -> std::io::Result<()> {
        let path = self.root.join(CONTEXT_FILE);
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let len = usize::try_from(meta.len()).unwrap_or(0);
                std::fs::write(&path, "0".repeat(len))?;
                std::fs::remove_file(&path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
