#![allow(missing_docs)]

//! skillhost, a sandboxed skill execution host.
//!
//! Single binary that installs skill packages through the safety gate,
//! runs them in per-execution sandboxes, and manages ephemeral
//! credentials for the executions that are allowed to use them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use skillhost::bus::EventBus;
use skillhost::config::HostConfig;
use skillhost::manager::sandbox::EnvPolicy;
use skillhost::manager::LifecycleManager;
use skillhost::skill::SkillContext;
use skillhost::store::gate::ManifestValidator;
use skillhost::store::{quarantine, SkillStore, StoreError};
use skillhost::vault::CredentialVault;

#[derive(Parser)]
#[command(name = "skillhost", version, about = "Sandboxed skill execution host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage a skill archive and run it through the safety gate.
    Install {
        /// Path to the .tar.gz skill package.
        archive: PathBuf,
        /// Who submitted the package; used for the staging folder.
        #[arg(long, default_value = "local")]
        submitter: String,
    },
    /// Install a skill from an already-unpacked directory.
    InstallDir {
        /// Directory containing manifest.json and the entry file.
        dir: PathBuf,
    },
    /// Run an installed skill once and print its result.
    Run {
        /// Skill id to execute.
        skill_id: String,
        /// Task text handed to the skill.
        task: String,
        /// User id recorded in the context.
        #[arg(long, default_value = "cli")]
        user: String,
        /// Extra context entries as a JSON object.
        #[arg(long)]
        context: Option<String>,
        /// Seconds to wait for the result, clamped to the wait ceiling.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List installed skills.
    List,
    /// List quarantined submissions.
    Quarantine,
    /// Remove an installed skill.
    Delete {
        /// Skill id to remove.
        skill_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HostConfig::load().context("failed to load configuration")?;
    config
        .paths
        .ensure_layout()
        .context("failed to create data directories")?;

    // Executions keep a rotating JSON log on disk; management commands
    // only log to stderr.
    let _logging = if matches!(cli.command, Command::Run { .. }) {
        Some(skillhost::logging::init_production(
            &config.paths.logs_dir(),
        )?)
    } else {
        skillhost::logging::init_cli();
        None
    };

    let store = Arc::new(SkillStore::new(
        config.paths.clone(),
        Box::new(ManifestValidator::new(config.archive.clone())),
    ));

    match cli.command {
        Command::Install { archive, submitter } => {
            let name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "skill.tar.gz".to_owned());
            let staged = store
                .stage(&archive, &name, &submitter)
                .context("failed to stage archive")?;
            match store.validate_and_install(&staged) {
                Ok(descriptor) => {
                    println!("installed {} v{}", descriptor.id, descriptor.version);
                }
                Err(StoreError::Quarantined(record)) => {
                    println!("rejected: {} reason(s)", record.reasons.len());
                    for reason in &record.reasons {
                        println!("  - {reason}");
                    }
                    println!("preserved under {}", record.location.display());
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::InstallDir { dir } => {
            let descriptor = store
                .install_from_prepared_dir(&dir)
                .context("installation failed")?;
            println!("installed {} v{}", descriptor.id, descriptor.version);
        }
        Command::Run {
            skill_id,
            task,
            user,
            context,
            timeout,
        } => {
            let bus = Arc::new(EventBus::new());
            let vault = CredentialVault::new(Arc::clone(&bus), config.vault.clone());
            let manager = LifecycleManager::new(
                Arc::clone(&store),
                vault,
                Arc::clone(&bus),
                config.runtime.clone(),
                config.paths.sandbox_dir(),
                EnvPolicy::default(),
            )
            .await;

            let mut skill_context = SkillContext::for_task(&task, &user);
            if let Some(extra) = context {
                let entries: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(&extra).context("--context must be a JSON object")?;
                for (key, value) in entries {
                    skill_context.set(&key, value);
                }
            }

            info!(skill = %skill_id, "running skill");
            let result = manager
                .use_and_kill(
                    &skill_id,
                    skill_context,
                    timeout.map(std::time::Duration::from_secs),
                )
                .await;
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("failed to render result")?
            );
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::List => {
            let skills = store.list().context("failed to list skills")?;
            if skills.is_empty() {
                println!("no skills installed");
            }
            for skill in skills {
                println!(
                    "{}\t{}\t[{}]",
                    skill.id,
                    skill.version,
                    skill.permissions.join(", ")
                );
            }
        }
        Command::Quarantine => {
            let records = quarantine::list_quarantined(&config.paths.quarantine_dir())
                .context("failed to list quarantine")?;
            if records.is_empty() {
                println!("quarantine is empty");
            }
            for record in records {
                println!(
                    "{}\t{}\t{} reason(s)\t{}",
                    record.skill_id,
                    record.quarantined_at.format("%Y-%m-%d %H:%M:%S"),
                    record.reasons.len(),
                    record.location.display()
                );
            }
        }
        Command::Delete { skill_id } => {
            store.delete(&skill_id).context("deletion failed")?;
            println!("deleted {skill_id}");
        }
    }

    Ok(())
}
