//! Skill vault: staging, safety validation, promotion, and quarantine.
//!
//! A submitted archive moves through a strict lifecycle. It is staged
//! verbatim, then gated, and ends up either promoted into the live skill
//! directory or preserved in quarantine with a full report. Nothing from
//! an archive is executed or trusted before it has passed the gate.

pub mod gate;
pub mod quarantine;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PathsConfig;
use crate::skill::{Manifest, SkillDescriptor};

use gate::{SkillValidator, ValidatedSkill};
use quarantine::QuarantineRecord;

/// Where a submission sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillState {
    /// Archived verbatim, untrusted.
    Staged,
    /// Currently under the safety gate.
    Validating,
    /// Promoted and runnable.
    Live,
    /// Rejected and preserved for inspection.
    Quarantined,
}

impl fmt::Display for SkillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Staged => "staged",
            Self::Validating => "validating",
            Self::Live => "live",
            Self::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

/// Errors from the skill store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The manifest or prepared directory is invalid.
    #[error("invalid skill: {0}")]
    Manifest(String),
    /// The submission failed the gate and was moved to quarantine.
    #[error("submission quarantined under {}", .0.location.display())]
    Quarantined(QuarantineRecord),
    /// The requested skill does not exist.
    #[error("unknown skill: {0}")]
    UnknownSkill(String),
}

/// Skill storage rooted at the configured data directory.
pub struct SkillStore {
    paths: PathsConfig,
    validator: Box<dyn SkillValidator>,
}

impl SkillStore {
    /// Build a store over the given layout and gate.
    pub fn new(paths: PathsConfig, validator: Box<dyn SkillValidator>) -> Self {
        Self { paths, validator }
    }

    /// Stage a submitted archive verbatim under the submitter's folder.
    ///
    /// The staged copy is named `<millis>_<original name>`, with a counter
    /// inserted when a same-millisecond submission already claimed that
    /// name. Nothing is read from the archive here.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the copy fails.
    pub fn stage(
        &self,
        archive: &Path,
        original_name: &str,
        submitter: &str,
    ) -> Result<PathBuf, StoreError> {
        let folder = self.paths.staging_dir().join(sanitize_component(submitter));
        std::fs::create_dir_all(&folder)?;
        let millis = Utc::now().timestamp_millis();
        let name = sanitize_component(original_name);
        let mut staged = folder.join(format!("{millis}_{name}"));
        let mut seq = 1_u32;
        while staged.exists() {
            staged = folder.join(format!("{millis}_{seq}_{name}"));
            seq = seq.saturating_add(1);
        }
        std::fs::copy(archive, &staged)?;
        info!(
            archive = %staged.display(),
            state = %SkillState::Staged,
            "submission staged"
        );
        Ok(staged)
    }

    /// Run a staged archive through the gate and promote or quarantine it.
    ///
    /// On success the extracted skill is moved into the live directory
    /// (replacing any prior version), mirrored into the user skills
    /// directory, and the staged archive is removed. On rejection the
    /// archive and whatever was extracted move to quarantine.
    ///
    /// # Errors
    ///
    /// [`StoreError::Quarantined`] carries the quarantine record when the
    /// gate rejects the submission.
    pub fn validate_and_install(&self, staged: &Path) -> Result<SkillDescriptor, StoreError> {
        info!(
            archive = %staged.display(),
            state = %SkillState::Validating,
            "running safety checks"
        );
        let extract_dir = extraction_dir(staged);

        match self.validator.validate(staged, &extract_dir)? {
            Ok(validated) => {
                let descriptor = self.promote(&validated)?;
                std::fs::remove_file(staged)?;
                if extract_dir.exists() {
                    std::fs::remove_dir_all(&extract_dir)?;
                }
                info!(
                    skill = %descriptor.id,
                    state = %SkillState::Live,
                    "skill promoted"
                );
                Ok(descriptor)
            }
            Err(report) => {
                let record = quarantine::quarantine_submission(
                    &self.paths.quarantine_dir(),
                    staged,
                    Some(&extract_dir),
                    &report,
                )?;
                info!(
                    skill = %record.skill_id,
                    state = %SkillState::Quarantined,
                    "submission rejected"
                );
                Err(StoreError::Quarantined(record))
            }
        }
    }

    /// Install a skill from an already-unpacked directory.
    ///
    /// The manifest still has to pass review, but there is no archive to
    /// gate and a failure does not create a quarantine record. Used for
    /// locally developed skills.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Manifest`] listing every problem found.
    pub fn install_from_prepared_dir(&self, dir: &Path) -> Result<SkillDescriptor, StoreError> {
        let manifest = Manifest::load(dir).map_err(|e| StoreError::Manifest(e.to_string()))?;
        let mut reasons = gate::review_manifest(&manifest);
        if !dir.join(&manifest.entry).is_file() {
            reasons.push(format!("entry file '{}' missing", manifest.entry));
        }
        if !reasons.is_empty() {
            return Err(StoreError::Manifest(reasons.join("; ")));
        }

        let live = self.live_path(&manifest.id);
        if live.exists() {
            std::fs::remove_dir_all(&live)?;
        }
        copy_dir_recursive(dir, &live)?;
        self.mirror_to_user_skills(&manifest.id, &live)?;

        info!(skill = %manifest.id, state = %SkillState::Live, "skill installed from directory");
        Ok(self.descriptor(&manifest, &live))
    }

    /// Every live skill, by manifest. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<SkillDescriptor>, StoreError> {
        let live_dir = self.paths.live_dir();
        let mut skills = Vec::new();
        if !live_dir.exists() {
            return Ok(skills);
        }
        for entry in std::fs::read_dir(&live_dir)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            match Manifest::load(&dir) {
                Ok(manifest) => skills.push(self.descriptor(&manifest, &dir)),
                Err(e) => warn!(dir = %dir.display(), error = %e, "unreadable skill manifest"),
            }
        }
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(skills)
    }

    /// Remove a skill from the live and user directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSkill`] when it was never installed.
    pub fn delete(&self, skill_id: &str) -> Result<(), StoreError> {
        let live = self.live_path(skill_id);
        let user = self.paths.user_skills_dir().join(skill_id);
        if !live.exists() && !user.exists() {
            return Err(StoreError::UnknownSkill(skill_id.to_owned()));
        }
        for dir in [live, user] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        info!(skill = skill_id, "skill deleted");
        Ok(())
    }

    /// Resolve a skill id to its on-disk directory: live first, then user
    /// skills, then builtins.
    pub fn resolve(&self, skill_id: &str) -> Option<PathBuf> {
        let candidates = [
            self.live_path(skill_id),
            self.paths.user_skills_dir().join(skill_id),
            self.paths.builtin_skills_dir().join(skill_id),
        ];
        candidates
            .into_iter()
            .find(|dir| dir.join("manifest.json").is_file())
    }

    /// Load the manifest of a resolvable skill.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSkill`] when no directory resolves, or
    /// [`StoreError::Manifest`] when its manifest is unreadable.
    pub fn manifest(&self, skill_id: &str) -> Result<(Manifest, PathBuf), StoreError> {
        let dir = self
            .resolve(skill_id)
            .ok_or_else(|| StoreError::UnknownSkill(skill_id.to_owned()))?;
        let manifest = Manifest::load(&dir).map_err(|e| StoreError::Manifest(e.to_string()))?;
        Ok((manifest, dir))
    }

    fn promote(&self, validated: &ValidatedSkill) -> Result<SkillDescriptor, StoreError> {
        let live = self.live_path(&validated.manifest.id);
        if live.exists() {
            debug!(skill = %validated.manifest.id, "replacing prior version");
            std::fs::remove_dir_all(&live)?;
        }
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }
        move_with_copy_fallback(&validated.root, &live)?;
        self.mirror_to_user_skills(&validated.manifest.id, &live)?;
        Ok(self.descriptor(&validated.manifest, &live))
    }

    fn mirror_to_user_skills(&self, skill_id: &str, live: &Path) -> Result<(), StoreError> {
        let user = self.paths.user_skills_dir().join(skill_id);
        if user.exists() {
            std::fs::remove_dir_all(&user)?;
        }
        copy_dir_recursive(live, &user)
    }

    fn live_path(&self, skill_id: &str) -> PathBuf {
        self.paths.live_dir().join(skill_id)
    }

    fn descriptor(&self, manifest: &Manifest, dir: &Path) -> SkillDescriptor {
        SkillDescriptor {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            permissions: manifest.permissions.clone(),
            source: dir.join(&manifest.entry),
        }
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
pub(crate) fn move_with_copy_fallback(src: &Path, dst: &Path) -> Result<(), StoreError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if src.is_dir() {
        copy_dir_recursive(src, dst)?;
        std::fs::remove_dir_all(src)?;
    } else {
        std::fs::copy(src, dst)?;
        std::fs::remove_file(src)?;
    }
    Ok(())
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Keep directory components free of separators and traversal.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "submission".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn extraction_dir(staged: &Path) -> PathBuf {
    let mut name = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_owned());
    name.push_str(".extract");
    staged.with_file_name(name)
}
