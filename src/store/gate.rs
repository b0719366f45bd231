//! Safety gate for submitted skill archives.
//!
//! Every archive passes through the gate before anything from it is
//! trusted: size and member limits, path traversal checks, link entry
//! rejection, and manifest validation. The gate collects every reason it
//! finds rather than stopping at the first, so a quarantine record tells
//! the whole story.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ArchiveLimits;
use crate::skill::{Manifest, Permission};

use super::StoreError;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Outcome of gating one archive. Serialized into the quarantine record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    /// Skill id from the manifest, when one could be read.
    pub skill_id: Option<String>,
    /// SHA-256 of the submitted archive, for audit correlation.
    pub archive_sha256: String,
    /// Archive size on disk in bytes.
    pub archive_size: u64,
    /// Number of members in the archive.
    pub member_count: usize,
    /// Total declared uncompressed size in bytes.
    pub uncompressed_size: u64,
    /// Every reason the archive was rejected; empty when it passed.
    pub reasons: Vec<String>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl SafetyReport {
    /// Whether the archive passed every check.
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// What a passing validation hands back to the store.
#[derive(Debug)]
pub struct ValidatedSkill {
    /// Parsed and checked manifest.
    pub manifest: Manifest,
    /// Directory holding the extracted skill tree, rooted at the manifest.
    pub root: PathBuf,
    /// The full report for auditing.
    pub report: SafetyReport,
}

/// Validation seam. The store only knows this trait, so tests can swap in
/// an always-pass or always-fail gate.
pub trait SkillValidator: Send + Sync {
    /// Inspect `archive`, extract it under `extract_dir`, and either
    /// return the validated skill or the failing report.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] for filesystem failures unrelated to the
    /// archive's content.
    fn validate(
        &self,
        archive: &Path,
        extract_dir: &Path,
    ) -> Result<Result<ValidatedSkill, SafetyReport>, StoreError>;
}

fn skill_id_pattern() -> Option<&'static Regex> {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok())
        .as_ref()
}

/// Check a manifest against the controlled vocabulary and required
/// fields. Returns every problem found; empty means the manifest is sound.
pub fn review_manifest(manifest: &Manifest) -> Vec<String> {
    let mut reasons = Vec::new();
    for (field, value) in [
        ("id", &manifest.id),
        ("name", &manifest.name),
        ("version", &manifest.version),
    ] {
        if value.trim().is_empty() {
            reasons.push(format!("manifest field '{field}' is empty"));
        }
    }
    if skill_id_pattern().is_some_and(|re| !re.is_match(&manifest.id)) {
        reasons.push(format!(
            "manifest id contains invalid characters: {}",
            manifest.id
        ));
    }
    for name in &manifest.permissions {
        if Permission::parse(name).is_none() {
            reasons.push(format!("unknown permission in manifest: {name}"));
        }
    }
    reasons
}

/// The production gate: tar.gz structural checks plus manifest validation.
pub struct ManifestValidator {
    limits: ArchiveLimits,
}

impl ManifestValidator {
    /// Build a gate with the given limits.
    pub fn new(limits: ArchiveLimits) -> Self {
        Self { limits }
    }

    fn scan_archive(&self, archive: &Path, report: &mut SafetyReport) -> Result<(), StoreError> {
        let file = File::open(archive)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));

        let entries = match tar.entries() {
            Ok(entries) => entries,
            Err(e) => {
                report.reasons.push(format!("unreadable archive: {e}"));
                return Ok(());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.reasons.push(format!("corrupt archive member: {e}"));
                    return Ok(());
                }
            };

            report.member_count = report.member_count.saturating_add(1);
            report.uncompressed_size = report.uncompressed_size.saturating_add(entry.size());

            let header_type = entry.header().entry_type();
            if header_type.is_symlink() || header_type.is_hard_link() {
                report
                    .reasons
                    .push(format!("link entry not allowed: {:?}", entry.path()));
            }

            match entry.path() {
                Ok(path) => {
                    if path.is_absolute()
                        || path
                            .components()
                            .any(|c| matches!(c, std::path::Component::ParentDir))
                    {
                        report
                            .reasons
                            .push(format!("path traversal in member: {}", path.display()));
                    }
                }
                Err(e) => report.reasons.push(format!("unreadable member path: {e}")),
            }
        }

        if report.member_count > self.limits.max_members {
            report.reasons.push(format!(
                "too many members: {} > {}",
                report.member_count, self.limits.max_members
            ));
        }
        let max_uncompressed = self.limits.max_uncompressed_mb.saturating_mul(BYTES_PER_MB);
        if report.uncompressed_size > max_uncompressed {
            report.reasons.push(format!(
                "uncompressed size {} bytes exceeds limit of {} MB",
                report.uncompressed_size, self.limits.max_uncompressed_mb
            ));
        }
        Ok(())
    }

    /// Locate the directory that holds `manifest.json`: the extraction
    /// root, or its single top-level directory when the archive carries
    /// one wrapping folder.
    fn find_skill_root(extract_dir: &Path) -> Option<PathBuf> {
        if extract_dir.join("manifest.json").is_file() {
            return Some(extract_dir.to_path_buf());
        }
        let mut dirs = Vec::new();
        let entries = std::fs::read_dir(extract_dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                return None; // loose files without a manifest at the root
            }
            dirs.push(path);
        }
        match dirs.as_slice() {
            [only] if only.join("manifest.json").is_file() => Some(only.clone()),
            _ => None,
        }
    }
}

impl SkillValidator for ManifestValidator {
    fn validate(
        &self,
        archive: &Path,
        extract_dir: &Path,
    ) -> Result<Result<ValidatedSkill, SafetyReport>, StoreError> {
        let archive_size = std::fs::metadata(archive)?.len();
        let mut report = SafetyReport {
            skill_id: None,
            archive_sha256: String::new(),
            archive_size,
            member_count: 0,
            uncompressed_size: 0,
            reasons: Vec::new(),
            checked_at: Utc::now(),
        };

        let max_archive = self.limits.max_archive_mb.saturating_mul(BYTES_PER_MB);
        if archive_size > max_archive {
            report.reasons.push(format!(
                "archive size {archive_size} bytes exceeds limit of {} MB",
                self.limits.max_archive_mb
            ));
            // Oversized archives are never opened or hashed.
            return Ok(Err(report));
        }
        report.archive_sha256 = {
            let bytes = std::fs::read(archive)?;
            hex::encode(Sha256::digest(&bytes))
        };

        self.scan_archive(archive, &mut report)?;
        if !report.passed() {
            warn!(archive = %archive.display(), reasons = report.reasons.len(), "archive rejected");
            return Ok(Err(report));
        }

        std::fs::create_dir_all(extract_dir)?;
        let file = File::open(archive)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        // unpack skips traversal targets even if the scan missed something
        if let Err(e) = tar.unpack(extract_dir) {
            report.reasons.push(format!("extraction failed: {e}"));
            return Ok(Err(report));
        }

        let Some(root) = Self::find_skill_root(extract_dir) else {
            report
                .reasons
                .push("no manifest.json at the archive root".to_owned());
            return Ok(Err(report));
        };

        let manifest = match Manifest::load(&root) {
            Ok(manifest) => manifest,
            Err(e) => {
                report.reasons.push(e.to_string());
                return Ok(Err(report));
            }
        };
        report.skill_id = Some(manifest.id.clone());
        report.reasons.extend(review_manifest(&manifest));

        if !manifest.entry.trim().is_empty() && !root.join(&manifest.entry).is_file() {
            report
                .reasons
                .push(format!("entry file '{}' missing from archive", manifest.entry));
        }

        if report.passed() {
            debug!(skill = %manifest.id, members = report.member_count, "archive passed safety checks");
            Ok(Ok(ValidatedSkill {
                manifest,
                root,
                report,
            }))
        } else {
            warn!(
                skill = ?report.skill_id,
                reasons = report.reasons.len(),
                "skill manifest rejected"
            );
            Ok(Err(report))
        }
    }
}
