//! Quarantine storage for rejected skill submissions.
//!
//! A rejected archive is never deleted: it is moved, together with its
//! extracted tree and the full safety report, into a timestamped folder
//! under quarantine so an operator can inspect what was submitted and why
//! it was refused.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::gate::SafetyReport;
use super::{move_with_copy_fallback, StoreError};

const REPORT_FILE: &str = "safety_report.json";
const REASONS_FILE: &str = "reasons.txt";
const ORIGINAL_FILE: &str = "original.tar.gz";

/// One quarantined submission on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Skill id the submission claimed, or `unknown`.
    pub skill_id: String,
    /// When it was placed in quarantine.
    pub quarantined_at: DateTime<Utc>,
    /// Why the gate rejected it.
    pub reasons: Vec<String>,
    /// Folder holding the original archive and extracted tree.
    pub location: PathBuf,
}

/// Move a rejected submission into quarantine and write its record.
///
/// Layout: `<quarantine>/<skill_id>/<millis>/` containing the original
/// archive, the `extracted/` tree when extraction got that far, the
/// serialized report, and a plain-text reasons file.
pub fn quarantine_submission(
    quarantine_dir: &Path,
    archive: &Path,
    extracted: Option<&Path>,
    report: &SafetyReport,
) -> Result<QuarantineRecord, StoreError> {
    let skill_id = report
        .skill_id
        .clone()
        .unwrap_or_else(|| "unknown".to_owned());
    let quarantined_at = Utc::now();
    let bucket = quarantine_dir.join(&skill_id);
    let stamp = quarantined_at.timestamp_millis();
    // Rejections in the same millisecond must not share a folder.
    let mut folder = bucket.join(stamp.to_string());
    let mut seq = 1_u32;
    while folder.exists() {
        folder = bucket.join(format!("{stamp}_{seq}"));
        seq = seq.saturating_add(1);
    }
    std::fs::create_dir_all(&folder)?;

    move_with_copy_fallback(archive, &folder.join(ORIGINAL_FILE))?;
    if let Some(extracted) = extracted {
        if extracted.exists() {
            move_with_copy_fallback(extracted, &folder.join("extracted"))?;
        }
    }

    let record = QuarantineRecord {
        skill_id: skill_id.clone(),
        quarantined_at,
        reasons: report.reasons.clone(),
        location: folder.clone(),
    };

    let report_json = serde_json::to_string_pretty(report)
        .map_err(|e| StoreError::Manifest(format!("failed to serialize safety report: {e}")))?;
    std::fs::write(folder.join(REPORT_FILE), report_json)?;
    std::fs::write(folder.join(REASONS_FILE), record.reasons.join("\n"))?;

    warn!(
        skill = %skill_id,
        location = %folder.display(),
        reasons = record.reasons.len(),
        "submission quarantined"
    );
    Ok(record)
}

/// List every quarantined submission, newest first.
pub fn list_quarantined(quarantine_dir: &Path) -> Result<Vec<QuarantineRecord>, StoreError> {
    let mut records = Vec::new();
    if !quarantine_dir.exists() {
        return Ok(records);
    }

    for skill_entry in std::fs::read_dir(quarantine_dir)? {
        let skill_dir = skill_entry?.path();
        if !skill_dir.is_dir() {
            continue;
        }
        for stamp_entry in std::fs::read_dir(&skill_dir)? {
            let folder = stamp_entry?.path();
            let report_path = folder.join(REPORT_FILE);
            match read_record(&folder, &report_path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(folder = %folder.display(), error = %e, "unreadable quarantine record")
                }
            }
        }
    }

    records.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at));
    Ok(records)
}

fn read_record(
    folder: &Path,
    report_path: &Path,
) -> Result<Option<QuarantineRecord>, StoreError> {
    if !report_path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(report_path)?;
    let report: SafetyReport = serde_json::from_str(&contents)
        .map_err(|e| StoreError::Manifest(format!("corrupt safety report: {e}")))?;
    Ok(Some(QuarantineRecord {
        skill_id: report
            .skill_id
            .clone()
            .unwrap_or_else(|| "unknown".to_owned()),
        quarantined_at: report.checked_at,
        reasons: report.reasons,
        location: folder.to_path_buf(),
    }))
}

/// Delete one quarantined submission folder. Returns whether it existed.
pub fn purge(record: &QuarantineRecord) -> Result<bool, StoreError> {
    if !record.location.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&record.location)?;
    info!(skill = %record.skill_id, "quarantine record purged");
    Ok(true)
}
