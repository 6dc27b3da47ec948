//! Append-only checkpoint log.
//!
//! One JSON line per terminal record. The log is replayed into memory at open;
//! new records are buffered and appended on [`CheckpointStore::flush`].

use crate::classify::ClassificationResult;
use crate::error::ErrorKind;
use crate::fingerprint::Fingerprint;
use crate::status::StatusResolution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error(
        "fingerprint {fingerprint} already recorded as {existing}, refusing {attempted}"
    )]
    Conflict {
        fingerprint: Fingerprint,
        existing: CheckpointStatus,
        attempted: CheckpointStatus,
    },

    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Terminal processing state of a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Success,
    Failed,
    Skipped,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Success => "success",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of structural validation as shown in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    Invalid,
    Unreadable,
    NotChecked,
}

impl ValidationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationResult::Valid => "valid",
            ValidationResult::Invalid => "invalid",
            ValidationResult::Unreadable => "unreadable",
            ValidationResult::NotChecked => "not_checked",
        }
    }
}

/// Everything the reports need about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub path: String,
    pub validation: ValidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_status: Option<StatusResolution>,
    #[serde(default)]
    pub enrichment_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
}

impl OutcomeSummary {
    pub fn new(path: impl Into<String>, validation: ValidationResult) -> Self {
        Self {
            path: path.into(),
            validation,
            content_hash: None,
            classification: None,
            reader_status: None,
            enrichment_used: false,
            duplicate_of: None,
            error_kind: None,
            error_message: None,
            final_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub fingerprint: Fingerprint,
    pub status: CheckpointStatus,
    pub summary: OutcomeSummary,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Same fingerprint and status already present; nothing changed.
    AlreadyRecorded,
}

#[derive(Default)]
struct CheckpointState {
    records: HashMap<Fingerprint, CheckpointRecord>,
    pending: Vec<CheckpointRecord>,
    /// The log ends mid-line; the next append must start on a fresh line.
    needs_newline: bool,
}

pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointState>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .finish()
    }
}

impl CheckpointStore {
    /// Open (or create) the log at `path` and replay it. Unparseable lines,
    /// such as a tail cut short by a crash, are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }

        let mut state = CheckpointState::default();
        if path.exists() {
            let content = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
            let mut skipped = 0usize;
            for (idx, line) in content.split(|b| *b == b'\n').enumerate() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<CheckpointRecord>(line) {
                    Ok(record) => {
                        // First record for a fingerprint wins.
                        state
                            .records
                            .entry(record.fingerprint.clone())
                            .or_insert(record);
                    }
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(
                            path = %path.display(),
                            line = idx + 1,
                            error = %e,
                            "Skipping unreadable checkpoint line"
                        );
                    }
                }
            }
            state.needs_newline = content.last().map(|b| *b != b'\n').unwrap_or(false);
            tracing::info!(
                path = %path.display(),
                records = state.records.len(),
                skipped,
                "Checkpoint log loaded"
            );
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_completed(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().records.contains_key(fingerprint)
    }

    /// Fingerprints already in a terminal state.
    pub fn load_resume_set(&self) -> HashSet<Fingerprint> {
        self.lock().records.keys().cloned().collect()
    }

    /// Record a terminal outcome. Idempotent for an equal status; a different
    /// status for a recorded fingerprint is a conflict and changes nothing.
    pub fn record(
        &self,
        fingerprint: Fingerprint,
        status: CheckpointStatus,
        summary: OutcomeSummary,
    ) -> Result<RecordOutcome, CheckpointError> {
        let mut state = self.lock();
        if let Some(existing) = state.records.get(&fingerprint) {
            if existing.status == status {
                return Ok(RecordOutcome::AlreadyRecorded);
            }
            return Err(CheckpointError::Conflict {
                fingerprint,
                existing: existing.status,
                attempted: status,
            });
        }

        let record = CheckpointRecord {
            fingerprint: fingerprint.clone(),
            status,
            summary,
            recorded_at: Utc::now(),
        };
        state.pending.push(record.clone());
        state.records.insert(fingerprint, record);
        Ok(RecordOutcome::Recorded)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Append pending records and fsync. Returns how many were written. On
    /// failure the records stay pending for the next attempt.
    pub fn flush(&self) -> Result<usize, CheckpointError> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        if state.needs_newline {
            buf.push(b'\n');
        }
        for record in &state.pending {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        file.write_all(&buf)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| CheckpointError::io(&self.path, e))?;

        let written = state.pending.len();
        state.pending.clear();
        state.needs_newline = false;
        tracing::debug!(path = %self.path.display(), written, "Checkpoint flushed");
        Ok(written)
    }

    /// All records, ordered by logical path then fingerprint.
    pub fn records(&self) -> Vec<CheckpointRecord> {
        let mut records: Vec<CheckpointRecord> = self.lock().records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.summary
                .path
                .cmp(&b.summary.path)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything, on disk and in memory.
    pub fn reset(&self) -> Result<(), CheckpointError> {
        let mut state = self.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CheckpointError::io(&self.path, e)),
        }
        state.records.clear();
        state.pending.clear();
        state.needs_newline = false;
        tracing::info!(path = %self.path.display(), "Checkpoint log reset");
        Ok(())
    }
}
