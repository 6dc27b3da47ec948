//! Report aggregation
//!
//! Reports are projections of the checkpoint log only, so they can be
//! regenerated at any time and come out byte-identical for identical logs.

use crate::checkpoint::{CheckpointRecord, CheckpointStatus, ValidationResult};
use crate::error::{FolioError, Result};
use crate::rules::Label;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MACHINE_REPORT: &str = "MachineReport.csv";
pub const HUMAN_REPORT: &str = "HumanReport.csv";

/// One row of the machine report: everything known about a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub path: String,
    pub fingerprint: String,
    pub status: &'static str,
    pub validation: &'static str,
    pub label: String,
    pub confidence: String,
    pub reasons: String,
    pub chapter_count: String,
    pub title: String,
    pub author: String,
    pub reader_status: String,
    pub duplicate_of: String,
    pub error_kind: String,
    pub error_message: String,
    pub final_path: String,
}

/// Curated row for people browsing the library.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HumanRow {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Author")]
    pub author: String,
    #[serde(rename = "Chapters")]
    pub chapters: u32,
    #[serde(rename = "Reader Status")]
    pub reader_status: String,
    #[serde(rename = "Translation")]
    pub translation: String,
    #[serde(rename = "Classification Status")]
    pub classification_status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub machine: PathBuf,
    pub human: PathBuf,
    pub machine_rows: usize,
    pub human_rows: usize,
}

impl ReportRow {
    pub fn from_record(record: &CheckpointRecord) -> Self {
        let summary = &record.summary;
        let classification = summary.classification.as_ref();
        let metadata = classification.map(|c| &c.metadata);

        Self {
            path: summary.path.clone(),
            fingerprint: record.fingerprint.to_string(),
            status: record.status.as_str(),
            validation: summary.validation.as_str(),
            label: classification
                .map(|c| c.label.as_str().to_string())
                .unwrap_or_default(),
            confidence: classification
                .map(|c| format!("{:.4}", c.confidence))
                .unwrap_or_default(),
            reasons: classification
                .map(|c| c.reasons.join(";"))
                .unwrap_or_default(),
            chapter_count: metadata
                .map(|m| m.chapter_count.to_string())
                .unwrap_or_default(),
            title: metadata.and_then(|m| m.title.clone()).unwrap_or_default(),
            author: metadata.and_then(|m| m.author.clone()).unwrap_or_default(),
            reader_status: summary
                .reader_status
                .as_ref()
                .map(|s| s.status.as_str().to_string())
                .unwrap_or_default(),
            duplicate_of: summary.duplicate_of.clone().unwrap_or_default(),
            error_kind: summary
                .error_kind
                .map(|k| k.as_str().to_string())
                .unwrap_or_default(),
            error_message: summary.error_message.clone().unwrap_or_default(),
            final_path: summary.final_path.clone().unwrap_or_default(),
        }
    }
}

impl HumanRow {
    /// Only successful, valid, definitely-labelled records make the cut.
    pub fn from_record(record: &CheckpointRecord) -> Option<Self> {
        if record.status != CheckpointStatus::Success
            || record.summary.validation != ValidationResult::Valid
        {
            return None;
        }
        let classification = record.summary.classification.as_ref()?;
        if classification.label == Label::Unclassified {
            return None;
        }
        let metadata = &classification.metadata;
        Some(Self {
            title: metadata.display_title().to_string(),
            author: metadata.author.clone().unwrap_or_default(),
            chapters: metadata.chapter_count,
            reader_status: record
                .summary
                .reader_status
                .as_ref()
                .map(|s| s.status.display_name().to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            translation: classification.label.display_name().to_string(),
            classification_status: "success",
        })
    }
}

/// Sort records canonically: logical path, then fingerprint.
pub fn canonical_order(records: &mut [CheckpointRecord]) {
    records.sort_by(|a, b| {
        a.summary
            .path
            .cmp(&b.summary.path)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
}

fn render_csv<T: Serialize>(rows: &[T], headers: &[&str]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!rows.is_empty())
        .from_writer(Vec::new());
    if rows.is_empty() {
        writer.write_record(headers)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| FolioError::Report(csv::Error::from(e.into_error())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let mut file = fs::File::create(&tmp).map_err(|e| FolioError::storage(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| FolioError::storage(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| FolioError::storage(path, e))
}

const MACHINE_HEADERS: &[&str] = &[
    "path",
    "fingerprint",
    "status",
    "validation",
    "label",
    "confidence",
    "reasons",
    "chapter_count",
    "title",
    "author",
    "reader_status",
    "duplicate_of",
    "error_kind",
    "error_message",
    "final_path",
];

const HUMAN_HEADERS: &[&str] = &[
    "Title",
    "Author",
    "Chapters",
    "Reader Status",
    "Translation",
    "Classification Status",
];

/// Render both reports in memory: (machine, human).
pub fn render_reports(records: &[CheckpointRecord]) -> Result<(Vec<u8>, Vec<u8>, usize, usize)> {
    let mut ordered = records.to_vec();
    canonical_order(&mut ordered);

    let machine_rows: Vec<ReportRow> = ordered.iter().map(ReportRow::from_record).collect();
    let human_rows: Vec<HumanRow> = ordered.iter().filter_map(HumanRow::from_record).collect();

    let machine = render_csv(&machine_rows, MACHINE_HEADERS)?;
    let human = render_csv(&human_rows, HUMAN_HEADERS)?;
    Ok((machine, human, machine_rows.len(), human_rows.len()))
}

/// Write `MachineReport.csv` and `HumanReport.csv` into `dir`.
pub fn write_reports(records: &[CheckpointRecord], dir: &Path) -> Result<ReportPaths> {
    fs::create_dir_all(dir).map_err(|e| FolioError::storage(dir, e))?;
    let (machine, human, machine_rows, human_rows) = render_reports(records)?;

    let paths = ReportPaths {
        machine: dir.join(MACHINE_REPORT),
        human: dir.join(HUMAN_REPORT),
        machine_rows,
        human_rows,
    };
    write_atomic(&paths.machine, &machine)?;
    write_atomic(&paths.human, &human)?;

    tracing::info!(
        machine = %paths.machine.display(),
        human = %paths.human.display(),
        machine_rows,
        human_rows,
        "Reports written"
    );
    Ok(paths)
}
