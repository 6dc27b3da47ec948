//! Error types for Folio
//!
//! Two tiers: [`FolioError`] aborts a run (bad configuration, unusable
//! storage), [`ItemError`] is confined to a single file and ends up in its
//! checkpoint record.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::cache::CacheError;
use crate::checkpoint::CheckpointError;

/// Run-level error type
#[derive(Error, Debug)]
pub enum FolioError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Report error: {0}")]
    Report(#[from] csv::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FolioError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FolioError>;

/// Failure of one file. Never escapes the worker that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("Unreadable file {path}: {message}")]
    UnreadableFile { path: String, message: String },

    #[error("Not a valid EPUB: {0}")]
    Validation(String),

    #[error("Metadata extraction failed: {0}")]
    Extraction(String),

    #[error("Could not organize file: {0}")]
    Organize(String),
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItemError::UnreadableFile { .. } => ErrorKind::UnreadableFile,
            ItemError::Validation(_) => ErrorKind::Validation,
            ItemError::Extraction(_) => ErrorKind::Extraction,
            ItemError::Organize(_) => ErrorKind::Organize,
        }
    }
}

/// Error category carried in checkpoint records and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableFile,
    Validation,
    Extraction,
    Organize,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnreadableFile => "unreadable_file",
            ErrorKind::Validation => "validation",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Organize => "organize",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names_match_serialized_form() {
        let errors = [
            ItemError::UnreadableFile {
                path: "a.epub".to_string(),
                message: "permission denied".to_string(),
            },
            ItemError::Validation("missing mimetype".to_string()),
            ItemError::Extraction("no title".to_string()),
            ItemError::Organize("target exists".to_string()),
        ];
        for error in &errors {
            let kind = error.kind();
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(
            serde_json::from_str::<ErrorKind>("\"unreadable_file\"").unwrap(),
            ErrorKind::UnreadableFile
        );
    }
}
