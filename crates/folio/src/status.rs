//! Reader-facing completion status.

use crate::enrichment::EnrichmentData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Full,
    Ongoing,
    Unknown,
}

impl ReaderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderStatus::Full => "full",
            ReaderStatus::Ongoing => "ongoing",
            ReaderStatus::Unknown => "unknown",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ReaderStatus::Full => "Full",
            ReaderStatus::Ongoing => "Ongoing",
            ReaderStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResolution {
    pub status: ReaderStatus,
    pub reason: String,
    pub confidence: f64,
}

impl StatusResolution {
    fn unknown(reason: &str) -> Self {
        Self {
            status: ReaderStatus::Unknown,
            reason: reason.to_string(),
            confidence: 0.0,
        }
    }
}

/// Compare the local chapter count with the one reported by enrichment.
pub fn resolve(local_chapters: u32, enrichment: Option<&EnrichmentData>) -> StatusResolution {
    let Some(data) = enrichment else {
        return StatusResolution::unknown("no enrichment data");
    };
    let remote = match data.total_chapters {
        Some(n) if n > 0 => n,
        _ => return StatusResolution::unknown("enrichment has no chapter count"),
    };
    if local_chapters == 0 {
        return StatusResolution::unknown("local chapter count unavailable");
    }

    if local_chapters >= remote {
        StatusResolution {
            status: ReaderStatus::Full,
            reason: format!("local {} >= remote {}", local_chapters, remote),
            confidence: 0.9,
        }
    } else {
        StatusResolution {
            status: ReaderStatus::Ongoing,
            reason: format!("local {} < remote {}", local_chapters, remote),
            confidence: 0.9,
        }
    }
}
