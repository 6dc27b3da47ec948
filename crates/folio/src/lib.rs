//! Folio: resumable, concurrent EPUB classification.
//!
//! Discovers `*.epub` files, fingerprints them, classifies each as a human
//! translation or a machine conversion, optionally enriches metadata through
//! a remote gateway, moves files into an organized tree and writes reports.
//! A checkpoint log makes runs resumable after a crash or Ctrl+C.

pub mod cache;
pub mod cancel;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod document;
pub mod enrichment;
pub mod error;
pub mod fingerprint;
pub mod organize;
pub mod pipeline;
pub mod report;
pub mod rules;
pub mod status;

pub use cache::CacheStore;
pub use cancel::CancellationToken;
pub use checkpoint::{CheckpointRecord, CheckpointStatus, CheckpointStore};
pub use classify::{classify, ClassificationResult};
pub use config::FolioConfig;
pub use document::{DocumentInspector, DocumentMetadata, EpubInspector};
pub use enrichment::{EnrichmentData, EnrichmentError, EnrichmentGateway};
pub use error::{FolioError, ItemError, Result};
pub use fingerprint::Fingerprint;
pub use pipeline::{Pipeline, RunSummary};
pub use rules::{Label, Rule, RuleSet};
