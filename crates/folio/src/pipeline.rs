//! Scheduler and worker pool
//!
//! A run has three phases:
//! 1. Discovery: walk the input folder, fingerprint every `*.epub`, drop what
//!    the checkpoint already covers and mark in-run duplicates as skipped.
//! 2. Processing: `MAX_WORKERS` tasks drain one bounded queue. Each item goes
//!    validate -> extract -> enrich (cache first) -> classify -> organize.
//!    Outcomes flow back to a single collector that owns checkpointing.
//! 3. Reporting: flush the checkpoint and render both reports from it.

use crate::cache::CacheStore;
use crate::cancel::CancellationToken;
use crate::checkpoint::{
    CheckpointStatus, CheckpointStore, OutcomeSummary, RecordOutcome, ValidationResult,
};
use crate::classify::{classify, ClassificationResult};
use crate::config::FolioConfig;
use crate::document::{DocumentInspector, DocumentMetadata, EpubInspector};
use crate::enrichment::{
    lookup_with_timeout, EnrichmentData, EnrichmentGateway, HttpEnrichmentGateway,
};
use crate::error::{FolioError, ItemError, Result};
use crate::fingerprint::{self, FileIdentity, Fingerprint, FingerprintStrength};
use crate::organize;
use crate::report::{self, ReportPaths};
use crate::rules::RuleSet;
use crate::status::{self, StatusResolution};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn, Instrument};
use walkdir::WalkDir;

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    /// Skipped because the checkpoint already had them.
    pub resumed: usize,
    /// Recorded as `Skipped` because an earlier file has the same content.
    pub duplicates: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Left unfinished because the run was cancelled.
    pub abandoned: usize,
    pub conflicts: usize,
    pub cache_hits: usize,
    pub gateway_calls: usize,
    pub cancelled: bool,
    pub reports: Option<ReportPaths>,
}

enum ItemOutcome {
    Finished {
        fingerprint: Fingerprint,
        status: CheckpointStatus,
        summary: OutcomeSummary,
    },
    Abandoned {
        fingerprint: Fingerprint,
    },
}

/// Shared, read-only state handed to every worker.
struct WorkerContext {
    config: Arc<FolioConfig>,
    rules: Arc<RuleSet>,
    inspector: Arc<dyn DocumentInspector>,
    gateway: Option<Arc<dyn EnrichmentGateway>>,
    cache: Option<Arc<CacheStore>>,
    cancel: CancellationToken,
    cache_hits: AtomicUsize,
    gateway_calls: AtomicUsize,
}

pub struct Pipeline {
    config: Arc<FolioConfig>,
    rules: Arc<RuleSet>,
    inspector: Arc<dyn DocumentInspector>,
    gateway: Option<Arc<dyn EnrichmentGateway>>,
    cache: Option<Arc<CacheStore>>,
    checkpoint: Arc<CheckpointStore>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate the configuration and open both stores.
    pub fn from_config(config: Arc<FolioConfig>) -> Result<Self> {
        config.validate()?;

        let checkpoint = Arc::new(CheckpointStore::open(config.checkpoint_path())?);
        let cache = if config.features.cache_enabled {
            let ttl = chrono::Duration::days(i64::from(config.cache.ttl_days));
            Some(Arc::new(CacheStore::open(config.cache_entries_dir(), ttl)?))
        } else {
            None
        };
        let gateway: Option<Arc<dyn EnrichmentGateway>> = if config.ai_allowed {
            Some(Arc::new(HttpEnrichmentGateway::from_config(&config)))
        } else {
            None
        };

        Ok(Self {
            rules: Arc::new(config.rule_set()),
            config,
            inspector: Arc::new(EpubInspector::new()),
            gateway,
            cache,
            checkpoint,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the enrichment gateway. It is still only consulted when
    /// `AI_ALLOWED` is set.
    pub fn with_gateway(mut self, gateway: Arc<dyn EnrichmentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn DocumentInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Replace the cache store (e.g. one driven by a manual clock). Ignored
    /// when caching is disabled.
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        if self.config.features.cache_enabled {
            self.cache = Some(cache);
        }
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let features = &self.config.features;
        info!(
            input = %self.config.paths.input_folder.display(),
            dry_run = features.dry_run,
            resume = features.resume_enabled,
            cache = features.cache_enabled,
            ai_allowed = self.config.ai_allowed,
            workers = self.config.system.max_workers,
            "Starting run"
        );
        if features.dry_run {
            info!("Dry run: input files will not be moved");
        }

        if !features.resume_enabled {
            let checkpoint = Arc::clone(&self.checkpoint);
            tokio::task::spawn_blocking(move || checkpoint.reset()).await??;
        }

        let mut summary = RunSummary::default();

        // Phase 1: discovery
        let identities = self.discover_all().await?;
        summary.discovered = identities.len();
        let pending = self.plan(identities, &mut summary)?;
        summary.dispatched = pending.len();
        info!(
            discovered = summary.discovered,
            resumed = summary.resumed,
            duplicates = summary.duplicates,
            pending = summary.dispatched,
            "Discovery finished"
        );

        // Phase 2: processing
        if !pending.is_empty() {
            self.process(pending, &mut summary).await?;
        }

        // Phase 3: checkpoint + reports
        let checkpoint = Arc::clone(&self.checkpoint);
        tokio::task::spawn_blocking(move || checkpoint.flush()).await??;

        let records = self.checkpoint.records();
        let reports_dir = self.config.reports_dir();
        let reports = tokio::task::spawn_blocking(move || report::write_reports(&records, &reports_dir))
            .await??;
        summary.reports = Some(reports);
        summary.cancelled = self.cancel.is_cancelled();

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.duplicates,
            resumed = summary.resumed,
            abandoned = summary.abandoned,
            conflicts = summary.conflicts,
            cache_hits = summary.cache_hits,
            gateway_calls = summary.gateway_calls,
            cancelled = summary.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(summary)
    }

    async fn discover_all(&self) -> Result<Vec<FileIdentity>> {
        let input = self.config.paths.input_folder.clone();
        if !input.is_dir() {
            warn!(input = %input.display(), "Input folder does not exist; nothing to do");
            return Ok(Vec::new());
        }
        let excluded = vec![
            self.config.paths.output_base_folder.clone(),
            self.config.paths.cache_dir.clone(),
        ];
        tokio::task::spawn_blocking(move || discover(&input, &excluded)).await?
    }

    /// Apply the resume filter and duplicate detection against both this
    /// discovery and earlier checkpoint records. Duplicates are recorded
    /// straight away; the rest is returned for dispatch.
    fn plan(
        &self,
        identities: Vec<FileIdentity>,
        summary: &mut RunSummary,
    ) -> Result<Vec<FileIdentity>> {
        let resume_set: HashSet<Fingerprint> = if self.config.features.resume_enabled {
            self.checkpoint.load_resume_set()
        } else {
            HashSet::new()
        };

        // Content already recorded by earlier runs keeps its first owner.
        let mut first_by_content: HashMap<String, String> = HashMap::new();
        for record in self.checkpoint.records() {
            if record.summary.duplicate_of.is_some() {
                continue;
            }
            if let Some(hash) = record.summary.content_hash {
                first_by_content.entry(hash).or_insert(record.summary.path);
            }
        }

        let mut pending = Vec::new();
        for identity in identities {
            let duplicate_of = identity.content_hash.as_ref().and_then(|hash| {
                match first_by_content.entry(hash.clone()) {
                    Entry::Occupied(first) => Some(first.get().clone()),
                    Entry::Vacant(slot) => {
                        slot.insert(identity.logical_path.clone());
                        None
                    }
                }
            });

            if resume_set.contains(&identity.fingerprint) {
                summary.resumed += 1;
                continue;
            }

            if let Some(original) = duplicate_of {
                debug!(path = %identity.logical_path, duplicate_of = %original, "Duplicate content");
                let mut outcome = OutcomeSummary::new(&identity.logical_path, ValidationResult::NotChecked);
                outcome.content_hash = identity.content_hash.clone();
                outcome.duplicate_of = Some(original);
                match self
                    .checkpoint
                    .record(identity.fingerprint.clone(), CheckpointStatus::Skipped, outcome)
                {
                    Ok(_) => summary.duplicates += 1,
                    Err(e) => {
                        error!(path = %identity.logical_path, error = %e, "Checkpoint conflict while recording duplicate");
                        summary.conflicts += 1;
                    }
                }
                continue;
            }

            pending.push(identity);
        }
        Ok(pending)
    }

    async fn process(&self, pending: Vec<FileIdentity>, summary: &mut RunSummary) -> Result<()> {
        let workers = self.config.system.max_workers.min(pending.len()).max(1);
        let save_interval = self.config.system.save_interval;
        let total = pending.len();

        let gateway = if self.config.ai_allowed {
            self.gateway.clone()
        } else {
            None
        };
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            rules: Arc::clone(&self.rules),
            inspector: Arc::clone(&self.inspector),
            gateway,
            cache: self.cache.clone(),
            cancel: self.cancel.clone(),
            cache_hits: AtomicUsize::new(0),
            gateway_calls: AtomicUsize::new(0),
        });

        let (work_tx, work_rx) = mpsc::channel::<FileIdentity>(workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<ItemOutcome>(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = Arc::clone(&ctx);
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, ctx, work_rx, done_tx)));
        }
        drop(done_tx);

        let cancel = self.cancel.clone();
        let producer = tokio::spawn(async move {
            for item in pending {
                if cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    sent = work_tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        let mut finished = 0usize;
        while let Some(outcome) = done_rx.recv().await {
            match outcome {
                ItemOutcome::Finished {
                    fingerprint,
                    status,
                    summary: outcome,
                } => {
                    let path = outcome.path.clone();
                    match self.checkpoint.record(fingerprint, status, outcome) {
                        Ok(RecordOutcome::Recorded) | Ok(RecordOutcome::AlreadyRecorded) => {
                            match status {
                                CheckpointStatus::Success => summary.succeeded += 1,
                                CheckpointStatus::Failed => summary.failed += 1,
                                CheckpointStatus::Skipped => summary.duplicates += 1,
                            }
                        }
                        Err(e) => {
                            error!(path = %path, error = %e, "Checkpoint conflict; item processed twice");
                            summary.conflicts += 1;
                        }
                    }
                    finished += 1;
                    if finished % save_interval == 0 {
                        let checkpoint = Arc::clone(&self.checkpoint);
                        let written = tokio::task::spawn_blocking(move || checkpoint.flush()).await??;
                        info!(done = finished, total, flushed = written, "Progress");
                    }
                }
                ItemOutcome::Abandoned { fingerprint } => {
                    debug!(fingerprint = %fingerprint, "Item abandoned");
                }
            }
        }

        producer.await?;
        for handle in handles {
            handle.await?;
        }

        summary.abandoned = total - finished;
        summary.cache_hits = ctx.cache_hits.load(Ordering::Relaxed);
        summary.gateway_calls = ctx.gateway_calls.load(Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Discovery
// ============================================================================

fn is_epub(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("epub"))
        .unwrap_or(false)
}

/// Every `*.epub` under `root`, fingerprinted, sorted by logical path.
/// Directories in `excluded` (output and cache folders) are not entered.
pub fn discover(root: &Path, excluded: &[PathBuf]) -> Result<Vec<FileIdentity>> {
    let root = root
        .canonicalize()
        .map_err(|e| FolioError::storage(root, e))?;
    let excluded: Vec<PathBuf> = excluded
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .filter(|p| p != &root)
        .collect();

    let mut paths = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !excluded.iter().any(|x| entry.path() == x));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_epub(entry.path()) => {
                paths.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Skipping unreadable directory entry"),
        }
    }

    let mut identities: Vec<FileIdentity> = paths
        .iter()
        .map(|path| fingerprint::identify(&root, path))
        .collect();
    identities.sort_by(|a, b| a.logical_path.cmp(&b.logical_path));
    Ok(identities)
}

// ============================================================================
// Workers
// ============================================================================

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    work_rx: Arc<Mutex<mpsc::Receiver<FileIdentity>>>,
    done_tx: mpsc::Sender<ItemOutcome>,
) {
    debug!(worker = worker_id, "Worker started");
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                _ = ctx.cancel.cancelled() => None,
            }
        };
        let Some(item) = next else {
            break;
        };

        let span = tracing::info_span!("item", worker = worker_id, path = %item.logical_path);
        let outcome = process_item(&ctx, item).instrument(span).await;
        if done_tx.send(outcome).await.is_err() {
            break;
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn failed(
    item: &FileIdentity,
    validation: ValidationResult,
    err: &ItemError,
    classification: Option<ClassificationResult>,
) -> ItemOutcome {
    warn!(error = %err, kind = %err.kind(), "Item failed");
    let mut summary = OutcomeSummary::new(&item.logical_path, validation);
    summary.content_hash = item.content_hash.clone();
    summary.classification = classification;
    summary.error_kind = Some(err.kind());
    summary.error_message = Some(err.to_string());
    ItemOutcome::Finished {
        fingerprint: item.fingerprint.clone(),
        status: CheckpointStatus::Failed,
        summary,
    }
}

fn abandoned(item: &FileIdentity) -> ItemOutcome {
    ItemOutcome::Abandoned {
        fingerprint: item.fingerprint.clone(),
    }
}

/// Run blocking inspector work off the async threads.
async fn inspect<T, F>(ctx: &WorkerContext, path: &Path, op: F) -> std::result::Result<T, ItemError>
where
    T: Send + 'static,
    F: FnOnce(&dyn DocumentInspector, &Path) -> std::result::Result<T, ItemError> + Send + 'static,
{
    let inspector = Arc::clone(&ctx.inspector);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || op(inspector.as_ref(), &path))
        .await
        .map_err(|e| ItemError::Extraction(format!("inspector task failed: {}", e)))?
}

async fn process_item(ctx: &WorkerContext, item: FileIdentity) -> ItemOutcome {
    if item.strength == FingerprintStrength::Weak {
        let err = ItemError::UnreadableFile {
            path: item.logical_path.clone(),
            message: "content could not be read during discovery".to_string(),
        };
        return failed(&item, ValidationResult::Unreadable, &err, None);
    }

    // Validating
    if let Err(err) = inspect(ctx, &item.path, |i, p| i.validate(p)).await {
        let validation = match err {
            ItemError::UnreadableFile { .. } => ValidationResult::Unreadable,
            _ => ValidationResult::Invalid,
        };
        return failed(&item, validation, &err, None);
    }
    if ctx.cancel.is_cancelled() {
        return abandoned(&item);
    }

    // Extracting
    let mut metadata = match inspect(ctx, &item.path, |i, p| i.extract(p)).await {
        Ok(metadata) => metadata,
        Err(err) => return failed(&item, ValidationResult::Valid, &err, None),
    };
    metadata.content_hash = item.content_hash.clone().unwrap_or_default();

    // Cache / gateway
    let enrichment = enrich(ctx, &item, &metadata).await;
    if ctx.cancel.is_cancelled() {
        return abandoned(&item);
    }

    // Classifying
    let result = classify(&metadata, &ctx.rules, enrichment.as_ref());
    let reader_status = if result.label.is_definite() {
        status::resolve(metadata.chapter_count, enrichment.as_ref())
    } else {
        StatusResolution {
            status: status::ReaderStatus::Unknown,
            reason: "unclassified".to_string(),
            confidence: 0.0,
        }
    };
    debug!(
        label = %result.label,
        confidence = result.confidence,
        reasons = ?result.reasons,
        status = reader_status.status.as_str(),
        "Classified"
    );

    // Organizing
    let mut final_path = None;
    if !ctx.config.features.dry_run && result.label.is_definite() {
        if ctx.cancel.is_cancelled() {
            return abandoned(&item);
        }
        let source = item.path.clone();
        let output_base = ctx.config.paths.output_base_folder.clone();
        let (res, stat, enr) = (result.clone(), reader_status.clone(), enrichment.clone());
        let moved = tokio::task::spawn_blocking(move || {
            organize::organize(&source, &output_base, &res, &stat, enr.as_ref())
        })
        .await
        .map_err(|e| ItemError::Organize(format!("organize task failed: {}", e)))
        .and_then(|r| r);
        match moved {
            Ok(dest) => final_path = Some(dest.display().to_string()),
            Err(err) => return failed(&item, ValidationResult::Valid, &err, Some(result)),
        }
    }

    let mut summary = OutcomeSummary::new(&item.logical_path, ValidationResult::Valid);
    summary.content_hash = item.content_hash.clone();
    summary.classification = Some(result);
    summary.reader_status = Some(reader_status);
    summary.enrichment_used = enrichment.is_some();
    summary.final_path = final_path;
    ItemOutcome::Finished {
        fingerprint: item.fingerprint.clone(),
        status: CheckpointStatus::Success,
        summary,
    }
}

fn cache_key(fingerprint: &Fingerprint) -> String {
    format!("enrichment:{}", fingerprint)
}

/// Cache first, gateway on miss. Any failure degrades to `None`.
async fn enrich(
    ctx: &WorkerContext,
    item: &FileIdentity,
    metadata: &DocumentMetadata,
) -> Option<EnrichmentData> {
    let gateway = ctx.gateway.as_ref()?;
    let key = cache_key(&item.fingerprint);

    if let Some(cache) = &ctx.cache {
        let cache = Arc::clone(cache);
        let lookup_key = key.clone();
        let hit = tokio::task::spawn_blocking(move || cache.get_as::<EnrichmentData>(&lookup_key))
            .await
            .ok()
            .flatten();
        if let Some(data) = hit {
            ctx.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Enrichment cache hit");
            return Some(data);
        }
    }

    ctx.gateway_calls.fetch_add(1, Ordering::Relaxed);
    let timeout = Duration::from_secs(ctx.config.enrichment.timeout_secs);
    let data = match lookup_with_timeout(gateway.as_ref(), metadata, timeout).await {
        Ok(data) => data,
        Err(e) => {
            warn!(gateway = gateway.name(), error = %e, "Enrichment unavailable; using static rules only");
            return None;
        }
    };

    if let Some(cache) = &ctx.cache {
        let cache = Arc::clone(cache);
        let value = data.clone();
        let stored = tokio::task::spawn_blocking(move || cache.put_as(&key, &value)).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to cache enrichment result"),
            Err(e) => warn!(error = %e, "Cache write task failed"),
        }
    }
    Some(data)
}
