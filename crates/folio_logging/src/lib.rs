//! Shared logging utilities for Folio binaries.
//!
//! Log records go to a size-rotated file and to stderr. The file location is
//! taken from the configured log file when one is given, otherwise from
//! `~/.folio/logs/<app>.log`. When the file cannot be opened, logging
//! continues on stderr alone.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "folio=info,folio_logging=info";
const VERBOSE_LOG_FILTER: &str = "folio=debug,folio_logging=debug";

/// Logging configuration shared by Folio binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Explicit log file (e.g. `PATHS.LOG_FILE`). Its parent directory holds
    /// the rotated files and its stem becomes the base name.
    pub log_file: Option<&'a Path>,
}

/// Where log records ended up after [`init_logging`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// Rotated file plus stderr.
    File(PathBuf),
    /// The file could not be opened; stderr only.
    ConsoleOnly { reason: String },
}

/// How many bytes one log file may hold and how many generations to keep
/// (the active file included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub generations: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            generations: 5,
        }
    }
}

fn filter_for(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global subscriber. Fails only when a subscriber is already
/// installed; an unusable log file degrades to stderr-only output.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogOutput> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(filter_for(config.verbose));

    let file = resolve_log_target(&config)
        .and_then(|(dir, base)| RotatingLog::open(&dir, &base, RotationPolicy::default()));

    match file {
        Ok(log) => {
            let path = log.path().to_path_buf();
            tracing_subscriber::registry()
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(LogFileWriter::new(log))
                        .with_ansi(false)
                        .with_filter(filter_for(config.verbose)),
                )
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(LogOutput::File(path))
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            tracing_subscriber::registry()
                .with(console)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            tracing::warn!(reason = %reason, "File logging unavailable; logging to stderr only");
            Ok(LogOutput::ConsoleOnly { reason })
        }
    }
}

/// Get the Folio home directory: ~/.folio (overridable with `FOLIO_HOME`).
pub fn folio_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("FOLIO_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    dirs::home_dir()
        .map(|home| home.join(".folio"))
        .context("Could not determine home directory")
}

/// Get the default logs directory: ~/.folio/logs
pub fn logs_dir() -> Result<PathBuf> {
    Ok(folio_home()?.join("logs"))
}

fn resolve_log_target(config: &LogConfig<'_>) -> Result<(PathBuf, String)> {
    let Some(file) = config.log_file else {
        return Ok((logs_dir()?, log_base_name(config.app_name)));
    };
    let dir = file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.app_name.to_string());
    Ok((dir, log_base_name(&stem)))
}

/// Keep file names portable: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn log_base_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "folio".to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// Rotating file
// ============================================================================

/// Append-only log file that shifts `<base>.log` to `<base>.log.1`,
/// `.log.1` to `.log.2` and so on once it would exceed `max_bytes`.
struct RotatingLog {
    dir: PathBuf,
    base: String,
    policy: RotationPolicy,
    active: PathBuf,
    file: File,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, base: &str, policy: RotationPolicy) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
        let active = dir.join(format!("{}.log", base));
        let file = append_to(&active)
            .with_context(|| format!("Failed to open log file: {}", active.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut log = Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            policy,
            active,
            file,
            written,
        };
        if log.written > log.policy.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn path(&self) -> &Path {
        &self.active
    }

    fn generation(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base, n))
    }

    /// Start a fresh active file. With a single generation the active file is
    /// simply truncated.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let keep = self.policy.generations.max(1);
        if keep == 1 {
            self.file = File::create(&self.active)?;
        } else {
            remove_if_exists(&self.generation(keep - 1))?;
            for n in (1..keep - 1).rev() {
                rename_if_exists(&self.generation(n), &self.generation(n + 1))?;
            }
            rename_if_exists(&self.active, &self.generation(1))?;
            self.file = append_to(&self.active)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let would_overflow = self.written + buf.len() as u64 > self.policy.max_bytes;
        if self.written > 0 && would_overflow {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `MakeWriter` over one shared [`RotatingLog`]. Each event locks the file
/// for the duration of its write.
struct LogFileWriter {
    log: Mutex<RotatingLog>,
}

impl LogFileWriter {
    fn new(log: RotatingLog) -> Self {
        Self {
            log: Mutex::new(log),
        }
    }
}

struct LogFileHandle<'a> {
    log: &'a Mutex<RotatingLog>,
}

impl LogFileHandle<'_> {
    fn lock(&self) -> MutexGuard<'_, RotatingLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileHandle { log: &self.log }
    }
}

impl Write for LogFileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}
