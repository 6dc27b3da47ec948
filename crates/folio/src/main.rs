//! Folio command-line entry point
//!
//! Exit codes: 0 on a completed run, 1 on a configuration or storage error,
//! 130 when the run was interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use folio::cache::CacheStore;
use folio::{CancellationToken, FolioConfig, Pipeline};
use folio_logging::LogConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Classify and organize EPUB libraries")]
struct Cli {
    /// Path to the configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long, env = "FOLIO_CONFIG")]
    config: PathBuf,

    /// Classify and report without moving any file
    #[arg(long)]
    dry_run: bool,

    /// Ignore and reset the checkpoint log
    #[arg(long)]
    no_resume: bool,

    /// Do not read or write the enrichment cache
    #[arg(long)]
    no_cache: bool,

    /// Remove every cached enrichment entry and exit
    #[arg(long)]
    clear_cache: bool,

    /// Verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match FolioConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(cli.dry_run, cli.no_resume, cli.no_cache);

    // An unusable log file degrades to stderr inside init_logging.
    if let Err(e) = folio_logging::init_logging(LogConfig {
        app_name: "folio",
        verbose: cli.verbose,
        log_file: Some(config.paths.log_file.as_path()),
    }) {
        eprintln!("Warning: logging unavailable: {:#}", e);
    }

    match run(cli, config) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: FolioConfig) -> Result<ExitCode> {
    if cli.clear_cache {
        let ttl = chrono::Duration::days(i64::from(config.cache.ttl_days));
        let store = CacheStore::open(config.cache_entries_dir(), ttl)
            .context("Failed to open enrichment cache")?;
        let removed = store.clear().context("Failed to clear enrichment cache")?;
        info!(removed, "Enrichment cache cleared");
        println!("Removed {} cached entries", removed);
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.system.max_workers.clamp(2, 16))
        .thread_name("folio")
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let pipeline = Pipeline::from_config(Arc::new(config))
        .context("Failed to initialize pipeline")?
        .with_cancellation(cancel);

    let summary = runtime.block_on(pipeline.run())?;

    println!(
        "Processed {} file(s): {} succeeded, {} failed, {} duplicate(s), {} resumed",
        summary.dispatched - summary.abandoned,
        summary.succeeded,
        summary.failed,
        summary.duplicates,
        summary.resumed
    );
    if let Some(reports) = &summary.reports {
        println!("Machine report: {}", reports.machine.display());
        println!("Human report:   {}", reports.human.display());
    }

    if summary.cancelled {
        println!(
            "Interrupted: {} file(s) left for the next run",
            summary.abandoned
        );
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, finishing in-flight files...", sig);
                cancel.cancel();
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, finishing in-flight files...");
            cancel.cancel();
        })?;
    }

    Ok(())
}
