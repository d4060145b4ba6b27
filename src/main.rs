//! CLI entry point for mediagrab.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mediagrab_core::{
    ClientPool, CsvReports, Database, Deduper, DownloadGates, Hasher, HistoryStore, Orchestrator,
    RunState, RunStats, ScraperRegistry, StorageMonitor, StreamDownloader, parse_input,
    parse_input_file,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("mediagrab starting");

    // Gather input: positional URLs win, then the input file.
    let input = if args.urls.is_empty() {
        let Some(input_file) = &args.input_file else {
            info!("No input provided. Pass URLs as arguments or use --input-file.");
            return Ok(());
        };
        parse_input_file(input_file).await?
    } else {
        parse_input(&args.urls.join("\n"))
    };

    if input.is_empty() {
        info!("No valid URLs found in input");
        return Ok(());
    }
    info!(urls = input.len(), groups = input.groups.len(), "parsed input");

    let settings = args.to_settings();

    // Fatal startup errors (schema too old, unreadable database) abort here.
    let db = Database::new(&settings.runtime.db_file).await?;
    let history = HistoryStore::new(db.clone(), settings.runtime.ignore_history);

    let stats = Arc::new(RunStats::new());
    let hasher = Arc::new(Hasher::new(
        history.clone(),
        Arc::clone(&stats),
        &settings.dedupe,
    ));
    let deduper = Deduper::new(
        history.clone(),
        Arc::clone(&stats),
        settings.dedupe.auto_dedupe,
        settings.dedupe.send_deleted_to_trash,
    );
    let clients = Arc::new(ClientPool::new(&settings)?);
    clients
        .load_netscape_cookies(std::path::Path::new("cookies"))
        .await?;
    let storage = StorageMonitor::new(settings.runtime.effective_required_free_space());
    let gates = Arc::new(DownloadGates::new(&settings));
    let reports = Arc::new(CsvReports::new(settings.runtime.log_folder.clone()));

    let (state_tx, state_rx) = watch::channel(RunState::Running);
    let downloader = Arc::new(StreamDownloader::new(
        settings.clone(),
        clients,
        history.clone(),
        Arc::clone(&storage),
        Arc::clone(&hasher),
        gates,
        Arc::clone(&stats),
        state_rx,
    ));

    let registry = Arc::new(ScraperRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        registry,
        downloader,
        hasher,
        deduper,
        reports,
        Arc::clone(&stats),
        state_tx,
    ));

    // First ctrl-c drains gracefully; a second one aborts hard.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight work");
                orchestrator.shutdown();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt; aborting");
                std::process::exit(1);
            }
        });
    }

    let spinner = spawn_spinner(!args.quiet, Arc::clone(&stats), input.len());

    let stats = orchestrator.run(&input).await;

    if let Some((handle, stop)) = spinner {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = handle.await;
    }
    storage.close().await;
    db.close().await;

    info!(
        completed = stats.completed(),
        failed = stats.failed(),
        skipped = stats.skipped(),
        previously_completed = stats.previously_completed(),
        removed_duplicates = stats.removed_duplicates(),
        unsupported = stats.unsupported(),
        "all done"
    );
    Ok(())
}

/// Spawns the progress spinner when the run is interactive.
fn spawn_spinner(
    enabled: bool,
    stats: Arc<RunStats>,
    total: usize,
) -> Option<(
    tokio::task::JoinHandle<()>,
    Arc<std::sync::atomic::AtomicBool>,
)> {
    use std::sync::atomic::{AtomicBool, Ordering};

    if !enabled {
        return None;
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop_flag.load(Ordering::SeqCst) {
            let done = stats.completed() + stats.failed() + stats.skipped()
                + stats.previously_completed();
            spinner.set_message(format!(
                "[{}/{total}] downloaded {} | failed {} | skipped {}",
                done.min(total),
                stats.completed(),
                stats.failed(),
                stats.skipped() + stats.previously_completed(),
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        spinner.finish_and_clear();
    });
    Some((handle, stop))
}
