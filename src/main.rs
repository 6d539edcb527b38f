use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use theme_sync::build::{compile, exit_code, plan, upload};
use theme_sync::classifier::Classifier;
use theme_sync::client::ThemeClient;
use theme_sync::config::{BuildArgs, Cli, Command, Config};
use theme_sync::dispatch::{DispatchOutcome, Dispatcher};
use theme_sync::error::SyncError;
use theme_sync::files::scan_sources;
use theme_sync::logging;
use theme_sync::queue::{RequestQueue, RetryPolicy};
use theme_sync::stats::BuildStats;
use theme_sync::transform::Transforms;
use theme_sync::watcher::{StopHandle, WatchReport, Watcher};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose)?;
    let config = Arc::new(Config::from_cli(&cli)?);

    if !config.source.exists() {
        bail!("Source directory not found: {}", config.source.display());
    }

    if config.destinations.is_empty() {
        warn!("no destinations configured, outputs are only written locally");
    }
    for destination in config.destinations.iter().filter(|d| d.token.is_none()) {
        warn!(
            destination = %destination.id,
            "no access token in the environment, requests will be rejected"
        );
    }

    // Setup Ctrl+C handler
    let shutdown = Arc::new(AtomicBool::new(false));
    let stop: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    {
        let shutdown = Arc::clone(&shutdown);
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = stop.get() {
                handle.stop();
            }
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    match &cli.command {
        Command::Watch(_) => watch(config, &shutdown, &stop),
        Command::Build(args) => build(config, args, &shutdown),
    }
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn request_queue(config: &Config) -> Result<RequestQueue> {
    let client = ThemeClient::new().context("Failed to build HTTP client")?;
    Ok(RequestQueue::new(
        config.destinations.clone(),
        Arc::new(client),
        RetryPolicy::from(&config.queue),
    ))
}

fn watch(
    config: Arc<Config>,
    shutdown: &AtomicBool,
    stop: &OnceLock<StopHandle>,
) -> Result<ExitCode> {
    let transforms = Arc::new(Transforms::from_config(Arc::clone(&config))?);
    let verbose = config.verbose;
    let cwd = config.cwd.clone();

    let summary = runtime()?.block_on(async {
        let dispatcher = Dispatcher::new(transforms, request_queue(&config)?);
        let watcher = Watcher::new(Classifier::new(Arc::clone(&config)), dispatcher);

        let handle = watcher.stop_handle();
        if shutdown.load(Ordering::SeqCst) {
            handle.stop();
        }
        let _ = stop.set(handle);

        let summary = watcher
            .run(move |report: WatchReport| {
                if verbose {
                    print_report(&cwd, &report);
                }
            })
            .await?;
        Ok::<_, anyhow::Error>(summary)
    })?;

    println!(
        "Delivered {} request(s), {} failed, {} retried",
        summary.delivered, summary.failed, summary.retried
    );

    if summary.failed > 0 {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_report(cwd: &Path, report: &WatchReport) {
    let path = report.path.strip_prefix(cwd).unwrap_or(&report.path);
    match &report.outcome {
        Ok(DispatchOutcome::Enqueued { kind, key, tickets }) => eprintln!(
            "[{}] {} -> {} ({:?}, {} destination(s))",
            report.raw.as_str(),
            path.display(),
            key,
            kind,
            tickets.len()
        ),
        Ok(DispatchOutcome::Failed { key, error }) => {
            eprintln!("[{}] {} -> {}: FAILED: {}", report.raw.as_str(), path.display(), key, error)
        }
        Err(error) => {
            eprintln!("[{}] {}: skipped ({})", report.raw.as_str(), path.display(), error)
        }
    }
}

fn build(config: Arc<Config>, args: &BuildArgs, shutdown: &AtomicBool) -> Result<ExitCode> {
    // Configure Rayon thread pool
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.jobs)
        .build_global()
        .ok();

    let start = Instant::now();

    let mut files = Vec::new();
    for root in &config.watch {
        match scan_sources(root, shutdown) {
            Ok(found) => files.extend(found),
            Err(SyncError::Cancelled) => {
                eprintln!("\nBuild cancelled");
                return Ok(ExitCode::from(130));
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to scan {}", root.display())),
        }
    }
    files.sort();
    files.dedup();

    let classifier = Classifier::new(Arc::clone(&config));
    let (descriptors, skipped) = plan(&classifier, &files);
    let transforms = Transforms::from_config(Arc::clone(&config))?;

    if config.verbose {
        eprintln!(
            "Building {} file(s) ({} skipped) with {} worker(s)",
            descriptors.len(),
            skipped,
            args.jobs
        );
    }

    // Setup progress bar (only in verbose mode)
    let progress = if config.verbose {
        let pb = ProgressBar::new(descriptors.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let stats = BuildStats::new();
    let compiled = match compile(&transforms, &descriptors, shutdown, &stats, progress.as_ref()) {
        Ok(compiled) => compiled,
        Err(SyncError::Cancelled) => {
            eprintln!("\nBuild cancelled");
            return Ok(ExitCode::from(130));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(pb) = progress {
        pb.finish_with_message("Complete");
    }

    info!(artifacts = compiled.artifacts.len(), "uploading");
    let summary = runtime()?.block_on(async {
        let queue = request_queue(&config)?;
        Ok::<_, anyhow::Error>(upload(queue, &compiled.artifacts).await)
    })?;

    let duration = start.elapsed();
    let total_files = stats.files_written.get();
    let throughput = if duration.as_secs_f64() > 0.0 {
        total_files as f64 / duration.as_secs_f64()
    } else {
        0.0
    };

    // Print summary
    println!(
        "Built {} files ({} bytes) in {:.2}s ({:.0} files/sec)",
        total_files,
        stats.bytes_written.get(),
        duration.as_secs_f64(),
        throughput
    );
    println!(
        "Delivered {} request(s) to {} destination(s), {} failed, {} retried",
        summary.delivered,
        config.destinations.len(),
        summary.failed,
        summary.retried
    );
    for failure in &compiled.failures {
        println!("  {}: FAILED: {}", config.relative(&failure.path), failure.error);
    }

    if shutdown.load(Ordering::Relaxed) {
        eprintln!("\nBuild cancelled");
        return Ok(ExitCode::from(130));
    }

    Ok(ExitCode::from(exit_code(&compiled, &summary, config.destinations.len())))
}
