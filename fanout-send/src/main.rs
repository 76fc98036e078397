//! fanout-send - worker that dispatches due publish jobs
//!
//! Polls the job table for pending jobs whose retry time has come and runs
//! each through the publish engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use libfanout::events::EventReceiver;
use libfanout::logging::{LogFormat, LoggingConfig};
use libfanout::notify::TracingNotifier;
use libfanout::{Config, JobOutcome, PublishEngine, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fanout-send")]
#[command(version)]
#[command(about = "Dispatch due publish jobs to their platforms")]
#[command(long_about = "\
fanout-send - worker that dispatches due publish jobs

DESCRIPTION:
    fanout-send polls the database for pending publish jobs whose retry
    time has come and runs each one through the publish engine: refresh the
    account's token if needed, publish to the platform, then record success
    or schedule a retry with backoff. Publication statuses are rolled up
    once every account has settled.

USAGE:
    # Run in foreground (logs to stderr)
    fanout-send

    # Poll every 5 seconds with JSON logs
    fanout-send --poll-interval 5 --log-format json

    # Process a single job and exit
    fanout-send --job 7f1c2a9e-...

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight jobs)

CONFIGURATION:
    Configuration file: $FANOUT_CONFIG or ~/.config/fanout/config.toml

    [worker]
    poll_interval_secs = 15
    batch_size = 20

    [retry]
    backoff_secs = [30, 120, 600]
    max_attempts = 3

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Credential or authentication error
    3 - Invalid input
")]
struct Cli {
    /// Configuration file (defaults to the standard location)
    #[arg(long, value_name = "PATH", env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json, pretty
    #[arg(long, value_name = "FORMAT", env = "FANOUT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Process one batch of due jobs and exit
    #[arg(long, conflicts_with = "job")]
    once: bool,

    /// Process a single job by id and exit
    #[arg(long, value_name = "ID")]
    job: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig {
        format: cli.log_format,
        ..LoggingConfig::from_env(cli.verbose)
    }
    .init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let engine = Arc::new(PublishEngine::from_config(&config, Arc::new(TracingNotifier)).await?);
    tokio::spawn(log_events(engine.subscribe()));

    if let Some(job_id) = cli.job.as_deref() {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(libfanout::FanoutError::InvalidInput(
                "Job id cannot be empty".to_string(),
            ));
        }
        let outcome = engine.process_job(job_id).await?;
        info!(job_id = %job_id, "Job processed: {:?}", outcome);
        return Ok(());
    }

    let batch_size = config.worker.batch_size.max(1);

    if cli.once {
        let processed = process_due_jobs(&engine, batch_size).await?;
        info!("fanout-send: processed {} job(s) once, exiting", processed);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli
        .poll_interval
        .unwrap_or(config.worker.poll_interval_secs)
        .max(1);
    info!(poll_interval, batch_size, "fanout-send worker starting");

    run_worker_loop(&engine, poll_interval, batch_size, shutdown).await;

    info!("fanout-send worker stopped");
    Ok(())
}

/// Log engine events at debug level
async fn log_events(mut receiver: EventReceiver) {
    loop {
        match receiver.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "fanout_send::events", "{}", json),
                Err(_) => debug!(target: "fanout_send::events", "{:?}", event),
            },
            Err(RecvError::Lagged(missed)) => {
                warn!("Event log fell behind, {} event(s) dropped", missed)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libfanout::FanoutError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, finishing in-flight jobs...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, finishing in-flight jobs...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

async fn run_worker_loop(
    engine: &PublishEngine,
    poll_interval: u64,
    batch_size: u32,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping worker loop");
            break;
        }

        if let Err(e) = process_due_jobs(engine, batch_size).await {
            error!("Error processing jobs: {}", e);
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Run every due job of one batch concurrently; returns how many were processed
async fn process_due_jobs(engine: &PublishEngine, batch_size: u32) -> Result<usize> {
    let now = chrono::Utc::now().timestamp();
    let due = engine.database().due_jobs(now, batch_size).await?;

    if due.is_empty() {
        debug!("No jobs due");
        return Ok(0);
    }

    info!("Found {} job(s) due", due.len());

    let results = join_all(due.iter().map(|job| engine.process_job(&job.id))).await;

    let mut processed = 0;
    for (job, result) in due.iter().zip(results) {
        match result {
            Ok(JobOutcome::Skipped) => debug!(job_id = %job.id, "Job skipped"),
            Ok(outcome) => {
                processed += 1;
                debug!(job_id = %job.id, "Job outcome: {:?}", outcome);
            }
            Err(e) => error!(job_id = %job.id, "Job processing error: {}", e),
        }
    }

    Ok(processed)
}
