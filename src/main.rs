// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use odm::prelude::*;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "odm", version, about = "Segmented HTTP downloader", long_about = None)]
struct Cli {
    /// Where download records are kept between runs.
    #[arg(long, global = true, default_value = "downloads.db")]
    db: PathBuf,
    /// Directory for per-segment temp files.
    #[arg(long, global = true)]
    scratch: Option<PathBuf>,
    /// Global speed limit in bytes per second (0 = unlimited).
    #[arg(long, global = true, default_value_t = 0)]
    limit: u64,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a URL.
    #[command(alias = "g")]
    Get {
        url: String,
        /// Destination file. Defaults to the last path segment of the URL.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        segments: Option<usize>,
        /// Expected digest, e.g. `sha256:ab12...`.
        #[arg(long)]
        checksum: Option<ChecksumSpec>,
        #[arg(long, default_value_t = 0)]
        priority: Priority,
    },
    /// Continue a paused download.
    Resume { id: DownloadId },
    /// Retry a failed download.
    Retry { id: DownloadId },
    /// Show every known download.
    #[command(alias = "ls")]
    List,
    /// Delete a download's record and temp files.
    #[command(alias = "rm")]
    Remove { id: DownloadId },
    /// Forget completed downloads.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "odm=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::default().with_speed_limit(cli.limit);
    if let Some(scratch) = cli.scratch {
        config = config.with_scratch_dir(scratch);
    }

    let store = StateManager::new(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let manager = DownloadManager::new(store, config).await?;

    let result = match cli.cmd {
        Command::Get {
            url,
            output,
            segments,
            checksum,
            priority,
        } => {
            let destination = match output {
                Some(path) => path,
                None => file_name_from_url(&url)?,
            };
            let options = DownloadOptions {
                segments,
                priority,
                checksum,
                ..DownloadOptions::default()
            };
            let id = manager.add(&url, destination, options).await?;
            println!("{id}");
            follow(&manager, id).await
        }
        Command::Resume { id } => {
            manager.resume(id).await?;
            follow(&manager, id).await
        }
        Command::Retry { id } => {
            manager.retry(id).await?;
            follow(&manager, id).await
        }
        Command::List => {
            for job in manager.list().await {
                print_job(&job);
            }
            Ok(())
        }
        Command::Remove { id } => {
            manager.remove(id).await?;
            Ok(())
        }
        Command::Clear => {
            let removed = manager.clear_completed().await?;
            println!("removed {removed} completed download(s)");
            Ok(())
        }
    };

    manager.shutdown().await?;
    result
}

/// Prints progress until the download settles. Ctrl-C pauses it.
async fn follow(manager: &DownloadManager, id: DownloadId) -> Result<()> {
    let mut events = manager.subscribe();
    loop {
        let job = manager.get(id).await?;
        match job.status {
            JobStatus::Completed => {
                eprintln!();
                println!("saved {}", job.destination.display());
                return Ok(());
            }
            JobStatus::Paused => {
                eprintln!();
                println!("paused; continue with `odm resume {id}`");
                return Ok(());
            }
            JobStatus::Cancelled => bail!("download {id} was cancelled"),
            JobStatus::Failed if !retry_pending(manager, &job) => {
                let reason = job.last_error.map(|e| e.to_string()).unwrap_or_default();
                bail!("download {id} failed: {reason}");
            }
            _ => {}
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(DownloadEvent::Progress(update)) if update.id == id => print_progress(&update),
                Ok(DownloadEvent::RetryScheduled { id: event_id, attempt, max_attempts, delay, .. }) if event_id == id => {
                    eprintln!("\nretrying ({attempt}/{max_attempts}) in {delay:?}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("engine stopped"),
            },
            _ = tokio::signal::ctrl_c() => match manager.pause(id).await {
                // Already settled; the next pass reports how.
                Ok(()) | Err(ManagerError::InvalidStateTransition(_)) => {}
                Err(e) => return Err(e.into()),
            },
        }
    }
}

fn retry_pending(manager: &DownloadManager, job: &DownloadJob) -> bool {
    let config = manager.config();
    config.auto_retry
        && job.last_error.as_ref().is_some_and(FailureReason::is_auto_retryable)
        && job.retry_count + 1 < config.retry.max_attempts
}

fn print_progress(update: &ProgressUpdate) {
    let speed = update.speed_bps / 1024.0;
    let line = match update.total_bytes {
        Some(total) if total > 0 => {
            let percent = update.bytes_downloaded as f64 * 100.0 / total as f64;
            let eta = update
                .eta_seconds
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "?".into());
            format!("{percent:6.2}%  {}/{total} B  {speed:.1} KiB/s  eta {eta}", update.bytes_downloaded)
        }
        _ => format!("{} B  {speed:.1} KiB/s", update.bytes_downloaded),
    };
    let mut err = std::io::stderr();
    let _ = write!(err, "\r{line:<72}");
    let _ = err.flush();
}

fn print_job(job: &DownloadJob) {
    let progress = job
        .progress()
        .map(|p| format!("{:.1}%", p * 100.0))
        .unwrap_or_else(|| "-".into());
    println!(
        "{}  {:<11} {:>6}  {}  {}",
        job.id,
        job.status.as_str(),
        progress,
        job.destination.display(),
        job.url
    );
}

fn file_name_from_url(url: &str) -> Result<PathBuf> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid url {url}"))?;
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("index.html");
    Ok(PathBuf::from(name))
}
