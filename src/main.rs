// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use odm_embed::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Drives the download coordinator the way an embedding host would:
/// start, poll, finalize, clean up.
#[derive(Parser, Debug)]
#[command(name = "odm-embed", version)]
struct Cli {
    /// Directory holding the transfer database and temp files
    #[arg(long, env = "ODM_DATA_DIR", default_value = "odm-data")]
    data_dir: PathBuf,

    /// tracing filter used when RUST_LOG is unset
    #[arg(long, env = "ODM_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a URL, wait for it, and move it into place
    Fetch {
        url: String,
        destination: PathBuf,
        /// Expected SHA-256 of the file, checked before moving it
        #[arg(long)]
        sha256: Option<String>,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,
    },
    /// Print the status code, progress and error of a handle
    Status { handle: u64 },
    /// Move a completed download (empty destination uses the one given at start)
    Move {
        handle: u64,
        #[arg(default_value = "")]
        destination: PathBuf,
    },
    /// Forget a handle and delete its temp file
    Cleanup { handle: u64 },
    /// Remove finished transfers older than the given age
    Prune {
        #[arg(long, default_value_t = 7 * 24 * 3600)]
        max_age_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    odm_embed::init_logging(&cli.log);

    let config = DownloaderConfig::new().data_dir(&cli.data_dir).log_filter(&cli.log);
    let manager = DownloadManager::open(&config)
        .await
        .with_context(|| format!("opening {}", cli.data_dir.display()))?;

    match cli.command {
        Command::Fetch { url, destination, sha256, poll_ms } => {
            let handle = manager.start(&url, &destination).await?;
            info!("[ACTION] Started {} as handle {}", url, handle);

            loop {
                tokio::time::sleep(Duration::from_millis(poll_ms)).await;
                let code = manager.status(handle).await.code();
                match code {
                    100 => break,
                    c if c < 0 => {
                        let reason = manager.error(handle).await;
                        manager.cleanup(handle).await;
                        bail!("download failed (status {}): {}", c, reason);
                    }
                    c => info!("[PROGRESS] {}%", c),
                }
            }

            if let Some(expected) = sha256 {
                if !manager.verify_file(handle, &expected).await? {
                    manager.cleanup(handle).await;
                    bail!("checksum mismatch for {}", url);
                }
                info!("[VERIFY] sha256 matches");
            }

            let moved = manager.try_move_file(handle, &destination).await?;
            manager.cleanup(handle).await;
            info!("[DONE] {}", moved.display());
        }
        Command::Status { handle } => {
            let status = manager.status(handle).await;
            println!("status:   {}", status.code());
            if let Some(progress) = manager.progress(handle).await {
                println!("progress: {:.1}%", progress * 100.0);
            }
            let error = manager.error(handle).await;
            if !error.is_empty() {
                println!("error:    {}", error);
            }
        }
        Command::Move { handle, destination } => {
            let moved = manager.try_move_file(handle, &destination).await?;
            println!("{}", moved.display());
        }
        Command::Cleanup { handle } => manager.cleanup(handle).await,
        Command::Prune { max_age_secs } => {
            let max_age = chrono::Duration::try_seconds(max_age_secs)
                .context("max age out of range")?;
            let removed = manager.cleanup_stale(max_age).await?;
            println!("removed {} stale transfers", removed);
        }
    }

    Ok(())
}
