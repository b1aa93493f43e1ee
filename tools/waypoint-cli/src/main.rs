//! Operator CLI for the Waypoint offline worker.
//!
//! Drives an `OfflineWorker` over the on-disk stores in the configured data
//! directory, one event per invocation.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the configured version and activate it
//! waypoint --config waypoint.json install
//!
//! # Fetch through the worker, as a page navigation
//! waypoint fetch /courses/rust --navigate
//!
//! # Queue a submission, then replay it
//! waypoint enqueue submission '{"quiz":"q7","answers":[2,0,1]}'
//! waypoint sync sync-submissions
//!
//! # Post a host command
//! waypoint message '{"type":"CACHE_LESSONS","lessons":[{"id":"L1","payload":{}}]}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::debug;
use waypoint_core::{init_logging, LogConfig, LogFormat, QueueKind, WorkerConfig};
use waypoint_net::{HttpFetcher, LoaderConfig, Request};
use waypoint_sw::{InstallOutcome, LogNotifier, OfflineWorker, SyncOutcome};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Operator CLI for the Waypoint offline worker")]
struct Cli {
    /// Worker configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the configured version; activates it if nothing is active,
    /// otherwise it waits behind the active one
    Install,

    /// Activate the precached configured version and evict other caches
    Activate,

    /// Fetch a URL through the worker
    Fetch {
        /// Absolute URL or path relative to the origin
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
    },

    /// Queue a write for the next sync
    Enqueue {
        /// Queue: submission or progress
        kind: QueueKind,
        /// JSON payload
        payload: String,
    },

    /// Deliver a reconnect tag (sync-submissions, sync-progress, check-notifications)
    Sync {
        tag: String,
    },

    /// Post a host command (JSON)
    Message {
        json: String,
    },

    /// Print lifecycle, cache and queue state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format));

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    debug!(data_dir = %config.data_dir.display(), origin = %config.origin, "Configuration loaded");

    let fetcher = HttpFetcher::new(LoaderConfig::from_worker(&config))?;
    let (worker, _events) =
        OfflineWorker::new(config.clone(), Arc::new(fetcher), Arc::new(LogNotifier))?;

    match cli.command {
        Commands::Install => {
            let outcome = worker.handle_install().await?;
            print_json(&outcome)?;
        }

        Commands::Activate => {
            let report = match worker.resume().await? {
                Some(InstallOutcome::Activated(report)) => Some(report),
                _ => worker.skip_waiting().await,
            };
            match report {
                Some(report) => print_json(&report)?,
                None if worker.active_version().await.as_deref() == Some(config.version.as_str()) => {
                    println!("Version {} is already active", config.version)
                }
                None => bail!(
                    "version {} is not precached; run `waypoint install` first",
                    config.version
                ),
            }
        }

        Commands::Fetch { url, navigate } => {
            worker.resume().await?;
            let url = config.resolve(&url)?;
            let request = if navigate {
                Request::navigate(url)
            } else {
                Request::get(url)
            };

            let response = worker.handle_fetch(request).await.settle().await?;
            println!("Status:     {}", response.status);
            println!("From cache: {}", response.from_cache);
            if let Some(content_type) = response.content_type() {
                println!("Type:       {}", content_type);
            }
            println!("Bytes:      {}", response.body.len());
            println!();
            println!("{}", String::from_utf8_lossy(&response.body));
        }

        Commands::Enqueue { kind, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let id = worker.store().enqueue(kind, &payload)?;
            println!("Queued {} record {}", kind, id);
        }

        Commands::Sync { tag } => match worker.handle_sync(&tag).await {
            SyncOutcome::Drained(report) => {
                print_json(&report)?;
                if !report.is_clean() {
                    std::process::exit(1);
                }
            }
            SyncOutcome::Polled(Some(notification)) => {
                println!("{}: {}", notification.title, notification.body);
            }
            SyncOutcome::Polled(None) => println!("No new notifications"),
            SyncOutcome::Ignored => println!("Unknown tag {:?}, nothing to do", tag),
        },

        Commands::Message { json } => {
            worker.resume().await?;
            let message: serde_json::Value =
                serde_json::from_str(&json).context("message is not valid JSON")?;
            let outcome = worker.handle_message(&message).await;
            print_json(&outcome)?;
        }

        Commands::Status => {
            worker.resume().await?;
            print_json(&worker.status().await)?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::parse_from(["waypoint", "enqueue", "progress", r#"{"step":1}"#]);
        match cli.command {
            Commands::Enqueue { kind, payload } => {
                assert_eq!(kind, QueueKind::Progress);
                assert_eq!(payload, r#"{"step":1}"#);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "waypoint",
            "fetch",
            "/courses",
            "--navigate",
            "--log-format",
            "json",
            "-v",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Fetch { navigate: true, .. }));
    }
}
