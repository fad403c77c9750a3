// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use deskbridge::backend::BackendClient;
use deskbridge::bridge::{Bridge, BridgeState};
use deskbridge::config::{load_config, Config};
use deskbridge::download::{DownloadEvent, DownloadService, StateCommand};
use deskbridge::error::format_error;
use deskbridge::logging::init_logging;
use deskbridge::supervisor::{HeartbeatProbe, ProcessControl, ServerSupervisor, SystemProcesses};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the UI event fan-out. Slow SSE clients skip events past this.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Service unavailable - managed server not answering
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// Spinner/progress helpers for the one-shot download command
mod progress {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message.to_string());
        pb
    }
}

/// deskbridge - native side of a desktop shell.
#[derive(Parser)]
#[command(name = "deskbridge")]
#[command(version = VERSION)]
#[command(about = "Download lifecycle and local server supervision for a desktop shell.")]
#[command(long_about = "deskbridge - native side of a desktop shell\n\n\
    Run the bridge:      deskbridge (or: deskbridge run)\n\
    Download a file:     deskbridge download <URL> <PATH>\n\
    Kill stale servers:  deskbridge stop-server\n\
    Probe the server:    deskbridge heartbeat")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to ./deskbridge.json, then ~/.deskbridge/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Development mode: do not start or restart the server
    #[arg(long, global = true)]
    dev: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server, the heartbeat loop and the UI bridge
    Run,

    /// Download one file with a progress bar
    ///
    /// Examples:
    ///   deskbridge download https://example.com/a.zip ./a.zip
    ///   deskbridge download https://example.com/a.zip ./a.zip --fingerprint a-zip
    Download {
        /// Source URL
        url: String,
        /// Destination file
        path: PathBuf,
        /// Content fingerprint (defaults to the URL)
        #[arg(short, long)]
        fingerprint: Option<String>,
    },

    /// Kill every process with the configured server executable name
    StopServer,

    /// Probe the managed server once
    Heartbeat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    &format!("Failed to load configuration: {:#}", e),
                    &["The file is not valid JSON", "A field has the wrong type"],
                    &["Fix or remove the configuration file", "Run with --config <PATH>"],
                )
            );
            std::process::exit(CONFIG);
        }
    };
    if cli.dev {
        config.development = true;
    }

    let _log_guard = init_logging(&config);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => runtime.block_on(run_bridge(config)),
        Commands::Download {
            url,
            path,
            fingerprint,
        } => {
            if let Err(e) = runtime.block_on(download_once(url, path, fingerprint)) {
                eprintln!("{} {:#}", "[✗]".red(), e);
                std::process::exit(ERROR);
            }
            Ok(())
        }
        Commands::StopServer => {
            stop_server(&config);
            Ok(())
        }
        Commands::Heartbeat => {
            let backend = BackendClient::from_config(&config.server)?;
            if runtime.block_on(backend.heartbeat()) {
                println!("{} Server at {} is alive", "[✓]".green(), config.server.base_url());
                Ok(())
            } else {
                println!(
                    "{} Server at {} did not answer",
                    "[✗]".red(),
                    config.server.base_url()
                );
                std::process::exit(SERVICE_UNAVAILABLE);
            }
        }
    }
}

async fn run_bridge(config: Config) -> Result<()> {
    let development = config.is_development();
    let supervisor = Arc::new(ServerSupervisor::from_config(&config.server));

    if development {
        tracing::info!("development mode: server is managed by hand");
    } else {
        supervisor.start();
    }

    let backend = BackendClient::from_config(&config.server)?;
    let heartbeat = Arc::new(HeartbeatProbe::new(
        backend.clone(),
        supervisor.clone(),
        config.server.heartbeat_failure_threshold,
        development,
    ));

    let probe = heartbeat.clone();
    let interval = config.server.heartbeat_interval();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately; give the server a moment to boot
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // Skip ticks right after a UI-driven check.
            probe.check_if_idle(interval / 2).await;
        }
    });

    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;
    let (downloads, worker) = DownloadService::spawn_http(client, Arc::new(events.clone()));

    let bridge = Bridge::new(
        &config.bridge,
        BridgeState {
            downloads: downloads.clone(),
            events,
            backend,
            heartbeat: Some(heartbeat),
        },
    );
    let result = bridge.start(shutdown_signal()).await;

    heartbeat_task.abort();
    supervisor.close();
    if downloads.shutdown().await.is_ok() {
        let _ = worker.await;
    }
    tracing::info!("Cleanup complete, bridge stopped");

    result
}

async fn download_once(url: String, path: PathBuf, fingerprint: Option<String>) -> Result<()> {
    let fingerprint = fingerprint.unwrap_or_else(|| url.clone());
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (service, worker) = DownloadService::spawn_http(reqwest::Client::new(), Arc::new(event_tx));

    service.request_download(&url, &path, &fingerprint).await?;
    println!("{} Downloading {}", "[↻]".cyan(), url.bold());

    let pb = progress::create("Starting download...");
    let mut cancel_requested = false;

    let outcome = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                pb.set_message("Cancelling...");
                service.set_state(&fingerprint, &url, StateCommand::Cancel).await;
                continue;
            }
        };

        match event {
            Some(DownloadEvent::Progressing {
                bytes_received,
                bytes_total,
                ..
            }) => {
                pb.set_length(bytes_total);
                pb.set_position(bytes_received);
                pb.set_message("Downloading...");
            }
            Some(DownloadEvent::Pause { .. }) => pb.set_message("Paused"),
            Some(DownloadEvent::Completed {
                destination_path, ..
            }) => {
                pb.finish_and_clear();
                break Ok(destination_path);
            }
            Some(DownloadEvent::Cancelled { .. }) => {
                pb.abandon_with_message("Cancelled");
                break Err(anyhow::anyhow!("download cancelled"));
            }
            Some(DownloadEvent::Interrupted { .. }) => {
                pb.abandon_with_message("Interrupted");
                break Err(anyhow::anyhow!("download interrupted"));
            }
            None => break Err(anyhow::anyhow!("download service stopped")),
        }
    };

    if service.shutdown().await.is_ok() {
        let _ = worker.await;
    }

    let saved = outcome?;
    println!("{} Saved to {}", "[✓]".green(), saved.display());
    Ok(())
}

fn stop_server(config: &Config) {
    let name = config.server.executable_name();
    println!("{} Searching for running {} processes...", "[↻]".cyan(), name);

    let killed = SystemProcesses.kill_by_name(&name);
    if killed == 0 {
        println!("{} No {} process running", "⚠".yellow(), name);
    } else {
        println!("{} Stopped {} process(es)", "[✓]".green(), killed);
    }
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM (Ctrl+C only on Windows).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
                return;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
}
