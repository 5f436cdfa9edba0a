//! fastsync-client: headless vault sync against a fastsync server.
//!
//! Runs the same engine as the editor plugin over a local directory, with the native
//! filesystem, a debounced watcher and a tokio-tungstenite socket.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fastsync_client::watcher::FileWatcher;
use fastsync_client::{Overrides, SyncClient, default_settings_path, load_settings};
use fastsync_core::{NoticeLevel, Subscription, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "fastsync-client")]
#[command(about = "Bidirectional vault sync client")]
struct Args {
    /// Path to the local vault directory
    #[arg(short, long)]
    path: PathBuf,

    /// Settings file (defaults to <path>/.fastsync/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Websocket base URL of the server, e.g. wss://sync.example.com
    #[arg(long)]
    server_url: Option<String>,

    /// API token sent on authorization
    #[arg(long)]
    api_token: Option<String>,

    /// Remote vault name
    #[arg(long)]
    vault: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Running client components.
struct Daemon {
    /// Kept alive so notices keep reaching the log
    _notices: Subscription,
    shutdown: watch::Sender<bool>,
}

fn log_notice(event: SyncEvent) {
    match event {
        SyncEvent::Notice { level, message } => match level {
            NoticeLevel::Info => info!("{}", message),
            NoticeLevel::Warning => warn!("{}", message),
            NoticeLevel::Error => error!("{}", message),
        },
        SyncEvent::SyncCompleted => info!("Sync complete"),
        SyncEvent::ConfigChanged { path } => info!("Config changed remotely: {}", path),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,fastsync_client=debug,fastsync_core=debug"
    } else {
        "info,fastsync_client=info,fastsync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = args.config.clone().unwrap_or_else(|| default_settings_path(&args.path));
    let settings = load_settings(
        &config_path,
        Overrides {
            server_url: args.server_url,
            api_token: args.api_token,
            vault: args.vault,
        },
    )?;

    info!("Starting fastsync-client");
    info!("Vault path: {:?}", args.path);
    info!("Remote vault: {}", settings.vault);

    let config_dir = settings.config_dir.clone();
    let client = SyncClient::open(&args.path, settings).await?;

    let watcher = FileWatcher::new(args.path.clone(), config_dir)?;
    client.forward_local_events(watcher);
    info!("File watcher started");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let daemon = Daemon {
        _notices: client.engine().events().subscribe(log_notice),
        shutdown,
    };

    let session = tokio::spawn(client.run(shutdown_rx));
    info!("Client running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = daemon.shutdown.send(true);
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Session ended with error: {}", e),
        Err(e) => error!("Session task failed: {}", e),
    }

    info!("Shutting down");
    Ok(())
}
