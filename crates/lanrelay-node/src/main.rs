//! lanrelay — a LAN-only peer-to-peer messaging and file-transfer node.
//!
//! # Usage
//!
//! ```bash
//! lanrelay                      # start with the configured display name
//! lanrelay --name "kitchen-pc"  # override the display name for this run
//! lanrelay --port 9876          # use a specific TCP port (0 = auto-assign)
//! ```
//!
//! On first run the node generates a unique device id and prompts for a
//! display name (if running in an interactive terminal). The config is saved
//! to `~/.config/lanrelay/config.toml`.
//!
//! # Architecture
//!
//! One process, one `tokio` runtime, three concurrent collaborators: the
//! UDP discovery task, the TCP accept loop driven by the connection manager,
//! and the interactive shell on stdin. There is no separate daemon/IPC
//! split — discovery runs without any central server, so neither does this.

mod discovery;
mod group;
mod manager;
mod messaging;
mod peer;
mod shell;
mod transfer;

use anyhow::{Context, Result};
use clap::Parser;
use lanrelay_core::config::AppConfig;
use lanrelay_core::history::HistoryStore;
use manager::{ConnectionManager, Identity};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// lanrelay node — LAN peer-to-peer messenger.
#[derive(Parser, Debug)]
#[command(name = "lanrelay", about = "LAN peer-to-peer messaging and file transfer")]
struct Cli {
    /// Display name for this machine on the network. Overrides config.toml
    /// for this run.
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port for peer-to-peer connections (0 = auto-assign).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match AppConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("first run detected, creating new config");
            let display_name = get_display_name()?;
            let config = AppConfig::new_first_run(&display_name);
            config.save_to(&config_path)?;
            info!(
                path = %config_path.display(),
                device_id = %config.device_id,
                device_name = %config.device_name,
                "saved new config"
            );
            config
        }
    };

    if let Some(name) = &cli.name {
        config.device_name = name.clone();
    }
    if cli.port != 0 {
        config.tcp_port = cli.port;
    }

    let history_dir = AppConfig::default_history_dir().context("could not determine data directory")?;
    let received_dir = AppConfig::default_received_dir().context("could not determine data directory")?;
    let history = HistoryStore::open(&history_dir).context("failed to open history store")?;

    let identity = Identity {
        device_id: lanrelay_core::types::DeviceId::new(config.device_id.clone()),
        device_name: config.device_name.clone(),
        platform: config.platform,
    };

    let (manager, events_rx) = ConnectionManager::new(identity, history, received_dir);

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.tcp_port).parse()?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind TCP listener")?;
    let tcp_port = listener.local_addr()?.port();

    let discovery_identity = shell::discovery_identity(&manager, tcp_port);
    let discovery_rx = discovery::start(discovery_identity, config.udp_port)
        .await
        .context("failed to start UDP discovery")?;
    info!(port = config.udp_port, "UDP discovery started");

    manager
        .start(listener, discovery_rx)
        .await
        .context("failed to start TCP accept loop")?;
    info!(port = tcp_port, "TCP listener started");

    info!("lanrelay is running. Type 'quit' to stop, or press Ctrl+C.");
    tokio::select! {
        _ = shell::run(manager, events_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// Prompts the user for a display name on first run. Falls back to a
/// generic name if stdin is not a terminal or the user enters nothing.
fn get_display_name() -> Result<String> {
    if std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        print!("Enter a display name for this machine: ");
        io::stdout().flush()?;
        let mut name = String::new();
        io::stdin().read_line(&mut name)?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Ok(default_display_name());
        }
        Ok(name)
    } else {
        Ok(default_display_name())
    }
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "lanrelay-node".to_string())
}

/// Initializes the tracing subscriber: stderr always, plus a log file under
/// the data directory when it can be opened. The log level is controlled by
/// the `LANRELAY_LOG` environment variable, defaulting to `info`.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env("LANRELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = AppConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("lanrelay.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
