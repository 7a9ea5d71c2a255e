//! # scalebridge
//!
//! Acquires measurements from a Xiaomi body-composition scale and prints
//! them, along with connection state and errors, as JSON lines on stdout.
//!
//! ## Running
//!
//! ```bash
//! # List nearby scales
//! scalebridge scan --seconds 10
//!
//! # Stream events for the configured scale
//! scalebridge --production listen
//!
//! # Check a bind key against a captured advertisement
//! scalebridge test-key 00112233445566778899aabbccddeeff 5858463309...
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scalebridge_core::{Config, ConnectionManager, ManagerOptions};
use scalebridge_daemon::backend::Backend;
use scalebridge_daemon::commands;
use scalebridge_daemon::events::{DaemonEvent, EventSink};
use scalebridge_daemon::logging;
use tracing::{info, warn};

/// How long to wait for the adapter to report power before running a command.
const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "scalebridge", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "SCALEBRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log JSON to rolling files in addition to stderr
    #[arg(long, global = true)]
    production: bool,

    /// Override the configured scale address
    #[arg(long, global = true)]
    address: Option<String>,

    /// Override the configured bind key
    #[arg(long, global = true)]
    bind_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List nearby scales
    Scan {
        /// How long to scan
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Stream state, errors and measurements until interrupted
    Listen,
    /// Wait for one stable measurement and print it
    Read {
        /// Give up after this many seconds (defaults to the configured read timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Check a bind key against a captured MiBeacon advertisement
    TestKey {
        /// 32 hexadecimal characters
        key: String,
        /// Raw MiBeacon service data, hex encoded
        advertisement: String,
        /// Scale address, when the capture does not carry one
        #[arg(short, long)]
        address: Option<String>,
    },
}

/// A running manager plus the backend feeding it.
struct Session {
    manager: ConnectionManager,
    backend: Backend,
}

impl Session {
    async fn start(
        config_path: Option<&Path>,
        address: Option<String>,
        bind_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config = Config::load(config_path).context("failed to load configuration")?;
        if address.is_some() {
            config.device.address = address;
        }
        if bind_key.is_some() {
            config.device.bind_key = bind_key;
        }
        config.validate().context("invalid command line override")?;

        let options = ManagerOptions::from_config(&config)?;
        let (backend, events) = Backend::open(&config).await?;
        let manager = ConnectionManager::new(backend.adapter(), events, options);

        if !manager.wait_for_adapter(ADAPTER_READY_TIMEOUT).await {
            warn!(power = ?manager.adapter_power(), "Bluetooth adapter is not powered on");
        }
        Ok(Self { manager, backend })
    }

    async fn finish(self) {
        self.manager.shutdown().await;
        self.backend.shutdown();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "SIGTERM handler unavailable, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(logging::LogMode::from_production_flag(cli.production))?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting scalebridge");
    let mut sink = EventSink::new(std::io::stdout());

    match cli.command {
        Command::TestKey {
            key,
            advertisement,
            address,
        } => {
            let matches = commands::test_key(&key, &advertisement, address.as_deref())?;
            sink.emit(&DaemonEvent::KeyCheck { matches })?;
            if !matches {
                anyhow::bail!("bind key does not decrypt the advertisement");
            }
            Ok(())
        }
        Command::Scan { seconds } => {
            let session = Session::start(cli.config.as_deref(), cli.address, cli.bind_key).await?;
            let result = commands::scan(&session.manager, Duration::from_secs(seconds), &mut sink).await;
            session.finish().await;
            result.map(drop)
        }
        Command::Listen => {
            let session = Session::start(cli.config.as_deref(), cli.address, cli.bind_key).await?;
            let result = commands::listen(&session.manager, &mut sink, shutdown_signal()).await;
            session.finish().await;
            result
        }
        Command::Read { timeout } => {
            let session = Session::start(cli.config.as_deref(), cli.address, cli.bind_key).await?;
            let timeout = timeout.map(Duration::from_secs);
            let result = commands::read(&session.manager, timeout, &mut sink).await;
            session.finish().await;
            result.map(drop)
        }
    }
}
