//! CLI Entry Point for daq-collector
//!
//! Provides command-line interface for:
//! - Running one collector stage from a configuration file
//! - Sending a control signal to a running stage's monitoring channel
//!
//! # Usage
//!
//! Run a stage:
//! ```bash
//! daq-collector run --config config/collector.toml
//! daq-collector run --config config/collector.toml --app collector --lax
//! ```
//!
//! Control a stage:
//! ```bash
//! daq-collector signal tcp://127.0.0.1:7010 stop
//! daq-collector signal tcp://127.0.0.1:7010 status
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_collector::monitor::MonitorClient;
use daq_collector::network::SocketOptions;
use daq_collector::{logging, AppKind, CollectorConfig, Context, ExitReason, MessageKind, Stage};
use std::path::PathBuf;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "daq-collector")]
#[command(about = "Event collector stages for a DAQ pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one collector stage until it receives Terminate
    Run {
        /// Configuration file (TOML format)
        #[arg(long, default_value = "config/collector.toml")]
        config: PathBuf,

        /// Override the configured collector variant
        #[arg(long, value_enum)]
        app: Option<AppKind>,

        /// Drop events instead of stalling when no worker is ready
        #[arg(long)]
        lax: bool,
    },

    /// Send a control signal to a running stage
    Signal {
        /// Monitoring address of the stage, e.g. tcp://127.0.0.1:7010
        address: String,

        /// Signal to send
        #[arg(value_enum)]
        signal: SignalKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalKind {
    Start,
    Stop,
    Terminate,
    Status,
}

impl SignalKind {
    fn message_kind(self) -> MessageKind {
        match self {
            SignalKind::Start => MessageKind::Start,
            SignalKind::Stop => MessageKind::Stop,
            SignalKind::Terminate => MessageKind::Terminate,
            SignalKind::Status => MessageKind::StatusRequest,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, app, lax } => run_stage(config, app, lax).await,
        Commands::Signal { address, signal } => send_signal(&address, signal).await,
    }
}

async fn run_stage(path: PathBuf, app: Option<AppKind>, lax: bool) -> Result<()> {
    let mut config = CollectorConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(app) = app {
        config.app = app;
    }
    config.lax |= lax;

    logging::init_from_config(&config)?;
    config.validate()?;

    let ctx = Context::new();
    let mut stage = Stage::initialize(&ctx, &config).await?;

    tokio::select! {
        result = stage.run() => {
            let ExitReason::Terminated(peer) = result?;
            info!(%peer, "stage terminated");
        }
        _ = signal::ctrl_c() => {
            warn!(status = %stage.status(), "interrupted");
        }
    }
    Ok(())
}

async fn send_signal(address: &str, signal: SignalKind) -> Result<()> {
    let ctx = Context::new();
    let identity = format!("ctl-{}", uuid::Uuid::new_v4());
    let mut client = MonitorClient::connect(&ctx, address, SocketOptions::new(identity)).await?;

    if matches!(signal, SignalKind::Terminate) {
        client.signal(MessageKind::Terminate)?;
        // The stage closes its sockets on exit.
        match timeout(REPLY_TIMEOUT, client.closed()).await {
            Ok(()) => println!("stage at {address} terminated"),
            Err(_) => bail!("stage at {address} did not close within {REPLY_TIMEOUT:?}"),
        }
        return Ok(());
    }

    if !matches!(signal, SignalKind::Status) {
        client.signal(signal.message_kind())?;
    }

    let reply = timeout(REPLY_TIMEOUT, client.status())
        .await
        .with_context(|| format!("no status reply from {address}"))??;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
