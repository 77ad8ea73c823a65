//! Binary entrypoint for the meshrelay CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `status [--message <id>]` - print chunk counts and message statuses as JSON
//! - `sweep` - list failed chunks still eligible for a re-drive
//! - `cleanup [--days <n>]` - purge finished records older than the retention window
//! - `selftest [TEXT]` - send a message between two in-memory nodes and report the outcome
//! - `start [--port <path>]` - run a relay node on a serial device (feature `serial`)
//! - `send --peer <id> [--port <path>] TEXT` - deliver one message over a serial device (feature `serial`)
//!
//! See the library crate docs for module-level details: `meshrelay::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use meshrelay::config::Config;
use meshrelay::delivery::{
    DeliveryNode, DeliveryState, DeliveryTuning, MessageId, MessageReport, StatusView,
};
use meshrelay::storage::{DeliveryStore, SledStore, SledStoreBuilder};
use meshrelay::transport::loopback_pair;

const SELFTEST_TEXT: &str = "Meshrelay self-test. This message is long enough to be split into \
several chunks, each one sent on its own with a short pause in between, confirmed by the \
receiving node, and put back together in order on the other side. Ünïcödé and emoji 📡🛰️ must \
survive the trip intact, because no chunk boundary may ever fall inside a character.";

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Reliable chunked message delivery for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show delivery status
    Status {
        /// Report a single message instead of the summary
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List failed chunks eligible for a re-drive
    Sweep,
    /// Remove finished delivery records older than the retention window
    Cleanup {
        /// Override `storage.retention_days`
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Deliver a message between two in-memory nodes
    Selftest {
        /// Text to send (defaults to a multi-chunk sample)
        text: Option<String>,
    },
    /// Run a relay node on a serial-attached radio
    #[cfg(feature = "serial")]
    Start {
        /// Device serial port (overrides config)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Send one message over a serial-attached radio and wait for confirmations
    #[cfg(feature = "serial")]
    Send {
        /// Destination node id
        #[arg(long)]
        peer: String,
        /// Device serial port (overrides config)
        #[arg(short, long)]
        port: Option<String>,
        /// Seconds to wait for peer confirmations after the last chunk
        #[arg(short, long, default_value_t = 30)]
        wait: u64,
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new meshrelay configuration");
            Config::create_default(&cli.config).await?;
            let cfg = Config::default();
            tokio::fs::create_dir_all(&cfg.storage.data_dir).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status { message } => {
            let config = require_config(pre_config, &cli.config).await?;
            let view = StatusView::new(open_store(&config)?);
            let payload = match message {
                Some(id) => {
                    let report = view
                        .message_report(&MessageId::from(id.as_str()))?
                        .ok_or_else(|| anyhow!("no outbound message with id {}", id))?;
                    serde_json::to_value(report)?
                }
                None => serde_json::json!({
                    "chunks": view.chunk_tally()?,
                    "messages": view.list_statuses()?,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Sweep => {
            let config = require_config(pre_config, &cli.config).await?;
            let tuning = DeliveryTuning::from(&config.delivery);
            let view = StatusView::new(open_store(&config)?);
            let candidates = view.retry_candidates(tuning.max_retries)?;
            info!("{} chunk(s) eligible for re-drive", candidates.len());
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        Commands::Cleanup { days } => {
            let config = require_config(pre_config, &cli.config).await?;
            let days = days.unwrap_or(config.storage.retention_days);
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
            let store = open_store(&config)?;
            let report = store.purge_older_than(cutoff)?;
            info!(
                "Purged records older than {} days: {} outbound chunks, {} statuses, {} inbound chunks, {} markers",
                days,
                report.outbound_chunks,
                report.statuses,
                report.inbound_chunks,
                report.completion_markers
            );
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Selftest { text } => {
            let text = text.unwrap_or_else(|| SELFTEST_TEXT.to_string());
            let ok = run_selftest(&text).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        #[cfg(feature = "serial")]
        Commands::Start { port } => {
            let config = require_config(pre_config, &cli.config).await?;
            info!("Starting meshrelay v{}", env!("CARGO_PKG_VERSION"));
            let port = port.unwrap_or_else(|| config.serial.port.clone());
            run_node(&config, &port).await?;
        }
        #[cfg(feature = "serial")]
        Commands::Send {
            peer,
            port,
            wait,
            text,
        } => {
            let config = require_config(pre_config, &cli.config).await?;
            let port = port.unwrap_or_else(|| config.serial.port.clone());
            let report = send_once(&config, &port, &peer, &text, Duration::from_secs(wait)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn require_config(pre_config: Option<Config>, path: &str) -> Result<Config> {
    match pre_config {
        Some(config) => Ok(config),
        None => Config::load(path).await,
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn DeliveryStore>> {
    let path = config.storage.db_path();
    let store = SledStore::open(&path)
        .map_err(|e| anyhow!("Failed to open delivery store {}: {}", path.display(), e))?;
    Ok(Arc::new(store))
}

/// Poll until the message leaves `InProgress` or `timeout` passes.
async fn wait_for_outcome(
    view: &StatusView,
    message_id: &MessageId,
    timeout: Duration,
) -> Result<Option<MessageReport>> {
    let deadline = Instant::now() + timeout;
    loop {
        let report = view.message_report(message_id)?;
        let settled = report
            .as_ref()
            .and_then(|r| r.status.as_ref())
            .map(|s| s.state != DeliveryState::InProgress)
            .unwrap_or(true);
        if settled || Instant::now() >= deadline {
            return Ok(report);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run_selftest(text: &str) -> Result<bool> {
    let tuning = DeliveryTuning {
        retry_delay: Duration::from_millis(200),
        inter_chunk_delay: Duration::from_millis(50),
        ..DeliveryTuning::default()
    };
    let ((alpha_link, alpha_rx), (bravo_link, bravo_rx)) = loopback_pair("alpha", "bravo");
    let alpha = Arc::new(DeliveryNode::new(
        Arc::new(SledStoreBuilder::temporary().open()?),
        Arc::new(alpha_link),
        tuning.clone(),
    ));
    let bravo = Arc::new(DeliveryNode::new(
        Arc::new(SledStoreBuilder::temporary().open()?),
        Arc::new(bravo_link),
        tuning,
    ));

    let (alpha_done_tx, _alpha_done_rx) = mpsc::unbounded_channel();
    let (bravo_done_tx, mut bravo_done_rx) = mpsc::unbounded_channel();
    let alpha_loop = {
        let node = alpha.clone();
        tokio::spawn(async move { node.run_inbound(alpha_rx, alpha_done_tx).await })
    };
    let bravo_loop = {
        let node = bravo.clone();
        tokio::spawn(async move { node.run_inbound(bravo_rx, bravo_done_tx).await })
    };

    let started = Instant::now();
    let message_id = alpha.outbound().send_message(text, "bravo").await?;
    let received = tokio::time::timeout(Duration::from_secs(10), bravo_done_rx.recv())
        .await
        .ok()
        .flatten();
    let report = wait_for_outcome(alpha.status_view(), &message_id, Duration::from_secs(5)).await?;

    alpha.shutdown();
    bravo.shutdown();
    let _ = alpha_loop.await;
    let _ = bravo_loop.await;

    let status = report.as_ref().and_then(|r| r.status.clone());
    let truncated = status.as_ref().map(|s| s.truncated_bytes).unwrap_or(0);
    let text_matches = received
        .as_ref()
        .map(|m| truncated > 0 || m.text == text)
        .unwrap_or(false);
    let confirmed = status
        .as_ref()
        .map(|s| s.state == DeliveryState::Completed)
        .unwrap_or(true);
    let ok = text_matches && confirmed;
    if !ok {
        warn!("Self-test failed for id={}", message_id);
    }

    let payload = serde_json::json!({
        "status": if ok { "ok" } else { "failed" },
        "message_id": message_id,
        "bytes": text.len(),
        "chunks": report.as_ref().map(|r| r.tally.total()).unwrap_or(0),
        "delivery_state": status.as_ref().map(|s| s.state.as_str()),
        "truncated_bytes": truncated,
        "text_matches": text_matches,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "metrics": meshrelay::metrics::snapshot(),
    });
    println!("{}", payload);
    Ok(ok)
}

#[cfg(feature = "serial")]
async fn open_serial_node(
    config: &Config,
    port: &str,
) -> Result<(
    Arc<DeliveryNode>,
    mpsc::UnboundedReceiver<meshrelay::transport::InboundPacket>,
)> {
    use meshrelay::transport::serial::SerialTransport;

    let store = open_store(config)?;
    let (transport, inbound_rx) =
        SerialTransport::open(port, config.serial.baud_rate, &config.node.node_id).await?;
    info!("Connected to radio on {}", port);
    let node = DeliveryNode::new(
        store,
        Arc::new(transport),
        DeliveryTuning::from(&config.delivery),
    );
    Ok((Arc::new(node), inbound_rx))
}

#[cfg(feature = "serial")]
async fn run_node(config: &Config, port: &str) -> Result<()> {
    let (node, inbound_rx) = open_serial_node(config, port).await?;

    let resumed = node.outbound().resume_incomplete()?;
    if !resumed.is_empty() {
        info!("Resuming {} interrupted deliveries", resumed.len());
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let inbound = {
        let node = node.clone();
        tokio::spawn(async move { node.run_inbound(inbound_rx, done_tx).await })
    };

    info!("Relay node {} running; Ctrl-C to stop", config.node.node_id);
    loop {
        tokio::select! {
            message = done_rx.recv() => match message {
                Some(message) => println!("{}", serde_json::to_string(&message)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    node.shutdown();
    let _ = inbound.await;
    for task in resumed {
        match task.await {
            Ok(Ok(id)) => info!("Resumed delivery of id={} stopped", id),
            Ok(Err(e)) => warn!("Resumed delivery failed: {}", e),
            Err(e) => warn!("Resumed delivery task panicked: {}", e),
        }
    }
    Ok(())
}

#[cfg(feature = "serial")]
async fn send_once(
    config: &Config,
    port: &str,
    peer: &str,
    text: &str,
    wait: Duration,
) -> Result<Option<MessageReport>> {
    let (node, inbound_rx) = open_serial_node(config, port).await?;
    let (done_tx, _done_rx) = mpsc::unbounded_channel();
    let inbound = {
        let node = node.clone();
        tokio::spawn(async move { node.run_inbound(inbound_rx, done_tx).await })
    };

    let message_id = node.outbound().send_message(text, peer).await?;
    info!("Message id={} handed to the radio; waiting up to {:?} for confirmations", message_id, wait);
    let report = wait_for_outcome(node.status_view(), &message_id, wait).await?;

    node.shutdown();
    let _ = inbound.await;
    Ok(report)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
