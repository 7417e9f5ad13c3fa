//! wagate CLI entry point.
//!
//! Provides `start`, `status`, `send`, and `logout` subcommands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use wagate::config::{load_config, runtime_paths, Config, RuntimePaths};
use wagate::credentials::load_credentials;
use wagate::events::{BroadcastSink, GatewayEvent};
use wagate::protocol::bridge::BridgeConnector;
use wagate::store::sqlite::SqliteStore;
use wagate::store::Storage;
use wagate::Gateway;

/// wagate — WhatsApp session gateway.
#[derive(Parser)]
#[command(name = "wagate", version, about)]
struct Cli {
    /// Config directory (default: `~/.wagate`).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the gateway until interrupted.
    Start,
    /// Print the persisted session record.
    Status {
        /// Also print the latest messages of this chat.
        #[arg(long)]
        chat: Option<String>,
        /// Number of messages to print with `--chat`.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Send one text message and exit.
    Send {
        /// Phone number or chat identifier.
        to: String,
        /// Message text.
        body: String,
        /// Seconds to wait for the session to open.
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Log the linked device out.
    Logout {
        /// Seconds to wait for the session to open.
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = match cli.config_dir {
        Some(root) => RuntimePaths::under(&root),
        None => runtime_paths()?,
    };

    match cli.command {
        Command::Start => handle_start(&paths).await,
        Command::Status { chat, limit } => handle_status(&paths, chat.as_deref(), limit).await,
        Command::Send {
            to,
            body,
            wait_secs,
        } => handle_send(&paths, &to, &body, Duration::from_secs(wait_secs)).await,
        Command::Logout { wait_secs } => {
            handle_logout(&paths, Duration::from_secs(wait_secs)).await
        }
    }
}

/// Wired gateway plus the handles the subcommands need.
struct Runtime {
    gateway: Gateway,
    sink: Arc<BroadcastSink>,
}

async fn build_runtime(paths: &RuntimePaths) -> anyhow::Result<Runtime> {
    let config = load_config(&paths.config_toml)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    let credentials = load_credentials(&paths.env_file)?;
    let token = credentials.get(&config.bridge.token_env).map(str::to_owned);
    if token.is_none() {
        info!(key = %config.bridge.token_env, "no bridge token configured");
    }

    let store = open_store(&config, paths).await?;
    let sink = Arc::new(BroadcastSink::new(config.gateway.event_channel_capacity));
    let connector = Arc::new(BridgeConnector::new(config.bridge_settings(token)));

    let gateway = Gateway::new(
        connector,
        store,
        Arc::clone(&sink) as Arc<dyn wagate::events::EventSink>,
        config.reconnect_policy(),
    );
    Ok(Runtime { gateway, sink })
}

async fn open_store(config: &Config, paths: &RuntimePaths) -> anyhow::Result<Arc<SqliteStore>> {
    let db_path = config.database_path(paths);
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    Ok(Arc::new(store))
}

/// Run the gateway until Ctrl-C.
async fn handle_start(paths: &RuntimePaths) -> anyhow::Result<()> {
    let _logging_guard = wagate::logging::init_production(&paths.logs_dir)?;

    let runtime = build_runtime(paths).await?;
    let mut events = runtime.sink.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::Qr { qr }) => {
                    info!("scan the QR code to link this device");
                    println!("{qr}");
                }
                Ok(GatewayEvent::Ready) => info!("gateway ready"),
                Ok(GatewayEvent::Disconnected { reason }) => warn!(%reason, "gateway disconnected"),
                Ok(GatewayEvent::Message {
                    chat_id,
                    from,
                    body,
                }) => info!(%chat_id, %from, len = body.len(), "message received"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    runtime
        .gateway
        .initialize()
        .await
        .context("failed to start gateway")?;
    info!("wagate running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    Ok(())
}

/// Print the persisted session record and, optionally, a chat's history.
async fn handle_status(
    paths: &RuntimePaths,
    chat: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    wagate::logging::init_cli();
    let config = load_config(&paths.config_toml)?;
    let store = open_store(&config, paths).await?;

    match store.get_session().await? {
        Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
        None => println!("no session recorded"),
    }

    if let Some(chat) = chat {
        let chat_id = wagate::gateway::jid::normalize(chat);
        let messages = store.list_messages(&chat_id, limit).await?;
        for message in messages {
            let direction = if message.is_from_me { ">" } else { "<" };
            println!(
                "{} {direction} {}",
                message.timestamp.to_rfc3339(),
                message.body
            );
        }
    }
    Ok(())
}

/// Connect, wait for the session to open, send one message.
async fn handle_send(
    paths: &RuntimePaths,
    to: &str,
    body: &str,
    wait: Duration,
) -> anyhow::Result<()> {
    wagate::logging::init_cli();
    let runtime = build_runtime(paths).await?;
    let mut events = runtime.sink.subscribe();

    runtime.gateway.initialize().await?;

    wait_for_ready(&mut events, wait).await?;

    let message = runtime.gateway.send_message(to, body).await?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

/// Connect, wait for the session to open, log the linked device out.
async fn handle_logout(paths: &RuntimePaths, wait: Duration) -> anyhow::Result<()> {
    wagate::logging::init_cli();
    let runtime = build_runtime(paths).await?;
    let mut events = runtime.sink.subscribe();

    runtime.gateway.initialize().await?;
    let ready = wait_for_ready(&mut events, wait).await;
    // Without an open session there is nothing to log out; still tear down.
    runtime.gateway.disconnect().await;
    ready?;

    println!("logged out");
    Ok(())
}

/// Wait until the gateway reports `ready`.
///
/// A QR challenge means the device is not linked and fails immediately.
async fn wait_for_ready(
    events: &mut broadcast::Receiver<GatewayEvent>,
    wait: Duration,
) -> anyhow::Result<()> {
    let ready = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::Ready) => return Ok(()),
                Ok(GatewayEvent::Qr { .. }) => {
                    return Err(anyhow::anyhow!(
                        "device is not linked; run `wagate start` and scan the QR code"
                    ))
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("event stream closed"))
                }
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("session did not open within {}s", wait.as_secs()))?;
    ready
}
