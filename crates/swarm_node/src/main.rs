//! swarm_node — runs one swarm node in the foreground.
//!
//! Usage: `swarm_node [CONFIG.json] [--log-dir DIR]`
//!
//! Every non-empty line read from stdin is broadcast to the network as a
//! `chat` message; application messages and connection events from the
//! network are printed to stdout.

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use swarm_net::{NetworkConfig, NodeEvent, SwarmNode};

const CHAT_COMMAND: &str = "chat";

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl Args {
    fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--log-dir" => {
                    let dir = args.next().context("--log-dir needs a directory")?;
                    parsed.log_dir = Some(PathBuf::from(dir));
                }
                flag if flag.starts_with("--") => bail!("Unknown option: {flag}"),
                path => {
                    if parsed.config.is_some() {
                        bail!("Only one config file may be given");
                    }
                    parsed.config = Some(PathBuf::from(path));
                }
            }
        }
        Ok(parsed)
    }
}

fn render_event(event: &NodeEvent) -> String {
    let host = event.peer().host.as_deref().unwrap_or("?").to_string();
    match event {
        NodeEvent::Message(message) => format!(
            "[{}] {} from {} via {host}: {}",
            message.received_at.format("%H:%M:%S"),
            message.command,
            message.sender,
            message.payload
        ),
        other => format!("{} {host}", other.name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    let _log_guard = logging::init_logging(args.log_dir.as_deref())?;

    let config = match &args.config {
        Some(path) => NetworkConfig::load_or_default(path),
        None => NetworkConfig::default(),
    };

    let node = SwarmNode::spawn(config)
        .await
        .context("Failed to start swarm node")?;
    info!(node = %node.id(), host = node.host(), "Ready; type a line to broadcast it");

    let mut events = node.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", render_event(&event)),
                Err(RecvError::Lagged(n)) => warn!("Dropped {n} events"),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if !text.is_empty() {
                        node.broadcast(CHAT_COMMAND, serde_json::json!(text)).await?;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Stdin read failed: {e}");
                    stdin_open = false;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    node.shutdown();
    Ok(())
}
