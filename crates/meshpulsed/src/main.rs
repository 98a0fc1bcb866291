//! meshpulsed: Mesh-Pulse LAN discovery and file transfer daemon.
//!
//! ```text
//! meshpulsed                              run until Ctrl-C
//! meshpulsed send <peer> <file> [message] send one file and exit
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;

use meshpulse_core::config::{MeshConfig, DEFAULT_SECRET};
use meshpulse_core::crypto::SharedKey;
use meshpulse_services::{wait_for_terminal, TransferState};

mod node;

use node::{Mode, Node};

/// How often `send` checks the registry while waiting for its peer.
const DISCOVERY_POLL: Duration = Duration::from_millis(100);

enum Command {
    Run,
    Send {
        peer: String,
        file: PathBuf,
        message: Option<String>,
    },
}

fn parse_args() -> Result<Command> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(Command::Run),
        Some("send") => {
            let (Some(peer), Some(file)) = (args.next(), args.next()) else {
                bail!("usage: meshpulsed send <peer> <file> [message]");
            };
            Ok(Command::Send {
                peer,
                file: PathBuf::from(file),
                message: args.next(),
            })
        }
        Some(other) => bail!("unknown command {other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let command = parse_args()?;

    // Load config
    match MeshConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = MeshConfig::load().context("failed to load config")?;
    config.validate()?;

    if config.security.secret == DEFAULT_SECRET {
        tracing::warn!("using the built-in shared secret; any node on the LAN can read transfers");
    }
    let key = SharedKey::derive(&config.security.secret).context("key derivation failed")?;
    tracing::info!(fingerprint = %key.fingerprint(), "shared key ready");

    match command {
        Command::Run => {
            let node = Node::start(&config, key, Mode::Daemon).await?;
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            node.shutdown().await;
            Ok(())
        }
        Command::Send { peer, file, message } => {
            let node = Node::start(&config, key, Mode::SendOnly).await?;
            let result = send_one(&node, config.discovery.ttl(), &peer, file, message).await;
            node.shutdown().await;
            result
        }
    }
}

/// Wait for `peer` to appear, send `file`, and wait for the verdict.
async fn send_one(
    node: &Node,
    wait: Duration,
    peer: &str,
    file: PathBuf,
    message: Option<String>,
) -> Result<()> {
    let engine = node.engine();
    let give_up = Instant::now() + wait;
    while engine.registry().resolve(peer).is_none() {
        if Instant::now() >= give_up {
            bail!("peer {peer:?} not discovered within {}s", wait.as_secs());
        }
        tokio::time::sleep(DISCOVERY_POLL).await;
    }

    let mut events = engine.subscribe();
    let id = engine.send_with_message(peer, &file, message)?;
    tracing::info!(session = %id, peer, file = %file.display(), "send started");

    let finished = tokio::select! {
        s = wait_for_terminal(&mut events, id) => Some(s),
        _ = tokio::signal::ctrl_c() => None,
    };
    let snapshot = match finished {
        Some(s) => s,
        None => {
            engine.cancel(id);
            wait_for_terminal(&mut events, id).await
        }
    }
    .context("event bus closed before the transfer finished")?;

    match snapshot.state {
        TransferState::Complete => {
            tracing::info!(session = %id, bytes = snapshot.bytes, "send complete");
            Ok(())
        }
        state => bail!(
            "transfer {state}: {}",
            snapshot.error.as_deref().unwrap_or("no detail")
        ),
    }
}
