use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use tiermesh::lifecycle::{deliver_until, shutdown_signal};
use tiermesh::{ConfigSources, Keypair, Node, NodeConfig};

/// Exit code when a second signal interrupts a graceful stop.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "tiermesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hex-encoded Ed25519 secret key.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "HOST")]
    host: Option<String>,

    #[arg(long, env = "PORT")]
    port: Option<String>,

    /// Trusted tier-2 peers, comma separated `<did>@<host:port>`.
    #[arg(long = "tier2", env = "TIER2_NODES")]
    tier2_nodes: Option<String>,

    /// Trusted tier-1 peers, same format as `--tier2`.
    #[arg(long = "tier1", env = "TIER1_NODES")]
    tier1_nodes: Option<String>,

    /// Extra topics to subscribe to, comma separated.
    #[arg(long = "topic", env = "TOPICS")]
    topics: Option<String>,

    #[arg(long, env = "GRACE_PERIOD_MS")]
    grace_period_ms: Option<String>,

    #[arg(long, env = "HEARTBEAT_MS")]
    heartbeat_ms: Option<String>,

    /// Print a fresh private key and its DID, then exit.
    #[arg(long)]
    generate_key: bool,
}

impl From<Args> for ConfigSources {
    fn from(args: Args) -> Self {
        ConfigSources {
            private_key: args.private_key,
            host: args.host,
            port: args.port,
            tier2_nodes: args.tier2_nodes,
            tier1_nodes: args.tier1_nodes,
            topics: args.topics,
            grace_period_ms: args.grace_period_ms,
            heartbeat_ms: args.heartbeat_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        let keypair = Keypair::generate();
        println!("PRIVATE_KEY={}", keypair.secret_key_hex());
        println!("DID={}", keypair.identity());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig::from_sources(args.into()).context("invalid configuration")?;
    let node = Node::quic(config);
    let mut messages = node.messages();

    node.start().await?;
    info!(did = %node.did(), "listening for messages");

    let signal = deliver_until(shutdown_signal(), &mut messages, |message| {
        println!("{}: {}", message.topic, String::from_utf8_lossy(&message.payload));
    })
    .await;

    info!(signal, "received shutdown signal, stopping gracefully");
    tokio::select! {
        result = node.stop() => {
            if let Err(e) = result {
                error!(error = %e, "shutdown failed");
            }
        }
        second = shutdown_signal() => {
            error!(signal = second, "second signal during shutdown, exiting immediately");
            std::process::exit(EXIT_INTERRUPTED);
        }
    }

    Ok(())
}
