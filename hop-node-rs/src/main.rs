//! Hop Node - CLI for the multi-hop OCPP engine
//!
//! Runs one station, relay or CSMS over OCPP WebSocket connections.
//!
//! # Usage
//!
//! ```bash
//! # CSMS listening for neighbours
//! hop-node --name csms --listen 0.0.0.0:9000
//!
//! # Relay: accepts stations, connects upstream, rejects Reset by default
//! hop-node --name relay-a --listen 0.0.0.0:9100 \
//!     --connect csms=ws://localhost:9000 --default-route csms --block Reset
//!
//! # Station behind the relay sending heartbeats to the CSMS
//! hop-node --name cs-1 --connect relay-a=ws://localhost:9100 \
//!     --default-route relay-a --heartbeat-to csms
//! ```

mod handlers;
mod ws;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use hop_core::{Node, NodeConfig, NodeId, Verdict};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::ws::{ReconnectPolicy, WsTransport};

/// Multi-hop OCPP message adapter node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long)]
    name: String,

    /// Address to accept neighbour connections on
    #[arg(short = 'L', long)]
    listen: Option<SocketAddr>,

    /// Outbound neighbour as id=ws://host:port (can be repeated)
    #[arg(short, long)]
    connect: Vec<String>,

    /// Static route as destination=neighbour (can be repeated)
    #[arg(long)]
    route: Vec<String>,

    /// Neighbour for destinations without a static route
    #[arg(long)]
    default_route: Option<String>,

    /// Verdict for relayed requests no filter decided on (forward, reject)
    #[arg(long, default_value = "forward")]
    default_verdict: Verdict,

    /// Reject relayed requests for this action (can be repeated)
    #[arg(long)]
    block: Vec<String>,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Signing key id
    #[arg(long)]
    key_id: Option<String>,

    /// Hex encoded 32-byte ed25519 seed
    #[arg(long)]
    signing_seed: Option<String>,

    /// Trusted public key as key_id=hex (can be repeated)
    #[arg(long)]
    trust: Vec<String>,

    /// Require signatures on inbound requests and responses
    #[arg(long)]
    require_signatures: bool,

    /// Send periodic heartbeats to this node
    #[arg(long)]
    heartbeat_to: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args)?;
    let listen = args
        .listen
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Hop Node - Multi-hop OCPP Engine                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Listen:   {:<50} ║", listen);
    println!("║  Peers:    {:<50} ║", truncate(&args.connect.join(", "), 50));
    println!("║  Default:  {:<50} ║", config.default_verdict);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let policy = config.signing.build_policy()?;
    let (transport, inbound) = WsTransport::new(config.node_id.clone());
    let node = Node::new(config, transport.clone(), policy);

    handlers::register_defaults(&node);
    for action in &args.block {
        handlers::block_action(&node, action);
    }
    node.spawn_receiver(inbound);

    for entry in &args.connect {
        let (peer, url) = split_pair(entry, "--connect")?;
        tokio::spawn(transport.clone().connect(
            NodeId::from(peer),
            url.to_string(),
            node.clone(),
            ReconnectPolicy::default(),
        ));
    }

    if let Some(destination) = &args.heartbeat_to {
        tokio::spawn(heartbeat_loop(
            node.clone(),
            NodeId::from(destination.as_str()),
            Duration::from_secs(args.heartbeat_interval),
        ));
    }

    info!("Node {} started", node.id());

    match args.listen {
        Some(addr) => {
            tokio::select! {
                result = transport.listen(addr, node.clone()) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    node.shutdown();
    Ok(())
}

fn build_config(args: &Args) -> Result<NodeConfig, String> {
    let mut config = NodeConfig::new(args.name.as_str())
        .with_default_verdict(args.default_verdict)
        .with_request_timeout(Duration::from_millis(args.timeout_ms))
        .with_required_signatures(args.require_signatures, args.require_signatures);

    for entry in &args.route {
        let (destination, via) = split_pair(entry, "--route")?;
        config = config.with_route(destination, via);
    }
    if let Some(via) = &args.default_route {
        config = config.with_default_route(via.as_str());
    }

    match (&args.key_id, &args.signing_seed) {
        (Some(key_id), Some(seed)) => config = config.with_signing_key(key_id, seed),
        (None, Some(seed)) => config = config.with_signing_key(args.name.as_str(), seed),
        (Some(_), None) => return Err("--key-id needs --signing-seed".to_string()),
        (None, None) => {}
    }
    for entry in &args.trust {
        let (key_id, public_hex) = split_pair(entry, "--trust")?;
        config = config.with_trusted_key(key_id, public_hex);
    }

    Ok(config)
}

fn split_pair<'a>(entry: &'a str, flag: &str) -> Result<(&'a str, &'a str), String> {
    entry
        .split_once('=')
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| format!("{} expects key=value, got '{}'", flag, entry))
}

async fn heartbeat_loop(node: Node, destination: NodeId, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let outcome = node
            .send_request(destination.clone(), "Heartbeat", json!({}), None)
            .await;
        match outcome.response() {
            Some(response) => info!(
                "Heartbeat acknowledged by {:?}: {}",
                response.responder(),
                response.payload["currentTime"]
            ),
            None => warn!("Heartbeat to {} failed: {}", destination, outcome),
        }
        if matches!(outcome, hop_core::Outcome::Cancelled) {
            info!("Heartbeat loop stopped");
            break;
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_from_args() {
        let args = Args::parse_from([
            "hop-node",
            "--name",
            "relay-a",
            "--route",
            "cs-1=relay-b",
            "--default-route",
            "csms",
            "--default-verdict",
            "reject",
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.default_verdict, Verdict::Reject);
        assert_eq!(config.next_hop(&"cs-1".into()), NodeId::from("relay-b"));
        assert_eq!(config.next_hop(&"cs-9".into()), NodeId::from("csms"));
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("csms=ws://h:1", "--connect"), Ok(("csms", "ws://h:1")));
        assert!(split_pair("csms", "--connect").is_err());
        assert!(split_pair("=x", "--connect").is_err());
    }

    #[test]
    fn test_key_id_without_seed_rejected() {
        let args = Args::parse_from(["hop-node", "--name", "cs-1", "--key-id", "k"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
