//! NN-OCPP Node - CLI networking node
//!
//! Runs one node of an OCPP overlay network: a CSMS answering stations, a
//! relay passing traffic through its filters, or a charging station that
//! boots and heartbeats against a CSMS.
//!
//! # Usage
//!
//! ```bash
//! # CSMS listening for relays and stations
//! nn-ocpp-node --name csms --role csms --listen 0.0.0.0:9100
//!
//! # Relay between stations and the CSMS, hiding the security controller
//! nn-ocpp-node --name relay-1 --role relay --listen 0.0.0.0:9000 \
//!     --upstream ws://localhost:9100/ocpp --block-component SecurityCtrlr
//!
//! # Station behind the relay
//! nn-ocpp-node --name cs1 --role station \
//!     --upstream ws://localhost:9000/ocpp --upstream-id relay-1 --route relay-1,csms
//! ```

mod roles;

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use nn_adapter_ocpp::{ActionAllowList, AdapterConfig, ComponentBlocklist, OcppVersion, WebSocketTransport};
use nn_core::{
    CancellationToken, DefaultForwardingDecision, LifecycleEvent, NetworkingNode, NodeConfig, NodeRole,
    SourceRouting, WireFormat,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Csms,
    Relay,
    Station,
}

impl From<Role> for NodeRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Csms => NodeRole::Csms,
            Role::Relay => NodeRole::Relay,
            Role::Station => NodeRole::ChargingStation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Forwarding {
    Forward,
    Reject,
}

impl From<Forwarding> for DefaultForwardingDecision {
    fn from(forwarding: Forwarding) -> Self {
        match forwarding {
            Forwarding::Forward => DefaultForwardingDecision::Forward,
            Forwarding::Reject => DefaultForwardingDecision::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Framing {
    Json,
    PlainJson,
    Binary,
}

impl From<Framing> for WireFormat {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Json => WireFormat::Json,
            Framing::PlainJson => WireFormat::PlainJson,
            Framing::Binary => WireFormat::Binary,
        }
    }
}

/// OCPP networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier, also the WebSocket path segment upstream
    #[arg(short, long)]
    name: String,

    #[arg(short, long, value_enum, default_value = "relay")]
    role: Role,

    /// OCPP version (1.6 or 2.1)
    #[arg(long, default_value = "2.1")]
    ocpp_version: OcppVersion,

    /// Address to accept downstream connections on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// WebSocket path prefix for downstream connections
    #[arg(long, default_value = "/ocpp")]
    ws_path: String,

    /// Upstream WebSocket URL; the node id is appended
    #[arg(long)]
    upstream: Option<String>,

    /// Node id of the upstream peer
    #[arg(long, default_value = "csms")]
    upstream_id: String,

    /// Hops from this station to the CSMS (defaults to the upstream id)
    #[arg(long, value_delimiter = ',')]
    route: Vec<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Wire framing
    #[arg(long, value_enum, default_value = "json")]
    wire_format: Framing,

    /// What a relay does when no filter decides
    #[arg(long, value_enum, default_value = "forward")]
    default_forwarding: Forwarding,

    /// Actions a relay rejects unless a filter forwards them (can be repeated)
    #[arg(long)]
    reject_action: Vec<String>,

    /// Device-model components a relay refuses to expose (can be repeated)
    #[arg(long)]
    block_component: Vec<String>,

    /// Only relay these actions (can be repeated)
    #[arg(long)]
    allow_action: Vec<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let route = if args.route.is_empty() {
        vec![args.upstream_id.clone()]
    } else {
        args.route.clone()
    };

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            NN-OCPP Node - OCPP Networking Node               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Role:     {:<50} ║", NodeRole::from(args.role));
    println!("║  OCPP:     {:<50} ║", args.ocpp_version);
    println!(
        "║  Listen:   {:<50} ║",
        args.listen.map(|addr| addr.to_string()).unwrap_or_else(|| "-".into())
    );
    println!(
        "║  Upstream: {:<50} ║",
        truncate(args.upstream.as_deref().unwrap_or("-"), 50)
    );
    if args.role == Role::Station {
        println!("║  Route:    {:<50} ║", truncate(&route.join(" > "), 50));
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut adapter_config = AdapterConfig::new(&args.name, args.ocpp_version).with_ws_path(&args.ws_path);
    if let Some(addr) = args.listen {
        adapter_config = adapter_config.with_listen(addr);
    }
    if let Some(url) = &args.upstream {
        adapter_config = adapter_config.with_upstream(url, &args.upstream_id);
    }

    let mut node_config = NodeConfig::new(args.name.as_str(), args.role.into())
        .with_request_timeout(Duration::from_secs(args.timeout))
        .with_wire_format(args.wire_format.into())
        .with_default_forwarding(args.default_forwarding.into());
    for action in &args.reject_action {
        node_config = node_config.with_action_default(action, DefaultForwardingDecision::Reject);
    }

    let (transport, inbox) = WebSocketTransport::new(adapter_config);

    let mut builder = NetworkingNode::builder(node_config, args.ocpp_version.catalog()).subscribe(audit);
    let settings = roles::default_settings();
    builder = match args.role {
        Role::Csms => roles::csms(builder, args.ocpp_version),
        Role::Station => roles::station(builder, args.ocpp_version, settings.clone()),
        Role::Relay => {
            if !args.block_component.is_empty() {
                info!("Blocking components: {}", args.block_component.join(", "));
                builder = ComponentBlocklist::new(args.block_component.iter().cloned()).install(builder);
            }
            if !args.allow_action.is_empty() {
                info!("Relaying only: {}", args.allow_action.join(", "));
                builder = ActionAllowList::new(args.allow_action.iter().cloned()).install(builder);
            }
            builder
        }
    };
    let node = builder.build(transport.clone())?;
    inbox.spawn(node.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    if args.listen.is_some() {
        let listener = transport.bind().await?;
        tasks.push(tokio::spawn(transport.clone().serve(listener, shutdown.clone())));
    }

    if args.upstream.is_some() {
        let upstream = transport.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = upstream.run_upstream(token).await {
                error!("Upstream connection gave up: {}", e);
            }
        }));
    }

    if args.role == Role::Station {
        tasks.push(tokio::spawn(roles::run_station(
            node.clone(),
            args.ocpp_version,
            SourceRouting::via(route),
            settings,
            shutdown.clone(),
        )));
    }

    info!("Node {} running as {}", node.id(), node.config().role);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown.cancel();
    node.shutdown();
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

/// Log every lifecycle event
fn audit(event: &LifecycleEvent) {
    info!(
        kind = event.kind(),
        action = event.action(),
        connection = %event.connection(),
        "lifecycle event"
    );
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ws://example.org/ocpp", 10), "ws://ex...");
    }

    #[test]
    fn test_args_route_split() {
        let args = Args::parse_from([
            "nn-ocpp-node",
            "--name",
            "cs1",
            "--role",
            "station",
            "--route",
            "relay-1,csms",
            "--ocpp-version",
            "1.6",
        ]);
        assert_eq!(args.route, vec!["relay-1", "csms"]);
        assert_eq!(args.ocpp_version, OcppVersion::V16);
        assert_eq!(NodeRole::from(args.role), NodeRole::ChargingStation);
    }
}
