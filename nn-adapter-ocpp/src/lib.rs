//! # Networking Node OCPP Adapter
//!
//! OCPP 1.6 and 2.1 plumbing for [`nn_core`] networking nodes: message
//! catalogs, ready-made relay filters and a WebSocket transport.
//!
//! ## Architecture
//!
//! ```text
//! Station ──ws──► Relay ──ws──► CSMS
//!                   │
//! ┌─────────────────┴───────────────┐
//! │    nn-adapter-ocpp              │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ WebSocket │  │ v16 / v21  │  │
//! │  │ Transport │  │ catalogs   │  │
//! │  └───────────┘  └────────────┘  │
//! │        filters (blocklist,      │
//! │        allow list)              │
//! └─────────────┬───────────────────┘
//!               │ WireFrame
//!               ▼
//! ┌─────────────────────────────────┐
//! │    nn-core                      │
//! │  Correlation │ Forwarding │ Events
//! └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use nn_adapter_ocpp::{ocpp::v21, AdapterConfig, ComponentBlocklist, OcppVersion, WebSocketTransport};
//! use nn_core::{CancellationToken, NetworkingNode, NodeConfig, NodeRole};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::new("relay-1", OcppVersion::V21)
//!         .with_listen("0.0.0.0:9000".parse()?)
//!         .with_upstream("ws://csms:9100/ocpp", "csms");
//!     let (transport, inbox) = WebSocketTransport::new(config);
//!
//!     let builder = NetworkingNode::builder(NodeConfig::new("relay-1", NodeRole::Relay), v21::catalog());
//!     let node = ComponentBlocklist::new(["SecurityCtrlr"])
//!         .install(builder)
//!         .build(transport.clone())?;
//!     inbox.spawn(node.clone());
//!
//!     let shutdown = CancellationToken::new();
//!     let listener = transport.bind().await?;
//!     tokio::spawn(transport.clone().serve(listener, shutdown.clone()));
//!     transport.run_upstream(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod filters;
pub mod ocpp;
pub mod ws;

pub use config::{AdapterConfig, UpstreamConfig};
pub use filters::{ActionAllowList, ComponentBlocklist};
pub use ocpp::OcppVersion;
pub use ws::WebSocketTransport;
