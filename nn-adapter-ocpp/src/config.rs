//! Configuration for the OCPP adapter
//!
//! Covers the WebSocket side of a node: which OCPP version it speaks, where
//! it listens for downstream peers and which upstream node it dials.

use std::net::SocketAddr;
use std::time::Duration;

use crate::ocpp::OcppVersion;

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    // Node identity
    pub node_id: String,

    // OCPP settings
    pub ocpp_version: OcppVersion,

    // Server side
    /// Address accepting downstream connections (stations or relays)
    pub listen: Option<SocketAddr>,

    /// Base path; peers connect to `<ws_path>/<their node id>`
    pub ws_path: String,

    // Client side
    pub upstream: Option<UpstreamConfig>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Largest WebSocket message accepted from a peer
    pub max_message_size: usize,
}

/// Upstream node this node dials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// WebSocket URL without the node id suffix
    pub url: String,

    /// Node id of the upstream peer, used to name the connection
    pub peer_id: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            node_id: "nn-node".to_string(),
            ocpp_version: OcppVersion::V21,
            listen: None,
            ws_path: "/ocpp".to_string(),
            upstream: None,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 2 * 1024 * 1024,
        }
    }
}

impl AdapterConfig {
    pub fn new(node_id: impl Into<String>, ocpp_version: OcppVersion) -> Self {
        Self {
            node_id: node_id.into(),
            ocpp_version,
            ..Default::default()
        }
    }

    /// Accept downstream connections on `addr`
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Dial `peer_id` at `url`
    pub fn with_upstream(mut self, url: impl Into<String>, peer_id: impl Into<String>) -> Self {
        self.upstream = Some(UpstreamConfig {
            url: url.into(),
            peer_id: peer_id.into(),
        });
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// URL the client dials: upstream URL with this node's id appended
    pub fn upstream_url(&self) -> Option<String> {
        self.upstream
            .as_ref()
            .map(|upstream| format!("{}/{}", upstream.url.trim_end_matches('/'), self.node_id))
    }

    /// Next reconnect delay after `current`
    pub fn next_reconnect_delay(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.max_reconnect_delay)
    }
}
