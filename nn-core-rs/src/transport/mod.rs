//! Transport boundary
//!
//! A transport moves already-encoded frames to a connected peer. Inbound
//! frames are handed to [`NetworkingNode::on_frame_received`] by whatever
//! owns the connection's read loop.
//!
//! [`NetworkingNode::on_frame_received`]: crate::node::NetworkingNode::on_frame_received

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::NetworkingNode;
use crate::types::NodeId;
use crate::wire::WireFrame;

/// Outcome of handing a frame to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    /// No connection to the requested peer
    NotConnected,
    Failed(String),
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

impl std::fmt::Display for SendResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendResult::Sent => write!(f, "sent"),
            SendResult::NotConnected => write!(f, "not connected"),
            SendResult::Failed(reason) => write!(f, "send failed: {}", reason),
        }
    }
}

/// Connection-level errors of concrete transports
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to {0}")]
    NotConnected(NodeId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for SendResult {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected(_) => SendResult::NotConnected,
            other => SendResult::Failed(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame on the connection to `connection`
    async fn send_frame(&self, connection: &NodeId, frame: WireFrame) -> SendResult;

    /// Peers currently connected
    fn connections(&self) -> Vec<NodeId>;
}

/// Item a transport hands to its node
#[derive(Debug)]
pub enum InboxItem {
    Frame { from: NodeId, frame: WireFrame },
    Disconnected(NodeId),
}

/// Receiving half of a transport, owned by one node
pub struct Inbox {
    node: NodeId,
    rx: mpsc::UnboundedReceiver<InboxItem>,
}

impl Inbox {
    /// New inbox for `node` and the sender its transport feeds
    pub fn channel(node: NodeId) -> (mpsc::UnboundedSender<InboxItem>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Inbox { node, rx })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub async fn recv(&mut self) -> Option<InboxItem> {
        self.rx.recv().await
    }

    /// Feed every item into `node` until the transport goes away
    pub fn spawn(mut self, node: NetworkingNode) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = self.rx.recv().await {
                match item {
                    InboxItem::Frame { from, frame } => node.on_frame_received(&from, frame).await,
                    InboxItem::Disconnected(peer) => node.connection_lost(&peer),
                }
            }
            debug!("{}: inbox closed", self.node);
        })
    }
}
