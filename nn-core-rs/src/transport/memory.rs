//! In-process transport
//!
//! Nodes join a shared [`MemoryNetwork`] and get a [`MemoryTransport`] for
//! sending plus an [`Inbox`] that feeds received frames into their node. Links are bidirectional and can be cut at runtime; a blackholed
//! node accepts frames and never sees them, which is how tests provoke
//! timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub use super::{Inbox, InboxItem};
use super::{SendResult, Transport};
use crate::types::NodeId;
use crate::wire::WireFrame;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<InboxItem>>,
    links: HashSet<(NodeId, NodeId)>,
    blackholed: HashSet<NodeId>,
    delivered: HashMap<NodeId, usize>,
}

impl NetworkState {
    fn linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.links.contains(&(a.clone(), b.clone()))
    }
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; it is reachable once linked to a peer
    pub fn join(&self, node: impl Into<NodeId>) -> (MemoryTransport, Inbox) {
        let node = node.into();
        let (tx, inbox) = Inbox::channel(node.clone());
        self.state.lock().inboxes.insert(node.clone(), tx);
        (
            MemoryTransport {
                node,
                state: self.state.clone(),
            },
            inbox,
        )
    }

    pub fn connect(&self, a: impl Into<NodeId>, b: impl Into<NodeId>) {
        let (a, b) = (a.into(), b.into());
        let mut state = self.state.lock();
        state.links.insert((a.clone(), b.clone()));
        state.links.insert((b, a));
    }

    /// Cut the link and tell both ends their peer is gone
    pub fn disconnect(&self, a: impl Into<NodeId>, b: impl Into<NodeId>) {
        let (a, b) = (a.into(), b.into());
        let mut state = self.state.lock();
        let was_linked = state.links.remove(&(a.clone(), b.clone()));
        state.links.remove(&(b.clone(), a.clone()));
        if !was_linked {
            return;
        }
        if let Some(inbox) = state.inboxes.get(&a) {
            let _ = inbox.send(InboxItem::Disconnected(b.clone()));
        }
        if let Some(inbox) = state.inboxes.get(&b) {
            let _ = inbox.send(InboxItem::Disconnected(a));
        }
    }

    /// Accept frames for `node` but drop them
    pub fn blackhole(&self, node: impl Into<NodeId>) {
        self.state.lock().blackholed.insert(node.into());
    }

    /// Frames handed to `node`'s inbox so far
    pub fn delivered(&self, node: &NodeId) -> usize {
        self.state.lock().delivered.get(node).copied().unwrap_or(0)
    }
}

/// Sending half owned by one node
#[derive(Clone)]
pub struct MemoryTransport {
    node: NodeId,
    state: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&self, connection: &NodeId, frame: WireFrame) -> SendResult {
        let mut state = self.state.lock();
        if !state.linked(&self.node, connection) {
            debug!("{}: no link to {}", self.node, connection);
            return SendResult::NotConnected;
        }
        if state.blackholed.contains(connection) {
            trace!("{}: frame to {} blackholed", self.node, connection);
            return SendResult::Sent;
        }

        let Some(inbox) = state.inboxes.get(connection) else {
            return SendResult::NotConnected;
        };
        let item = InboxItem::Frame {
            from: self.node.clone(),
            frame,
        };
        if inbox.send(item).is_err() {
            return SendResult::Failed(format!("inbox of {} closed", connection));
        }
        *state.delivered.entry(connection.clone()).or_default() += 1;
        SendResult::Sent
    }

    fn connections(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut peers: Vec<NodeId> = state
            .links
            .iter()
            .filter(|(from, _)| from == &self.node)
            .map(|(_, to)| to.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_link() {
        let network = MemoryNetwork::new();
        let (a, _inbox_a) = network.join("a");
        let (_b, mut inbox_b) = network.join("b");
        let frame = WireFrame::Text("[]".into());

        assert_eq!(a.send_frame(&NodeId::from("b"), frame.clone()).await, SendResult::NotConnected);

        network.connect("a", "b");
        assert!(a.send_frame(&NodeId::from("b"), frame.clone()).await.is_sent());
        assert_eq!(a.connections(), vec![NodeId::from("b")]);

        match inbox_b.recv().await {
            Some(InboxItem::Frame { from, frame: received }) => {
                assert_eq!(from, NodeId::from("a"));
                assert_eq!(received, frame);
            }
            other => panic!("unexpected inbox item: {:?}", other),
        }
        assert_eq!(network.delivered(&NodeId::from("b")), 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_ends() {
        let network = MemoryNetwork::new();
        let (_a, mut inbox_a) = network.join("a");
        let (_b, mut inbox_b) = network.join("b");
        network.connect("a", "b");
        network.disconnect("a", "b");

        assert!(matches!(inbox_a.recv().await, Some(InboxItem::Disconnected(peer)) if peer == NodeId::from("b")));
        assert!(matches!(inbox_b.recv().await, Some(InboxItem::Disconnected(peer)) if peer == NodeId::from("a")));
    }

    #[test]
    fn test_blackhole_accepts_and_drops() {
        let network = MemoryNetwork::new();
        let (a, _inbox_a) = network.join("a");
        let (_b, _inbox_b) = network.join("b");
        network.connect("a", "b");
        network.blackhole("b");

        let result = tokio_test::block_on(a.send_frame(&NodeId::from("b"), WireFrame::Text("[]".into())));
        assert!(result.is_sent());
        assert_eq!(network.delivered(&NodeId::from("b")), 0);
    }
}
