//! Core identifiers for networking nodes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a node in the overlay network (station, relay or CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Request identifier, unique per originator while its response is pending
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh UUIDv4-based identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlates a causal chain of requests and responses across hops
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hops a message still has to traverse.
///
/// The first hop is the connection the message is sent on, the last one is
/// the final destination. An empty routing means "this node".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRouting(Vec<NodeId>);

impl SourceRouting {
    /// Single-hop routing to a directly connected node
    pub fn to(node: impl Into<NodeId>) -> Self {
        Self(vec![node.into()])
    }

    /// Explicit multi-hop path, next hop first
    pub fn via<I, N>(hops: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Self(hops.into_iter().map(Into::into).collect())
    }

    /// Routing that terminates at the receiving node
    pub fn local() -> Self {
        Self(Vec::new())
    }

    pub fn next_hop(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn final_destination(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Routing as seen after arriving at `node`: the leading hop is dropped
    /// when it names that node.
    pub fn arrived_at(&self, node: &NodeId) -> Self {
        match self.0.split_first() {
            Some((first, rest)) if first == node => Self(rest.to_vec()),
            _ => self.clone(),
        }
    }
}

impl std::fmt::Display for SourceRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(local)");
        }
        let hops: Vec<&str> = self.0.iter().map(NodeId::as_str).collect();
        f.write_str(&hops.join(" -> "))
    }
}

/// Nodes a message has traversed so far, originator first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_nodes<I, N>(nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Self(nodes.into_iter().map(Into::into).collect())
    }

    /// Path extended by `node`, unless it is already the last entry
    pub fn appended(&self, node: &NodeId) -> Self {
        let mut nodes = self.0.clone();
        if nodes.last() != Some(node) {
            nodes.push(node.clone());
        }
        Self(nodes)
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Routing that walks this path backwards, used to address replies
    pub fn reply_routing(&self) -> SourceRouting {
        SourceRouting(self.0.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrived_at_strips_own_hop() {
        let routing = SourceRouting::via(["relay", "cs1"]);
        let relay = NodeId::from("relay");

        let remaining = routing.arrived_at(&relay);
        assert_eq!(remaining.hops(), &[NodeId::from("cs1")]);

        // Not addressed to us: unchanged
        let other = NodeId::from("other");
        assert_eq!(routing.arrived_at(&other), routing);
    }

    #[test]
    fn test_reply_routing_reverses_path() {
        let path = NetworkPath::from_nodes(["csms", "relay"]);
        let reply = path.reply_routing();

        assert_eq!(reply.next_hop(), Some(&NodeId::from("relay")));
        assert_eq!(reply.final_destination(), Some(&NodeId::from("csms")));
    }

    #[test]
    fn test_appended_is_idempotent_for_last_node() {
        let node = NodeId::from("relay");
        let path = NetworkPath::new().appended(&node).appended(&node);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_routing_display() {
        assert_eq!(SourceRouting::local().to_string(), "(local)");
        assert_eq!(SourceRouting::via(["a", "b"]).to_string(), "a -> b");
    }
}
