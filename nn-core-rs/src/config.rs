//! Node configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::DEFAULT_AUDIT_CAPACITY;
use crate::types::NodeId;
use crate::wire::WireFormat;

/// Position of a node in the overlay network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ChargingStation,
    /// Passes traffic on through the forwarding engine
    Relay,
    Csms,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ChargingStation => write!(f, "charging-station"),
            NodeRole::Relay => write!(f, "relay"),
            NodeRole::Csms => write!(f, "csms"),
        }
    }
}

/// What a relay does with a request no filter decided on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultForwardingDecision {
    #[default]
    Forward,
    Reject,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("request timeout must be positive")]
    ZeroTimeout,

    #[error("no handler registered for {0}")]
    MissingHandler(String),

    #[error("{0} is not in the message catalog")]
    UnknownAction(String),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Timeout for requests this node originates
    pub request_timeout: Duration,
    /// Fallback when no filter decided
    pub default_forwarding: DefaultForwardingDecision,
    /// Per-action fallbacks; take precedence over `default_forwarding`
    pub action_defaults: HashMap<String, DefaultForwardingDecision>,
    /// Keep `signatures` members when serializing payloads
    pub include_signatures: bool,
    pub wire_format: WireFormat,
    pub reaper_interval: Duration,
    pub grace_period: Duration,
    /// Refuse to build when a catalog action has no handler
    pub strict_handlers: bool,
    pub audit_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node"),
            role: NodeRole::ChargingStation,
            request_timeout: Duration::from_secs(30),
            default_forwarding: DefaultForwardingDecision::Forward,
            action_defaults: HashMap::new(),
            include_signatures: true,
            wire_format: WireFormat::Json,
            reaper_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            strict_handlers: false,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_forwarding(mut self, decision: DefaultForwardingDecision) -> Self {
        self.default_forwarding = decision;
        self
    }

    pub fn with_action_default(
        mut self,
        action: impl Into<String>,
        decision: DefaultForwardingDecision,
    ) -> Self {
        self.action_defaults.insert(action.into(), decision);
        self
    }

    pub fn with_signatures(mut self, include: bool) -> Self {
        self.include_signatures = include;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_reaper(mut self, interval: Duration, grace_period: Duration) -> Self {
        self.reaper_interval = interval;
        self.grace_period = grace_period;
        self
    }

    pub fn with_strict_handlers(mut self, strict: bool) -> Self {
        self.strict_handlers = strict;
        self
    }

    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    /// Whether requests addressed beyond this node are passed on
    pub fn forwards(&self) -> bool {
        self.role == NodeRole::Relay
    }

    /// Fallback decision for `action`
    pub fn forwarding_default_for(&self, action: &str) -> DefaultForwardingDecision {
        self.action_defaults
            .get(action)
            .copied()
            .unwrap_or(self.default_forwarding)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_default_overrides_global() {
        let config = NodeConfig::new("relay", NodeRole::Relay)
            .with_default_forwarding(DefaultForwardingDecision::Reject)
            .with_action_default("Heartbeat", DefaultForwardingDecision::Forward);

        assert_eq!(config.forwarding_default_for("Heartbeat"), DefaultForwardingDecision::Forward);
        assert_eq!(config.forwarding_default_for("Reset"), DefaultForwardingDecision::Reject);
        assert!(config.forwards());
    }

    #[test]
    fn test_validate() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(matches!(
            NodeConfig::new(" ", NodeRole::Csms).validate(),
            Err(ConfigError::EmptyNodeId)
        ));
        assert!(matches!(
            NodeConfig::default().with_request_timeout(Duration::ZERO).validate(),
            Err(ConfigError::ZeroTimeout)
        ));
    }
}
