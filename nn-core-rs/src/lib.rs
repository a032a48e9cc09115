//! # Networking Node Core
//!
//! Request/response correlation and forwarding engine for OCPP networking
//! nodes: charging stations, relays and central systems in an overlay
//! network where a message may cross several hops.
//!
//! ## Architecture
//!
//! ```text
//!                 NetworkingNode
//!   ┌──────────────────────────────────────────┐
//!   │ OutboundDispatcher ──► CorrelationTable  │
//!   │ InboundDispatcher  ──► HandlerRegistry   │
//!   │ ForwardingEngine   ──► FilterChain       │
//!   │ LifecycleEvents (callbacks + audit)      │
//!   └──────────────┬───────────────────────────┘
//!                  │ WireFrame (JSON / binary)
//!                  ▼
//!              Transport
//! ```
//!
//! Message schemas are plugins: an [`Operation`] names its action and knows
//! how to parse and serialize its payloads; a [`Catalog`] maps actions to
//! operations.
//!
//! ## Routing
//!
//! A request carries its remaining hops ([`SourceRouting`]) and the nodes
//! it already crossed ([`NetworkPath`]). Each node strips itself from the
//! front of the routing on arrival. Replies walk the network path back.
//! Relays pass requests on with only the remaining time left.

pub mod types;
pub mod envelope;
pub mod wire;
pub mod catalog;
pub mod config;
pub mod correlation;
pub mod events;
pub mod signature;
pub mod transport;
pub mod outbound;
pub mod forward;
pub mod inbound;
pub mod node;

#[cfg(test)]
mod testing;

pub use types::*;
pub use envelope::{EnvelopeError, Payload, Request, Response, ResultCode};
pub use wire::{WireError, WireFormat, WireFrame};
pub use catalog::{Catalog, CatalogBuilder, CodecError, Operation};
pub use config::{ConfigError, DefaultForwardingDecision, NodeConfig, NodeRole};
pub use correlation::{CorrelationError, CorrelationTable, ResponseSlot};
pub use events::{LifecycleEvent, LifecycleEvents, SubscriptionId};
pub use signature::SignatureVerifier;
pub use transport::{Inbox, InboxItem, SendResult, Transport, TransportError};
pub use outbound::{OperationResponse, OutboundDispatcher, SendOptions};
pub use forward::{
    Filter, FilterChain, FilterContext, FilterDecision, ForwardingDecision, ForwardingEngine,
    RequestFilter, Verdict, FILTERED_BY_DEFAULT_POLICY,
};
pub use inbound::{HandlerContext, HandlerRegistry, InboundDispatcher};
pub use node::{NetworkingNode, NodeBuilder};

// Re-exported for transports and callers passing cancellation tokens
pub use tokio_util::sync::CancellationToken;
