//! Networking node
//!
//! Composes the correlation table, the three dispatchers and the lifecycle
//! events around one transport. Inbound frames are routed by kind:
//!
//! - requests for this node go to the inbound dispatcher
//! - requests with hops left go to the forwarding engine (relays only)
//! - responses with hops left are passed on unchanged
//! - responses for this node resolve the pending request

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Operation};
use crate::config::{ConfigError, NodeConfig};
use crate::correlation::CorrelationTable;
use crate::envelope::{EnvelopeError, Request, Response, ResultCode};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::forward::{Filter, FilterChain, FilterContext, FilterDecision, ForwardingDecision, ForwardingEngine, RequestFilter};
use crate::inbound::{HandlerContext, HandlerRegistry, InboundDispatcher};
use crate::outbound::{OperationResponse, OutboundDispatcher, SendOptions};
use crate::signature::SignatureVerifier;
use crate::transport::{SendResult, Transport};
use crate::types::{NodeId, RequestId, SourceRouting};
use crate::wire::{self, Envelope, WireFrame};

/// Collects handlers, filters and subscribers before the node starts
pub struct NodeBuilder {
    config: NodeConfig,
    catalog: Catalog,
    handlers: HandlerRegistry,
    filters: FilterChain,
    verifiers: Vec<Arc<dyn SignatureVerifier>>,
    events: LifecycleEvents,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig, catalog: Catalog) -> Self {
        let events = LifecycleEvents::new(config.audit_capacity);
        Self {
            config,
            catalog,
            handlers: HandlerRegistry::new(),
            filters: FilterChain::new(),
            verifiers: Vec::new(),
            events,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Terminal handler for requests addressed to this node
    pub fn on<O, F, Fut>(mut self, handler: F) -> Self
    where
        O: Operation,
        F: Fn(HandlerContext, O::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<O::Response>> + Send + 'static,
    {
        self.handlers.on::<O, F, Fut>(handler);
        self
    }

    /// Forwarding filter for requests passing through
    pub fn filter<O, F>(mut self, filter: F) -> Self
    where
        O: Operation,
        F: Fn(&FilterContext<'_>, &O::Request) -> Option<FilterDecision<O>> + Send + Sync + 'static,
    {
        self.filters.add_fn::<O, F>(filter);
        self
    }

    pub fn filter_with<O: Operation>(mut self, filter: impl Filter<O>) -> Self {
        self.filters.add::<O>(filter);
        self
    }

    pub fn request_filter(mut self, action: impl Into<String>, filter: Arc<dyn RequestFilter>) -> Self {
        self.filters.add_request_filter(action, filter);
        self
    }

    pub fn verifier(mut self, verifier: impl SignatureVerifier) -> Self {
        self.verifiers.push(Arc::new(verifier));
        self
    }

    pub fn subscribe<F>(self, callback: F) -> Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback);
        self
    }

    /// Start the node on `transport`. Must be called within a Tokio
    /// runtime; the correlation reaper is spawned here.
    pub fn build(self, transport: Arc<dyn Transport>) -> Result<NetworkingNode, ConfigError> {
        self.config.validate()?;

        if let Some(action) = self.filters.actions().find(|action| !self.catalog.contains(action)) {
            return Err(ConfigError::UnknownAction(action.to_string()));
        }

        let missing = self.handlers.missing_handlers(&self.catalog);
        if !missing.is_empty() {
            if self.config.strict_handlers {
                return Err(ConfigError::MissingHandler(missing[0].to_string()));
            }
            debug!("{}: no handlers for {}", self.config.node_id, missing.join(", "));
        }

        let config = Arc::new(self.config);
        let events = Arc::new(self.events);
        let table = Arc::new(CorrelationTable::with_grace_period(config.grace_period));
        let shutdown = CancellationToken::new();
        let reaper = table.spawn_reaper(config.reaper_interval, shutdown.clone());

        let outbound = OutboundDispatcher::new(config.clone(), transport.clone(), table.clone(), events.clone());
        let inbound = InboundDispatcher::new(
            config.clone(),
            self.catalog.clone(),
            self.handlers,
            self.verifiers.clone(),
            events.clone(),
        );
        let forwarding =
            ForwardingEngine::new(config.clone(), self.catalog.clone(), self.filters, self.verifiers, events.clone());

        info!("Node {} started as {}", config.node_id, config.role);

        Ok(NetworkingNode {
            inner: Arc::new(NodeInner {
                config,
                catalog: self.catalog,
                transport,
                table,
                events,
                outbound,
                inbound,
                forwarding,
                shutdown,
                reaper,
            }),
        })
    }
}

struct NodeInner {
    config: Arc<NodeConfig>,
    catalog: Catalog,
    transport: Arc<dyn Transport>,
    table: Arc<CorrelationTable>,
    events: Arc<LifecycleEvents>,
    outbound: OutboundDispatcher,
    inbound: InboundDispatcher,
    forwarding: ForwardingEngine,
    shutdown: CancellationToken,
    reaper: JoinHandle<()>,
}

/// A running node; cheap to clone
#[derive(Clone)]
pub struct NetworkingNode {
    inner: Arc<NodeInner>,
}

impl NetworkingNode {
    pub fn builder(config: NodeConfig, catalog: Catalog) -> NodeBuilder {
        NodeBuilder::new(config, catalog)
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &LifecycleEvents {
        &self.inner.events
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.inner.table
    }

    pub fn outbound(&self) -> &OutboundDispatcher {
        &self.inner.outbound
    }

    pub fn inbound(&self) -> &InboundDispatcher {
        &self.inner.inbound
    }

    pub fn forwarding(&self) -> &ForwardingEngine {
        &self.inner.forwarding
    }

    /// Token cancelled on [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Send a typed request and wait for the typed reply
    pub async fn send<O: Operation>(
        &self,
        destination: SourceRouting,
        message: &O::Request,
        options: SendOptions,
    ) -> OperationResponse<O> {
        self.inner.outbound.send_operation::<O>(destination, message, options).await
    }

    /// Send a prepared request envelope. Payloads of cataloged actions
    /// are checked on the way out and the reply's on the way back; either
    /// failing yields `FormationViolation`.
    pub async fn send_request(&self, request: Request, cancel: &CancellationToken) -> Response {
        let Some(entry) = self.inner.catalog.get(request.action()).cloned() else {
            return self.inner.outbound.send(request, cancel).await;
        };

        if let Err(e) = entry.check_request(request.payload()) {
            warn!("{}: refusing to send {} {}: {}", self.id(), request.action(), request.request_id(), e);
            return Response::formation_violation(&request, e.to_string());
        }

        let response = self.inner.outbound.send(request, cancel).await;
        let checked = match response.payload() {
            Some(payload) if response.is_ok() => entry.check_response(payload),
            _ => Ok(()),
        };
        match checked {
            Ok(()) => response,
            Err(e) => response
                .without_payload()
                .with_result(ResultCode::FormationViolation, Some(e.to_string())),
        }
    }

    /// Entry point for every frame the transport receives on `connection`
    pub async fn on_frame_received(&self, connection: &NodeId, frame: WireFrame) {
        match wire::decode(&frame, self.inner.config.request_timeout) {
            Ok(Envelope::Request(request)) => {
                let node = self.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    node.handle_request(&connection, request).await;
                });
            }
            Ok(Envelope::Response(response)) => self.handle_response(connection, response).await,
            Err(e) => match e.call_id() {
                Some(id) => {
                    debug!("{}: malformed request from {}: {}", self.id(), connection, e);
                    let response = Response::synthesized(
                        RequestId::new(id),
                        "",
                        ResultCode::FormationViolation,
                        Some(e.to_string()),
                    );
                    self.send_response(connection, response).await;
                }
                None => warn!("{}: dropping undecodable frame from {}: {}", self.id(), connection, e),
            },
        }
    }

    async fn handle_request(&self, connection: &NodeId, request: Request) {
        let request = request.arrived_at(self.id());

        if let Err(e) = request.validate(Utc::now()) {
            let response = match e {
                EnvelopeError::Expired(_) => Response::timeout(&request, e.to_string()),
                _ => Response::formation_violation(&request, e.to_string()),
            };
            self.send_response(connection, response).await;
            return;
        }

        if request.destination().is_empty() {
            let response = self.inner.inbound.dispatch(connection, request).await;
            self.send_response(connection, response).await;
        } else if self.inner.config.forwards() {
            self.relay_request(connection, request).await;
        } else {
            let destination = request.destination().to_string();
            let response = Response::network_error(&request, format!("{} does not relay to {}", self.id(), destination));
            self.send_response(connection, response).await;
        }
    }

    async fn relay_request(&self, connection: &NodeId, request: Request) {
        self.inner.events.notify(LifecycleEvent::RequestReceived {
            connection: connection.clone(),
            request: Arc::new(request.clone()),
        });
        let decision = self.inner.forwarding.process(connection, request);

        match decision.as_ref() {
            ForwardingDecision::Reject { response, frame, .. } => {
                let hop = response.destination().next_hop().unwrap_or(connection).clone();
                self.transmit_response(&hop, response.clone(), frame.clone()).await;
            }
            ForwardingDecision::Forward { outbound, frame, .. }
            | ForwardingDecision::Replace {
                replacement: outbound,
                frame,
                ..
            } => {
                let Some(next_hop) = outbound.destination().next_hop().cloned() else {
                    return;
                };
                match self.inner.transport.send_frame(&next_hop, frame.clone()).await {
                    SendResult::Sent => {
                        debug!("{}: relayed {} {} to {}", self.id(), outbound.action(), outbound.request_id(), next_hop);
                        self.inner.events.notify(LifecycleEvent::RequestSent {
                            connection: next_hop,
                            request: Arc::new(outbound.clone()),
                        });
                    }
                    failure => {
                        warn!(
                            "{}: cannot relay {} {} to {}: {}",
                            self.id(),
                            outbound.action(),
                            outbound.request_id(),
                            next_hop,
                            failure
                        );
                        let response =
                            Response::network_error(decision.request(), format!("{}: {}", next_hop, failure));
                        self.send_response(connection, response).await;
                    }
                }
            }
        }
    }

    async fn handle_response(&self, connection: &NodeId, response: Response) {
        let response = response.arrived_at(self.id());

        if response.destination().is_empty() {
            self.inner.outbound.deliver(connection, response);
            return;
        }

        if !self.inner.config.forwards() {
            warn!(
                "{}: dropping reply {} from {} still addressed to {}",
                self.id(),
                response.request_id(),
                connection,
                response.destination()
            );
            return;
        }

        // Replies travel back unfiltered
        let response = response.relayed_by(self.id());
        let Some(next_hop) = response.destination().next_hop().cloned() else {
            return;
        };
        let frame = wire::encode_response(&response, self.inner.config.wire_format, self.inner.config.include_signatures);
        match self.inner.transport.send_frame(&next_hop, frame).await {
            SendResult::Sent => debug!("{}: relayed reply {} to {}", self.id(), response.request_id(), next_hop),
            failure => warn!(
                "{}: dropping reply {} for {}: {}",
                self.id(),
                response.request_id(),
                next_hop,
                failure
            ),
        }
    }

    /// Send a locally produced reply back along the request's path
    async fn send_response(&self, connection: &NodeId, response: Response) {
        let response = response.relayed_by(self.id());
        let hop = response.destination().next_hop().unwrap_or(connection).clone();
        let frame = wire::encode_response(&response, self.inner.config.wire_format, self.inner.config.include_signatures);
        self.transmit_response(&hop, response, frame).await;
    }

    async fn transmit_response(&self, hop: &NodeId, response: Response, frame: WireFrame) {
        match self.inner.transport.send_frame(hop, frame).await {
            SendResult::Sent => {
                self.inner.events.notify(LifecycleEvent::ResponseSent {
                    connection: hop.clone(),
                    response: Arc::new(response),
                });
            }
            failure => warn!(
                "{}: could not send {} reply {} to {}: {}",
                self.id(),
                response.action(),
                response.request_id(),
                hop,
                failure
            ),
        }
    }

    /// Fail every request still waiting on `peer`
    pub fn connection_lost(&self, peer: &NodeId) {
        let failed = self.inner.table.fail_connection(peer);
        info!("{}: connection to {} lost, {} requests failed", self.id(), peer, failed);
    }

    pub fn shutdown(&self) {
        info!("Node {} shutting down", self.id());
        self.inner.shutdown.cancel();
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.reaper.abort();
    }
}
