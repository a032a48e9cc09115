//! Forwarding decision engine
//!
//! Every request a relay receives for another node runs through the same
//! stages, terminating in one decision:
//!
//! 1. the payload is parsed with the catalog; unknown or malformed
//!    requests, bad signatures and expired requests are rejected and no
//!    filter ever sees them
//! 2. filters registered for the action run in registration order, the
//!    first decision wins and a panicking filter counts as "no decision"
//! 3. without a decision, the per-action default applies, then the global
//!    default
//! 4. the decision is serialized: an outbound request frame for the next
//!    hop, or a response frame back to the sender
//!
//! [`ForwardingEngine::decide`] is pure; [`ForwardingEngine::process`] adds
//! the `RequestFiltered` notification.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::catalog::{Catalog, Operation};
use crate::config::{DefaultForwardingDecision, NodeConfig};
use crate::envelope::{Payload, Request, Response};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::signature::{verify_signed, SignatureVerifier};
use crate::types::NodeId;
use crate::wire::{self, WireFrame};

/// Description of responses rejected by the default forwarding policy
pub const FILTERED_BY_DEFAULT_POLICY: &str = "Filtered by default forwarding policy";

/// What a filter gets to see besides the typed request
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub node_id: &'a NodeId,
    /// Connection the request arrived on
    pub connection: &'a NodeId,
    pub request: &'a Request,
}

/// Decision of a typed filter
pub enum FilterDecision<O: Operation> {
    Forward,
    /// Forward this request instead of the received one
    Replace(O::Request),
    /// Answer locally with `response`
    Reject { response: O::Response, reason: String },
}

impl<O: Operation> FilterDecision<O> {
    /// Reject with the operation's standard rejected response
    pub fn reject(request: &O::Request, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        FilterDecision::Reject {
            response: O::rejected(request, &reason),
            reason,
        }
    }
}

/// Filter for one operation
pub trait Filter<O: Operation>: Send + Sync + 'static {
    fn filter(&self, ctx: &FilterContext<'_>, request: &O::Request) -> Option<FilterDecision<O>>;
}

/// Decision of an action-independent filter
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward,
    Replace(Payload),
    /// Without a payload the operation's rejected response is used
    Reject { payload: Option<Payload>, reason: String },
}

/// Filter working on the raw envelope, installable for any action
pub trait RequestFilter: Send + Sync + 'static {
    fn filter(&self, ctx: &FilterContext<'_>) -> Option<Verdict>;
}

struct FnFilter<F>(F);

impl<O, F> Filter<O> for FnFilter<F>
where
    O: Operation,
    F: Fn(&FilterContext<'_>, &O::Request) -> Option<FilterDecision<O>> + Send + Sync + 'static,
{
    fn filter(&self, ctx: &FilterContext<'_>, request: &O::Request) -> Option<FilterDecision<O>> {
        (self.0)(ctx, request)
    }
}

/// Filter outcome after type erasure
enum Outcome {
    Verdict(Verdict),
    /// The filter's decision could not be serialized
    Fault(String),
}

trait ErasedFilter: Send + Sync {
    fn run(&self, ctx: &FilterContext<'_>, parsed: &(dyn Any + Send + Sync)) -> Option<Outcome>;
}

struct Typed<O: Operation>(Arc<dyn Filter<O>>);

impl<O: Operation> ErasedFilter for Typed<O> {
    fn run(&self, ctx: &FilterContext<'_>, parsed: &(dyn Any + Send + Sync)) -> Option<Outcome> {
        let Some(request) = parsed.downcast_ref::<O::Request>() else {
            error!("Filter for {} got a request of another type", O::ACTION);
            return None;
        };

        let outcome = match self.0.filter(ctx, request)? {
            FilterDecision::Forward => Outcome::Verdict(Verdict::Forward),
            FilterDecision::Replace(replacement) => match O::request_payload(&replacement) {
                Ok(payload) => Outcome::Verdict(Verdict::Replace(payload)),
                Err(e) => Outcome::Fault(e.to_string()),
            },
            FilterDecision::Reject { response, reason } => match O::response_payload(&response) {
                Ok(payload) => Outcome::Verdict(Verdict::Reject {
                    payload: Some(payload),
                    reason,
                }),
                Err(e) => Outcome::Fault(e.to_string()),
            },
        };
        Some(outcome)
    }
}

struct Untyped(Arc<dyn RequestFilter>);

impl ErasedFilter for Untyped {
    fn run(&self, ctx: &FilterContext<'_>, _parsed: &(dyn Any + Send + Sync)) -> Option<Outcome> {
        self.0.filter(ctx).map(Outcome::Verdict)
    }
}

/// Per-action filter lists, append-only while the node is being built
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: HashMap<String, Vec<Arc<dyn ErasedFilter>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<O: Operation>(&mut self, filter: impl Filter<O>) {
        self.filters
            .entry(O::ACTION.to_string())
            .or_default()
            .push(Arc::new(Typed::<O>(Arc::new(filter))));
    }

    pub fn add_fn<O, F>(&mut self, filter: F)
    where
        O: Operation,
        F: Fn(&FilterContext<'_>, &O::Request) -> Option<FilterDecision<O>> + Send + Sync + 'static,
    {
        self.add::<O>(FnFilter(filter));
    }

    pub fn add_request_filter(&mut self, action: impl Into<String>, filter: Arc<dyn RequestFilter>) {
        self.filters
            .entry(action.into())
            .or_default()
            .push(Arc::new(Untyped(filter)));
    }

    /// Actions with at least one filter
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.filters
            .iter()
            .filter(|(_, filters)| !filters.is_empty())
            .map(|(action, _)| action.as_str())
    }

    pub fn len_for(&self, action: &str) -> usize {
        self.filters.get(action).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.values().all(Vec::is_empty)
    }

    fn run(&self, ctx: &FilterContext<'_>, parsed: &(dyn Any + Send + Sync)) -> Option<Outcome> {
        let filters = self.filters.get(ctx.request.action())?;

        for (index, filter) in filters.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| filter.run(ctx, parsed))) {
                Ok(Some(outcome)) => return Some(outcome),
                Ok(None) => {}
                Err(_) => error!(
                    "Filter #{} for {} panicked on {}, ignoring it",
                    index,
                    ctx.request.action(),
                    ctx.request.request_id()
                ),
            }
        }
        None
    }
}

/// Terminal decision for one inbound request at a relay
#[derive(Debug, Clone)]
pub enum ForwardingDecision {
    Forward {
        request: Request,
        outbound: Request,
        frame: WireFrame,
    },
    Replace {
        request: Request,
        replacement: Request,
        frame: WireFrame,
    },
    Reject {
        request: Request,
        response: Response,
        frame: WireFrame,
    },
}

impl ForwardingDecision {
    /// The request as received
    pub fn request(&self) -> &Request {
        match self {
            ForwardingDecision::Forward { request, .. }
            | ForwardingDecision::Replace { request, .. }
            | ForwardingDecision::Reject { request, .. } => request,
        }
    }

    /// Request to pass on, unless rejected
    pub fn outbound(&self) -> Option<&Request> {
        match self {
            ForwardingDecision::Forward { outbound, .. } => Some(outbound),
            ForwardingDecision::Replace { replacement, .. } => Some(replacement),
            ForwardingDecision::Reject { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            ForwardingDecision::Reject { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn frame(&self) -> &WireFrame {
        match self {
            ForwardingDecision::Forward { frame, .. }
            | ForwardingDecision::Replace { frame, .. }
            | ForwardingDecision::Reject { frame, .. } => frame,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, ForwardingDecision::Reject { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ForwardingDecision::Forward { .. } => "forward",
            ForwardingDecision::Replace { .. } => "replace",
            ForwardingDecision::Reject { .. } => "reject",
        }
    }
}

pub struct ForwardingEngine {
    config: Arc<NodeConfig>,
    catalog: Catalog,
    filters: FilterChain,
    verifiers: Vec<Arc<dyn SignatureVerifier>>,
    events: Arc<LifecycleEvents>,
}

impl ForwardingEngine {
    pub fn new(
        config: Arc<NodeConfig>,
        catalog: Catalog,
        filters: FilterChain,
        verifiers: Vec<Arc<dyn SignatureVerifier>>,
        events: Arc<LifecycleEvents>,
    ) -> Self {
        Self {
            config,
            catalog,
            filters,
            verifiers,
            events,
        }
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Decide and notify `RequestFiltered`
    pub fn process(&self, connection: &NodeId, request: Request) -> Arc<ForwardingDecision> {
        let decision = Arc::new(self.decide(connection, request, Utc::now()));
        debug!(
            "{}: {} {} from {} -> {}",
            self.config.node_id,
            decision.request().action(),
            decision.request().request_id(),
            connection,
            decision.label()
        );
        self.events.notify(LifecycleEvent::RequestFiltered {
            connection: connection.clone(),
            decision: decision.clone(),
        });
        decision
    }

    /// Decision for `request`, which arrived on `connection` and still has
    /// hops to travel
    pub fn decide(&self, connection: &NodeId, request: Request, now: DateTime<Utc>) -> ForwardingDecision {
        let Some(entry) = self.catalog.get(request.action()) else {
            let response = Response::failed(&request, format!("unknown action {}", request.action()));
            return self.reject(request, response);
        };

        let parsed = match entry.parse_request_any(request.payload()) {
            Ok(parsed) => parsed,
            Err(e) => {
                let response = Response::formation_violation(&request, e.to_string());
                return self.reject(request, response);
            }
        };

        if let Err(reason) = verify_signed(&self.verifiers, &request) {
            warn!("Signature check failed for {} {}: {}", request.action(), request.request_id(), reason);
            let response = Response::signature_error(&request, reason);
            return self.reject(request, response);
        }

        if request.remaining_timeout(now).is_none() {
            let response = Response::timeout(&request, "request expired before forwarding");
            return self.reject(request, response);
        }

        let ctx = FilterContext {
            node_id: &self.config.node_id,
            connection,
            request: &request,
        };
        let outcome = self.filters.run(&ctx, &*parsed).unwrap_or_else(|| {
            match self.config.forwarding_default_for(request.action()) {
                DefaultForwardingDecision::Forward => Outcome::Verdict(Verdict::Forward),
                DefaultForwardingDecision::Reject => Outcome::Verdict(Verdict::Reject {
                    payload: None,
                    reason: FILTERED_BY_DEFAULT_POLICY.to_string(),
                }),
            }
        });

        match outcome {
            Outcome::Verdict(Verdict::Forward) => self.pass_on(request, None, now),
            Outcome::Verdict(Verdict::Replace(payload)) => self.pass_on(request, Some(payload), now),
            Outcome::Verdict(Verdict::Reject { payload, reason }) => {
                let payload = payload.or_else(|| entry.rejected_payload(&*parsed, &reason).ok());
                let response = Response::filtered(&request, payload, reason);
                self.reject(request, response)
            }
            Outcome::Fault(reason) => {
                let response = Response::exception(&request, format!("filter decision unusable: {}", reason));
                self.reject(request, response)
            }
        }
    }

    fn pass_on(&self, request: Request, replacement: Option<Payload>, now: DateTime<Utc>) -> ForwardingDecision {
        let Some(rebased) = request.rebased(now) else {
            let response = Response::timeout(&request, "request expired before forwarding");
            return self.reject(request, response);
        };
        let outbound = rebased.relayed_by(&self.config.node_id);

        match replacement {
            None => match wire::encode_request(&outbound, self.config.wire_format, self.config.include_signatures) {
                Ok(frame) => ForwardingDecision::Forward {
                    request,
                    outbound,
                    frame,
                },
                Err(e) => {
                    let response = Response::exception(&request, format!("request encoding failed: {}", e));
                    self.reject(request, response)
                }
            },
            Some(payload) => {
                let replacement = outbound.with_payload(payload);
                match wire::encode_request(&replacement, self.config.wire_format, self.config.include_signatures) {
                    Ok(frame) => ForwardingDecision::Replace {
                        request,
                        replacement,
                        frame,
                    },
                    Err(e) => {
                        let response =
                            Response::exception(&request, format!("replacement encoding failed: {}", e));
                        self.reject(request, response)
                    }
                }
            }
        }
    }

    fn reject(&self, request: Request, response: Response) -> ForwardingDecision {
        let response = response.relayed_by(&self.config.node_id);
        let frame = wire::encode_response(&response, self.config.wire_format, self.config.include_signatures);
        ForwardingDecision::Reject {
            request,
            response,
            frame,
        }
    }
}
