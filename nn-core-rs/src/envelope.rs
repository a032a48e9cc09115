//! Message envelope
//!
//! Transport-agnostic request and response values. Message schemas are
//! opaque at this level: a payload is either a JSON value or raw bytes, and
//! the catalog decides how to read it.
//!
//! Failure outcomes are values. Every request that was submitted for sending
//! ends in a [`Response`], built through one of the constructors below
//! (`timeout`, `network_error`, `formation_violation`, ...).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{EventTrackingId, NetworkPath, NodeId, RequestId, SourceRouting};

/// JSON member carrying detached message signatures
pub const SIGNATURES_MEMBER: &str = "signatures";

/// Message payload, tagged by transport encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Empty JSON object payload (`{}`)
    pub fn empty_object() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }

    pub fn has_signatures(&self) -> bool {
        self.as_json()
            .and_then(|v| v.get(SIGNATURES_MEMBER))
            .is_some()
    }

    /// Copy of this payload without a top-level `signatures` member
    pub fn without_signatures(&self) -> Payload {
        match self {
            Payload::Json(Value::Object(map)) if map.contains_key(SIGNATURES_MEMBER) => {
                let mut map = map.clone();
                map.remove(SIGNATURES_MEMBER);
                Payload::Json(Value::Object(map))
            }
            other => other.clone(),
        }
    }
}

/// Outcome of a request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    /// Payload failed to parse against its schema
    FormationViolation,
    /// Signature validation failed on a signed payload
    SignatureError,
    /// Destination unreachable
    NetworkError,
    /// A relay's filter chain declined to forward
    Filtered,
    /// Unexpected fault inside the dispatch machinery
    Exception,
    /// No reply within the deadline
    Timeout,
    /// Caller cancelled before a reply arrived
    Cancelled,
    /// No handler produced a response
    Failed,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }

    /// OCPP-J CALLERROR code used when this result travels without a payload
    pub fn ocpp_error_code(&self) -> &'static str {
        match self {
            ResultCode::Ok => "GenericError",
            ResultCode::FormationViolation => "FormationViolation",
            ResultCode::SignatureError => "SecurityError",
            ResultCode::Exception => "InternalError",
            ResultCode::Failed => "NotImplemented",
            ResultCode::NetworkError
            | ResultCode::Filtered
            | ResultCode::Timeout
            | ResultCode::Cancelled => "GenericError",
        }
    }

    /// Best match for an OCPP-J CALLERROR code received from a plain peer
    pub fn from_ocpp_error_code(code: &str) -> Self {
        match code {
            "FormationViolation"
            | "FormatViolation"
            | "ProtocolError"
            | "TypeConstraintViolation"
            | "PropertyConstraintViolation"
            | "OccurrenceConstraintViolation"
            | "OccurenceConstraintViolation" => ResultCode::FormationViolation,
            "SecurityError" => ResultCode::SignatureError,
            "NotImplemented" | "NotSupported" | "MessageTypeNotSupported" => ResultCode::Failed,
            _ => ResultCode::Exception,
        }
    }

    /// Numeric tag used by the binary framing
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ResultCode::Ok => 1,
            ResultCode::FormationViolation => 2,
            ResultCode::SignatureError => 3,
            ResultCode::NetworkError => 4,
            ResultCode::Filtered => 5,
            ResultCode::Exception => 6,
            ResultCode::Timeout => 7,
            ResultCode::Cancelled => 8,
            ResultCode::Failed => 9,
        }
    }

    pub(crate) fn from_wire(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ResultCode::Ok,
            2 => ResultCode::FormationViolation,
            3 => ResultCode::SignatureError,
            4 => ResultCode::NetworkError,
            5 => ResultCode::Filtered,
            6 => ResultCode::Exception,
            7 => ResultCode::Timeout,
            8 => ResultCode::Cancelled,
            9 => ResultCode::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Framing-level validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("missing request id")]
    MissingRequestId,

    #[error("missing action")]
    MissingAction,

    #[error("routing path contains an empty node id")]
    EmptyHop,

    #[error("request expired {0:?} ago")]
    Expired(Duration),
}

/// An immutable request envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    action: String,
    request_id: RequestId,
    destination: SourceRouting,
    network_path: NetworkPath,
    created_at: DateTime<Utc>,
    timeout: Duration,
    event_tracking_id: EventTrackingId,
    payload: Payload,
}

impl Request {
    /// New request with fresh request and event-tracking ids
    pub fn new(
        action: impl Into<String>,
        destination: SourceRouting,
        payload: Payload,
        timeout: Duration,
    ) -> Self {
        Self {
            action: action.into(),
            request_id: RequestId::random(),
            destination,
            network_path: NetworkPath::new(),
            created_at: Utc::now(),
            timeout,
            event_tracking_id: EventTrackingId::random(),
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_destination(mut self, destination: SourceRouting) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_network_path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = network_path;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_tracking_id(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = event_tracking_id;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn destination(&self) -> &SourceRouting {
        &self.destination
    }

    pub fn network_path(&self) -> &NetworkPath {
        &self.network_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn event_tracking_id(&self) -> &EventTrackingId {
        &self.event_tracking_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// `timeout - (now - created_at)`, or `None` once nothing is left.
    ///
    /// A creation timestamp in the future (clock skew between hops) counts
    /// as zero elapsed time.
    pub fn remaining_timeout(&self, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
        self.timeout
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }

    /// Same request restamped at `now` with only the remaining time left.
    ///
    /// Used when a relay passes the request on, so the next hop never sees
    /// the full original timeout again.
    pub fn rebased(&self, now: DateTime<Utc>) -> Option<Request> {
        let remaining = self.remaining_timeout(now)?;
        Some(self.clone().with_created_at(now).with_timeout(remaining))
    }

    /// Request as seen by `node` on arrival
    pub fn arrived_at(self, node: &NodeId) -> Request {
        let destination = self.destination.arrived_at(node);
        self.with_destination(destination)
    }

    /// Request with `node` appended to its network path
    pub fn relayed_by(self, node: &NodeId) -> Request {
        let network_path = self.network_path.appended(node);
        self.with_network_path(network_path)
    }

    /// Routing for a reply to this request
    pub fn reply_routing(&self) -> SourceRouting {
        self.network_path.reply_routing()
    }

    /// Framing checks: ids present, hops well formed, time left
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), EnvelopeError> {
        if self.request_id.as_str().is_empty() {
            return Err(EnvelopeError::MissingRequestId);
        }
        if self.action.is_empty() {
            return Err(EnvelopeError::MissingAction);
        }
        let hops = self.destination.hops().iter();
        if hops.chain(self.network_path.nodes()).any(NodeId::is_empty) {
            return Err(EnvelopeError::EmptyHop);
        }
        if self.remaining_timeout(now).is_none() {
            let overdue = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
            return Err(EnvelopeError::Expired(overdue.saturating_sub(self.timeout)));
        }
        Ok(())
    }
}

/// An immutable response envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    request_id: RequestId,
    action: String,
    result: ResultCode,
    description: Option<String>,
    payload: Option<Payload>,
    destination: SourceRouting,
    network_path: NetworkPath,
    event_tracking_id: Option<EventTrackingId>,
    timestamp: DateTime<Utc>,
    runtime: Duration,
}

impl Response {
    /// Response built only from a request id and action, used when the
    /// original request is no longer at hand (correlation table, decoding).
    pub fn synthesized(
        request_id: RequestId,
        action: impl Into<String>,
        result: ResultCode,
        description: Option<String>,
    ) -> Self {
        Self {
            request_id,
            action: action.into(),
            result,
            description,
            payload: None,
            destination: SourceRouting::local(),
            network_path: NetworkPath::new(),
            event_tracking_id: None,
            timestamp: Utc::now(),
            runtime: Duration::ZERO,
        }
    }

    fn for_request(request: &Request, result: ResultCode, description: Option<String>) -> Self {
        let mut response =
            Self::synthesized(request.request_id.clone(), &request.action, result, description);
        response.destination = request.reply_routing();
        response.event_tracking_id = Some(request.event_tracking_id.clone());
        response
    }

    /// Successful reply carrying `payload`
    pub fn ok(request: &Request, payload: Payload) -> Self {
        Self::for_request(request, ResultCode::Ok, None).with_payload(payload)
    }

    pub fn formation_violation(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::FormationViolation, Some(description.into()))
    }

    pub fn signature_error(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::SignatureError, Some(description.into()))
    }

    pub fn network_error(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::NetworkError, Some(description.into()))
    }

    pub fn timeout(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::Timeout, Some(description.into()))
    }

    pub fn cancelled(request: &Request) -> Self {
        Self::for_request(
            request,
            ResultCode::Cancelled,
            Some("request cancelled by caller".to_string()),
        )
    }

    pub fn exception(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::Exception, Some(description.into()))
    }

    /// Generic failure, e.g. no handler answered
    pub fn failed(request: &Request, description: impl Into<String>) -> Self {
        Self::for_request(request, ResultCode::Failed, Some(description.into()))
    }

    /// Relay-side rejection, optionally carrying a message-specific
    /// "rejected" payload
    pub fn filtered(
        request: &Request,
        payload: Option<Payload>,
        description: impl Into<String>,
    ) -> Self {
        let mut response =
            Self::for_request(request, ResultCode::Filtered, Some(description.into()));
        response.payload = payload;
        response
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_result(mut self, result: ResultCode, description: Option<String>) -> Self {
        self.result = result;
        self.description = description;
        self
    }

    /// Drops the payload, e.g. after it failed to parse
    pub fn without_payload(mut self) -> Self {
        self.payload = None;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_destination(mut self, destination: SourceRouting) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_network_path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = network_path;
        self
    }

    pub fn with_event_tracking_id(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(event_tracking_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn destination(&self) -> &SourceRouting {
        &self.destination
    }

    pub fn network_path(&self) -> &NetworkPath {
        &self.network_path
    }

    pub fn event_tracking_id(&self) -> Option<&EventTrackingId> {
        self.event_tracking_id.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn arrived_at(self, node: &NodeId) -> Response {
        let destination = self.destination.arrived_at(node);
        self.with_destination(destination)
    }

    pub fn relayed_by(self, node: &NodeId) -> Response {
        let network_path = self.network_path.appended(node);
        self.with_network_path(network_path)
    }
}
