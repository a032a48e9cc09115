//! Outbound dispatcher
//!
//! Sends requests and waits for their correlated replies. Nothing here
//! returns an error: encoding failures, unreachable peers, timeouts and
//! cancellation all come back as a [`Response`] with the matching
//! [`ResultCode`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::Operation;
use crate::config::NodeConfig;
use crate::correlation::CorrelationTable;
use crate::envelope::{Request, Response, ResultCode};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::transport::{SendResult, Transport};
use crate::types::{EventTrackingId, NodeId, RequestId, SourceRouting};
use crate::wire;

/// Per-call options for [`OutboundDispatcher::send_operation`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the node's request timeout
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    /// Continue an existing causal chain instead of starting a new one
    pub event_tracking_id: Option<EventTrackingId>,
}

impl SendOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(id);
        self
    }
}

/// Typed view of a reply
#[derive(Debug, Clone)]
pub struct OperationResponse<O: Operation> {
    pub response: Response,
    /// Parsed payload, when the reply carried one that parsed
    pub payload: Option<O::Response>,
}

impl<O: Operation> OperationResponse<O> {
    pub fn result(&self) -> ResultCode {
        self.response.result()
    }

    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }

    pub fn into_payload(self) -> Option<O::Response> {
        self.payload
    }
}

pub struct OutboundDispatcher {
    config: Arc<NodeConfig>,
    transport: Arc<dyn Transport>,
    table: Arc<CorrelationTable>,
    events: Arc<LifecycleEvents>,
}

impl OutboundDispatcher {
    pub fn new(
        config: Arc<NodeConfig>,
        transport: Arc<dyn Transport>,
        table: Arc<CorrelationTable>,
        events: Arc<LifecycleEvents>,
    ) -> Self {
        Self {
            config,
            transport,
            table,
            events,
        }
    }

    /// Send `request` and wait for its reply, the deadline or `cancel`
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Response {
        let start = Instant::now();
        let request = request.relayed_by(&self.config.node_id);
        let response = self.exchange(request, cancel).await;
        response.with_runtime(start.elapsed())
    }

    async fn exchange(&self, request: Request, cancel: &CancellationToken) -> Response {
        let Some(remaining) = request.remaining_timeout(Utc::now()) else {
            debug!("{} {} expired before sending", request.action(), request.request_id());
            return Response::timeout(&request, "request expired before sending");
        };

        let Some(next_hop) = request.destination().next_hop().cloned() else {
            return Response::network_error(&request, "request has no destination");
        };

        let frame = match wire::encode_request(&request, self.config.wire_format, self.config.include_signatures) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} {}: {}", request.action(), request.request_id(), e);
                return Response::exception(&request, format!("request encoding failed: {}", e));
            }
        };

        let deadline = Instant::now() + remaining;
        let slot = match self.table.register(&request, &next_hop, deadline) {
            Ok(slot) => slot,
            Err(e) => return Response::exception(&request, e.to_string()),
        };

        match self.transport.send_frame(&next_hop, frame).await {
            SendResult::Sent => {
                debug!("Sent {} {} to {}", request.action(), request.request_id(), next_hop);
                self.events.notify(LifecycleEvent::RequestSent {
                    connection: next_hop,
                    request: Arc::new(request),
                });
            }
            failure => {
                warn!(
                    "Could not send {} {} to {}: {}",
                    request.action(),
                    request.request_id(),
                    next_hop,
                    failure
                );
                // Dropping the slot releases the pending entry
                drop(slot);
                return Response::network_error(&request, format!("{}: {}", next_hop, failure));
            }
        }

        slot.wait(deadline, cancel).await
    }

    /// Build a request from a typed message, send it and parse the reply
    pub async fn send_operation<O: Operation>(
        &self,
        destination: SourceRouting,
        message: &O::Request,
        options: SendOptions,
    ) -> OperationResponse<O> {
        let payload = match O::request_payload(message) {
            Ok(payload) => payload,
            Err(e) => {
                let response = Response::synthesized(
                    RequestId::random(),
                    O::ACTION,
                    ResultCode::Exception,
                    Some(e.to_string()),
                );
                return OperationResponse {
                    response,
                    payload: None,
                };
            }
        };

        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let mut request = Request::new(O::ACTION, destination, payload, timeout);
        if let Some(tracking) = options.event_tracking_id {
            request = request.with_event_tracking_id(tracking);
        }

        let response = self.send(request, &options.cancel).await;
        parse_reply::<O>(response)
    }

    /// Hand an arrived reply to the pending request it answers
    pub fn deliver(&self, connection: &NodeId, response: Response) -> bool {
        let request_id = response.request_id().clone();
        let response = Arc::new(response);

        if !self.table.resolve(&request_id, connection, Response::clone(&response)) {
            warn!(
                "Dropping reply {} for {} from {}: no pending request on that connection",
                request_id,
                response.action(),
                connection
            );
            return false;
        }

        self.events.notify(LifecycleEvent::ResponseReceived {
            connection: connection.clone(),
            response,
        });
        true
    }
}

fn parse_reply<O: Operation>(response: Response) -> OperationResponse<O> {
    let parsed = response.payload().map(O::parse_response);

    match parsed {
        Some(Ok(payload)) => OperationResponse {
            response,
            payload: Some(payload),
        },
        Some(Err(e)) if response.is_ok() => OperationResponse {
            response: response
                .without_payload()
                .with_result(ResultCode::FormationViolation, Some(e.to_string())),
            payload: None,
        },
        None if response.is_ok() => OperationResponse {
            response: response.with_result(
                ResultCode::FormationViolation,
                Some("reply carried no payload".to_string()),
            ),
            payload: None,
        },
        _ => OperationResponse {
            response,
            payload: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::testing::{self, Reset};
    use crate::transport::memory::{InboxItem, MemoryNetwork};
    use serde_json::json;

    fn dispatcher(network: &MemoryNetwork, node: &str, timeout: Duration) -> OutboundDispatcher {
        let (transport, _inbox) = network.join(node);
        OutboundDispatcher::new(
            Arc::new(NodeConfig::new(node, crate::config::NodeRole::Csms).with_request_timeout(timeout)),
            Arc::new(transport),
            Arc::new(CorrelationTable::new()),
            Arc::new(LifecycleEvents::default()),
        )
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let network = MemoryNetwork::new();
        let outbound = dispatcher(&network, "csms", Duration::from_secs(5));

        let reply = outbound
            .send_operation::<Reset>(SourceRouting::to("cs1"), &testing::reset("Immediate"), SendOptions::default())
            .await;

        assert_eq!(reply.result(), ResultCode::NetworkError);
        assert!(reply.payload.is_none());
        assert!(outbound.table.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let network = MemoryNetwork::new();
        let outbound = dispatcher(&network, "csms", Duration::from_millis(50));
        let (_cs1, _inbox) = network.join("cs1");
        network.connect("csms", "cs1");
        network.blackhole("cs1");

        let reply = outbound
            .send_operation::<Reset>(SourceRouting::to("cs1"), &testing::reset("Immediate"), SendOptions::default())
            .await;

        assert_eq!(reply.result(), ResultCode::Timeout);
        assert!(reply.response.runtime() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let network = MemoryNetwork::new();
        let outbound = dispatcher(&network, "csms", Duration::from_secs(5));
        let (_cs1, _inbox) = network.join("cs1");
        network.connect("csms", "cs1");
        network.blackhole("cs1");

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let options = SendOptions::default().with_cancel(cancel);
        let reply = outbound
            .send_operation::<Reset>(SourceRouting::to("cs1"), &testing::reset("Immediate"), options)
            .await;

        assert_eq!(reply.result(), ResultCode::Cancelled);
        assert!(outbound.table.is_empty());
    }

    #[tokio::test]
    async fn test_reply_delivered_once() {
        let network = MemoryNetwork::new();
        let outbound = Arc::new(dispatcher(&network, "csms", Duration::from_secs(5)));
        let (_cs1, mut inbox) = network.join("cs1");
        network.connect("csms", "cs1");

        let sender = outbound.clone();
        let call = tokio::spawn(async move {
            sender
                .send_operation::<Reset>(SourceRouting::to("cs1"), &testing::reset("Immediate"), SendOptions::default())
                .await
        });

        let Some(InboxItem::Frame { frame, .. }) = inbox.recv().await else {
            panic!("expected a request frame");
        };
        let wire::Envelope::Request(request) = wire::decode(&frame, Duration::from_secs(30)).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.network_path().origin(), Some(&NodeId::from("csms")));

        let reply = Response::ok(&request, Payload::Json(json!({"status": "Accepted"})));
        let cs1 = NodeId::from("cs1");
        assert!(outbound.deliver(&cs1, reply.clone()));
        assert!(!outbound.deliver(&cs1, reply));

        let result = call.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.payload.unwrap().status, "Accepted");
    }

    #[test]
    fn test_unparseable_reply_is_formation_violation() {
        let request = Request::new(
            "Reset",
            SourceRouting::to("cs1"),
            Payload::Json(json!({"type": "Immediate"})),
            Duration::from_secs(5),
        );
        let reply = Response::ok(&request, Payload::Json(json!({"status": 7})));

        let parsed = parse_reply::<Reset>(reply);
        assert_eq!(parsed.result(), ResultCode::FormationViolation);
        assert!(parsed.payload.is_none());
    }
}
