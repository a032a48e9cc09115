//! Inbound dispatcher
//!
//! Runs the terminal handlers for requests addressed to this node.
//!
//! All handlers registered for an action run concurrently. The first one to
//! settle with a response wins; the others keep running to completion in
//! the background and their results are dropped. A panicking handler counts
//! as no response. When nothing answers, the sender gets `Failed`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::catalog::{Catalog, CodecError, Operation};
use crate::config::NodeConfig;
use crate::envelope::{Payload, Request, Response};
use crate::events::{LifecycleEvent, LifecycleEvents};
use crate::signature::{verify_signed, SignatureVerifier};
use crate::types::NodeId;

/// What a handler gets to see besides the typed request
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub node_id: NodeId,
    /// Connection the request arrived on
    pub connection: NodeId,
    pub request: Arc<Request>,
}

type HandlerResult = Option<Result<Payload, CodecError>>;

trait ErasedHandler: Send + Sync {
    fn call(
        &self,
        ctx: HandlerContext,
        parsed: &(dyn Any + Send + Sync),
    ) -> Option<BoxFuture<'static, HandlerResult>>;
}

struct Typed<O: Operation, F> {
    handler: F,
    _operation: std::marker::PhantomData<fn() -> O>,
}

impl<O, F, Fut> ErasedHandler for Typed<O, F>
where
    O: Operation,
    F: Fn(HandlerContext, O::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<O::Response>> + Send + 'static,
{
    fn call(
        &self,
        ctx: HandlerContext,
        parsed: &(dyn Any + Send + Sync),
    ) -> Option<BoxFuture<'static, HandlerResult>> {
        let request = parsed.downcast_ref::<O::Request>()?.clone();
        let response = (self.handler)(ctx, request);
        Some(
            async move {
                let response = response.await?;
                Some(O::response_payload(&response))
            }
            .boxed(),
        )
    }
}

/// Handlers per action, fixed once the node is built
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<O, F, Fut>(&mut self, handler: F)
    where
        O: Operation,
        F: Fn(HandlerContext, O::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<O::Response>> + Send + 'static,
    {
        self.handlers
            .entry(O::ACTION.to_string())
            .or_default()
            .push(Arc::new(Typed::<O, F> {
                handler,
                _operation: std::marker::PhantomData,
            }));
    }

    pub fn count_for(&self, action: &str) -> usize {
        self.handlers.get(action).map_or(0, Vec::len)
    }

    /// Catalog actions nobody handles
    pub fn missing_handlers(&self, catalog: &Catalog) -> Vec<&'static str> {
        catalog
            .actions()
            .into_iter()
            .filter(|action| self.count_for(action) == 0)
            .collect()
    }
}

pub struct InboundDispatcher {
    config: Arc<NodeConfig>,
    catalog: Catalog,
    handlers: HandlerRegistry,
    verifiers: Vec<Arc<dyn SignatureVerifier>>,
    events: Arc<LifecycleEvents>,
}

impl InboundDispatcher {
    pub fn new(
        config: Arc<NodeConfig>,
        catalog: Catalog,
        handlers: HandlerRegistry,
        verifiers: Vec<Arc<dyn SignatureVerifier>>,
        events: Arc<LifecycleEvents>,
    ) -> Self {
        Self {
            config,
            catalog,
            handlers,
            verifiers,
            events,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Answer a request addressed to this node
    pub async fn dispatch(&self, connection: &NodeId, request: Request) -> Response {
        let request = Arc::new(request);
        self.events.notify(LifecycleEvent::RequestReceived {
            connection: connection.clone(),
            request: request.clone(),
        });

        let started = Instant::now();
        let response = self.respond(connection, request).await;
        response.with_runtime(started.elapsed())
    }

    async fn respond(&self, connection: &NodeId, request: Arc<Request>) -> Response {
        let Some(entry) = self.catalog.get(request.action()) else {
            return Response::failed(&request, format!("unknown action {}", request.action()));
        };

        let parsed = match entry.parse_request_any(request.payload()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Malformed {} {}: {}", request.action(), request.request_id(), e);
                return Response::formation_violation(&request, e.to_string());
            }
        };

        if let Err(reason) = verify_signed(&self.verifiers, &request) {
            warn!("Signature check failed for {} {}: {}", request.action(), request.request_id(), reason);
            return Response::signature_error(&request, reason);
        }

        let Some(remaining) = request.remaining_timeout(Utc::now()) else {
            return Response::timeout(&request, "request expired on arrival");
        };
        let deadline = Instant::now() + remaining;

        let handlers = self.handlers.handlers.get(request.action()).map(Vec::as_slice).unwrap_or(&[]);
        let ctx = HandlerContext {
            node_id: self.config.node_id.clone(),
            connection: connection.clone(),
            request: request.clone(),
        };

        let mut running = JoinSet::new();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.call(ctx.clone(), &*parsed))) {
                Ok(Some(future)) => {
                    running.spawn(future);
                }
                Ok(None) => error!("Handler for {} got a request of another type", request.action()),
                Err(_) => error!("Handler for {} {} panicked", request.action(), request.request_id()),
            }
        }

        if running.is_empty() {
            return Response::failed(&request, format!("no handler for {}", request.action()));
        }

        let mut fault = None;
        loop {
            let next = tokio::time::timeout_at(deadline, running.join_next()).await;
            match next {
                Ok(Some(Ok(Some(Ok(payload))))) => {
                    if !running.is_empty() {
                        tokio::spawn(drain(running, deadline));
                    }
                    return Response::ok(&request, payload);
                }
                Ok(Some(Ok(Some(Err(e))))) => {
                    error!("Handler response for {} not serializable: {}", request.action(), e);
                    fault = Some(e);
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => {
                    error!("Handler for {} {} failed: {}", request.action(), request.request_id(), e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Handlers for {} {} ran out of time", request.action(), request.request_id());
                    return Response::timeout(&request, "handlers did not answer in time");
                }
            }
        }

        match fault {
            Some(e) => Response::exception(&request, e.to_string()),
            None => Response::failed(&request, format!("no handler answered {}", request.action())),
        }
    }
}

/// Await the losing handlers, aborting whatever still runs at `deadline`
async fn drain(mut running: JoinSet<HandlerResult>, deadline: Instant) {
    let finished = tokio::time::timeout_at(deadline, async {
        while running.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        running.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::envelope::ResultCode;
    use crate::testing::{self, Heartbeat, Reset, ResetResponse};
    use crate::types::{NetworkPath, SourceRouting};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dispatcher(handlers: HandlerRegistry) -> InboundDispatcher {
        InboundDispatcher::new(
            Arc::new(NodeConfig::new("cs1", NodeRole::ChargingStation)),
            testing::catalog(),
            handlers,
            Vec::new(),
            Arc::new(LifecycleEvents::default()),
        )
    }

    fn reset_request(payload: serde_json::Value, timeout: Duration) -> Request {
        Request::new("Reset", SourceRouting::local(), Payload::Json(payload), timeout)
            .with_network_path(NetworkPath::from_nodes(["csms"]))
    }

    fn status(status: &str) -> Option<ResetResponse> {
        Some(ResetResponse {
            status: status.into(),
        })
    }

    #[tokio::test]
    async fn test_first_settled_response_wins() {
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(|_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status("Scheduled")
        });
        handlers.on::<Reset, _, _>(|_, _| async { status("Accepted") });

        let response = dispatcher(handlers)
            .dispatch(&NodeId::from("csms"), reset_request(json!({"type": "Immediate"}), Duration::from_secs(5)))
            .await;

        assert!(response.is_ok());
        assert_eq!(response.payload(), Some(&Payload::Json(json!({"status": "Accepted"}))));
        assert_eq!(response.destination(), &SourceRouting::to("csms"));
    }

    async fn panicking(_: HandlerContext, _: testing::ResetRequest) -> Option<ResetResponse> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn test_none_and_panics_are_skipped() {
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(|_, _| async { None });
        handlers.on::<Reset, _, _>(panicking);
        handlers.on::<Reset, _, _>(|_, request| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            (request.kind == "Immediate").then(|| ResetResponse {
                status: "Accepted".into(),
            })
        });

        let response = dispatcher(handlers)
            .dispatch(&NodeId::from("csms"), reset_request(json!({"type": "Immediate"}), Duration::from_secs(5)))
            .await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_no_handlers_is_failed() {
        let response = dispatcher(HandlerRegistry::new())
            .dispatch(&NodeId::from("csms"), reset_request(json!({"type": "Immediate"}), Duration::from_secs(5)))
            .await;
        assert_eq!(response.result(), ResultCode::Failed);
    }

    #[tokio::test]
    async fn test_all_none_is_failed() {
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(|_, _| async { None });

        let response = dispatcher(handlers)
            .dispatch(&NodeId::from("csms"), reset_request(json!({"type": "Immediate"}), Duration::from_secs(5)))
            .await;
        assert_eq!(response.result(), ResultCode::Failed);
    }

    #[tokio::test]
    async fn test_malformed_payload_skips_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { status("Accepted") }
        });

        let response = dispatcher(handlers)
            .dispatch(&NodeId::from("csms"), reset_request(json!({"kind": "Immediate"}), Duration::from_secs(5)))
            .await;

        assert_eq!(response.result(), ResultCode::FormationViolation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_handlers_time_out() {
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            status("Accepted")
        });

        let response = dispatcher(handlers)
            .dispatch(&NodeId::from("csms"), reset_request(json!({"type": "Immediate"}), Duration::from_millis(50)))
            .await;
        assert_eq!(response.result(), ResultCode::Timeout);
    }

    #[test]
    fn test_missing_handlers() {
        let mut handlers = HandlerRegistry::new();
        handlers.on::<Reset, _, _>(|_, _| async { status("Accepted") });

        assert_eq!(handlers.missing_handlers(&testing::catalog()), vec![Heartbeat::ACTION]);
    }
}
