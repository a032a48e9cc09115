//! Lifecycle events
//!
//! Fire-and-forget notifications for audit logging. Callbacks run on the
//! notifying task, outside every lock; a panicking callback is logged and
//! the remaining subscribers still run. The audit stream is a broadcast
//! channel, so a slow reader lags instead of blocking the sender.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::error;

use crate::envelope::{Request, Response};
use crate::forward::ForwardingDecision;
use crate::types::NodeId;

/// Default capacity of the audit broadcast channel
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A request arrived, for this node or to be relayed
    RequestReceived {
        connection: NodeId,
        request: Arc<Request>,
    },
    /// The forwarding engine decided on a request passing through
    RequestFiltered {
        connection: NodeId,
        decision: Arc<ForwardingDecision>,
    },
    /// The transport accepted a request frame
    RequestSent {
        connection: NodeId,
        request: Arc<Request>,
    },
    /// A reply arrived for a request this node sent
    ResponseReceived {
        connection: NodeId,
        response: Arc<Response>,
    },
    /// A reply left this node
    ResponseSent {
        connection: NodeId,
        response: Arc<Response>,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestReceived { .. } => "request-received",
            LifecycleEvent::RequestFiltered { .. } => "request-filtered",
            LifecycleEvent::RequestSent { .. } => "request-sent",
            LifecycleEvent::ResponseReceived { .. } => "response-received",
            LifecycleEvent::ResponseSent { .. } => "response-sent",
        }
    }

    pub fn action(&self) -> &str {
        match self {
            LifecycleEvent::RequestReceived { request, .. }
            | LifecycleEvent::RequestSent { request, .. } => request.action(),
            LifecycleEvent::RequestFiltered { decision, .. } => decision.request().action(),
            LifecycleEvent::ResponseReceived { response, .. }
            | LifecycleEvent::ResponseSent { response, .. } => response.action(),
        }
    }

    pub fn connection(&self) -> &NodeId {
        match self {
            LifecycleEvent::RequestReceived { connection, .. }
            | LifecycleEvent::RequestFiltered { connection, .. }
            | LifecycleEvent::RequestSent { connection, .. }
            | LifecycleEvent::ResponseReceived { connection, .. }
            | LifecycleEvent::ResponseSent { connection, .. } => connection,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Handle returned by [`LifecycleEvents::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    action: Option<String>,
    callback: EventCallback,
}

pub struct LifecycleEvents {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    audit_tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleEvents {
    pub fn new(audit_capacity: usize) -> Self {
        let (audit_tx, _) = broadcast::channel(audit_capacity.max(1));
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            audit_tx,
        }
    }

    /// Subscribe to every event
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(callback))
    }

    /// Subscribe to events of one action only
    pub fn subscribe_for<F>(&self, action: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.add(Some(action.into()), Arc::new(callback))
    }

    fn add(&self, action: Option<String>, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            action,
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Receiver for every event notified from now on
    pub fn audit_stream(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.audit_tx.subscribe()
    }

    pub fn notify(&self, event: LifecycleEvent) {
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();

        for subscriber in subscribers {
            if let Some(action) = &subscriber.action {
                if action != event.action() {
                    continue;
                }
            }
            let callback = &subscriber.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(
                    "Lifecycle subscriber {:?} panicked on {} {}",
                    subscriber.id,
                    event.kind(),
                    event.action()
                );
            }
        }

        // No audit readers is fine
        let _ = self.audit_tx.send(event);
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::types::SourceRouting;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn received(action: &str) -> LifecycleEvent {
        LifecycleEvent::RequestReceived {
            connection: NodeId::from("csms"),
            request: Arc::new(Request::new(
                action,
                SourceRouting::local(),
                Payload::empty_object(),
                Duration::from_secs(30),
            )),
        }
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let events = LifecycleEvents::default();
        let calls = Arc::new(AtomicUsize::new(0));

        events.subscribe(|_| panic!("audit sink broke"));
        let counter = calls.clone();
        events.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.notify(received("Reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_action_filter_and_unsubscribe() {
        let events = LifecycleEvents::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = events.subscribe_for("Reset", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.notify(received("Heartbeat"));
        events.notify(received("Reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(events.unsubscribe(id));
        events.notify(received("Reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_audit_stream() {
        let events = LifecycleEvents::default();
        let mut stream = events.audit_stream();

        events.notify(received("Reset"));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind(), "request-received");
        assert_eq!(event.action(), "Reset");
    }
}
