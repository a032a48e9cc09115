//! Correlation table
//!
//! Maps request ids to pending-response slots. Each slot is resolved exactly
//! once (reply, timeout, cancellation or connection loss) and removed in the
//! same critical section, so a second resolution finds nothing and is a
//! no-op. The lock is never held while sending on a slot or across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::envelope::{Request, Response, ResultCode};
use crate::types::{EventTrackingId, NodeId, RequestId};

/// Grace period after a deadline before the reaper removes a slot
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("request id {0} already has a pending response")]
    DuplicateRequestId(RequestId),
}

struct PendingSlot {
    action: String,
    event_tracking_id: EventTrackingId,
    connection: NodeId,
    registered_at: Instant,
    deadline: Instant,
    reply_tx: oneshot::Sender<Response>,
}

impl PendingSlot {
    fn complete(self, request_id: &RequestId, result: ResultCode, description: String) {
        let response = Response::synthesized(
            request_id.clone(),
            self.action,
            result,
            Some(description),
        )
        .with_event_tracking_id(self.event_tracking_id);
        // Receiver gone means the caller stopped waiting; nothing to do
        let _ = self.reply_tx.send(response);
    }
}

/// Process-wide map from request id to its pending response
pub struct CorrelationTable {
    pending: Mutex<HashMap<RequestId, PendingSlot>>,
    grace_period: Duration,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    /// Register a pending response for `request`, sent on `connection`
    pub fn register(
        self: &Arc<Self>,
        request: &Request,
        connection: &NodeId,
        deadline: Instant,
    ) -> Result<ResponseSlot, CorrelationError> {
        let request_id = request.request_id().clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                error!(
                    "Duplicate request id {} for {} on {}",
                    request_id,
                    request.action(),
                    connection
                );
                return Err(CorrelationError::DuplicateRequestId(request_id));
            }
            pending.insert(
                request_id.clone(),
                PendingSlot {
                    action: request.action().to_string(),
                    event_tracking_id: request.event_tracking_id().clone(),
                    connection: connection.clone(),
                    registered_at: Instant::now(),
                    deadline,
                    reply_tx,
                },
            );
        }

        Ok(ResponseSlot {
            table: Arc::clone(self),
            request_id,
            action: request.action().to_string(),
            reply_rx,
        })
    }

    /// Resolve a pending slot with a reply that arrived on `connection`.
    ///
    /// Returns `false` when the id is unknown or already resolved, or when
    /// the reply came in on another connection than the request went out
    /// on; the slot then stays pending.
    pub fn resolve(&self, request_id: &RequestId, connection: &NodeId, response: Response) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(request_id) {
            None => {
                debug!("No pending request for reply {}", request_id);
                return false;
            }
            Some(slot) if &slot.connection != connection => {
                warn!(
                    "Reply {} for {} arrived on {}, request went out on {}",
                    request_id, slot.action, connection, slot.connection
                );
                return false;
            }
            Some(_) => {}
        }
        let Some(slot) = pending.remove(request_id) else {
            return false;
        };
        drop(pending);

        debug!(
            "Resolved {} {} after {:?}",
            slot.action,
            request_id,
            slot.registered_at.elapsed()
        );
        let _ = slot.reply_tx.send(response);
        true
    }

    /// Resolve with a synthesized `Timeout`
    pub fn expire(&self, request_id: &RequestId) -> bool {
        self.complete(request_id, ResultCode::Timeout, "no response within the deadline")
    }

    /// Resolve with a synthesized `Cancelled`
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.complete(request_id, ResultCode::Cancelled, "request cancelled by caller")
    }

    fn complete(&self, request_id: &RequestId, result: ResultCode, description: &str) -> bool {
        let Some(slot) = self.pending.lock().remove(request_id) else {
            return false;
        };
        debug!("{} {} completed locally: {}", slot.action, request_id, result);
        slot.complete(request_id, result, description.to_string());
        true
    }

    /// Resolve every slot waiting on `connection` with `NetworkError`
    pub fn fail_connection(&self, connection: &NodeId) -> usize {
        let failed: Vec<(RequestId, PendingSlot)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, slot)| &slot.connection == connection)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let count = failed.len();
        if count > 0 {
            warn!("Connection {} lost with {} pending requests", connection, count);
        }
        for (request_id, slot) in failed {
            let description = format!("connection {} lost", connection);
            slot.complete(&request_id, ResultCode::NetworkError, description);
        }
        count
    }

    /// Expire slots whose deadline plus grace period lies before `now`
    pub fn reap(&self, now: Instant) -> usize {
        let stale: Vec<(RequestId, PendingSlot)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, slot)| slot.deadline + self.grace_period <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let count = stale.len();
        if count > 0 {
            warn!("Reaped {} stale pending requests", count);
        }
        for (request_id, slot) in stale {
            slot.complete(&request_id, ResultCode::Timeout, "reaped after deadline".to_string());
        }
        count
    }

    /// Run [`reap`](Self::reap) every `interval` until `shutdown` fires
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        table.reap(Instant::now());
                    }
                }
            }
            debug!("Correlation reaper stopped");
        })
    }

    /// Remove a slot without resolving it
    fn forget(&self, request_id: &RequestId) {
        self.pending.lock().remove(request_id);
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller's handle on a pending response.
///
/// Dropping the slot removes the pending entry, so callers that bail out
/// early never leak it.
pub struct ResponseSlot {
    table: Arc<CorrelationTable>,
    request_id: RequestId,
    action: String,
    reply_rx: oneshot::Receiver<Response>,
}

impl ResponseSlot {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the reply, the deadline or cancellation, whichever is first
    pub async fn wait(mut self, deadline: Instant, cancel: &CancellationToken) -> Response {
        tokio::select! {
            biased;
            reply = &mut self.reply_rx => return self.received(reply),
            _ = tokio::time::sleep_until(deadline) => {
                self.table.expire(&self.request_id);
            }
            _ = cancel.cancelled() => {
                self.table.cancel(&self.request_id);
            }
        }

        // Whichever resolution won the race has been sent by now
        let reply = (&mut self.reply_rx).await;
        self.received(reply)
    }

    fn received(&self, reply: Result<Response, oneshot::error::RecvError>) -> Response {
        reply.unwrap_or_else(|_| {
            Response::synthesized(
                self.request_id.clone(),
                &self.action,
                ResultCode::Exception,
                Some("pending response dropped without a reply".to_string()),
            )
        })
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        self.table.forget(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::types::SourceRouting;

    fn request() -> Request {
        Request::new(
            "Heartbeat",
            SourceRouting::to("csms"),
            Payload::empty_object(),
            Duration::from_secs(30),
        )
    }

    fn reply(request: &Request) -> Response {
        Response::ok(request, Payload::Json(serde_json::json!({"currentTime": "now"})))
    }

    #[tokio::test]
    async fn test_resolves_at_most_once() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let slot = table
            .register(&req, &NodeId::from("csms"), Instant::now() + Duration::from_secs(5))
            .unwrap();

        assert!(table.resolve(req.request_id(), &NodeId::from("csms"), reply(&req)));
        assert!(!table.resolve(req.request_id(), &NodeId::from("csms"), reply(&req)));
        assert!(!table.expire(req.request_id()));

        let response = slot
            .wait(Instant::now() + Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(response.result(), ResultCode::Ok);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reply_on_other_connection_is_ignored() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let deadline = Instant::now() + Duration::from_secs(5);
        let slot = table.register(&req, &NodeId::from("csms"), deadline).unwrap();

        assert!(!table.resolve(req.request_id(), &NodeId::from("intruder"), reply(&req)));
        assert!(table.is_pending(req.request_id()));

        assert!(table.resolve(req.request_id(), &NodeId::from("csms"), reply(&req)));
        let response = slot.wait(deadline, &CancellationToken::new()).await;
        assert_eq!(response.result(), ResultCode::Ok);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let deadline = Instant::now() + Duration::from_secs(5);
        let _slot = table.register(&req, &NodeId::from("csms"), deadline).unwrap();

        let second = table.register(&req, &NodeId::from("csms"), deadline);
        assert!(matches!(second, Err(CorrelationError::DuplicateRequestId(_))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fires_once_not_early() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        let slot = table.register(&req, &NodeId::from("csms"), deadline).unwrap();

        let response = slot.wait(deadline, &CancellationToken::new()).await;

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(response.result(), ResultCode::Timeout);
        assert!(!table.resolve(req.request_id(), &NodeId::from("csms"), reply(&req)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let deadline = Instant::now() + Duration::from_secs(5);
        let slot = table.register(&req, &NodeId::from("csms"), deadline).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = slot.wait(deadline, &cancel).await;

        assert_eq!(response.result(), ResultCode::Cancelled);
        assert!(!table.is_pending(req.request_id()));
    }

    #[tokio::test]
    async fn test_fail_connection() {
        let table = Arc::new(CorrelationTable::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        let a = request();
        let b = request();
        let c = request();
        let slot_a = table.register(&a, &NodeId::from("relay"), deadline).unwrap();
        let _slot_b = table.register(&b, &NodeId::from("relay"), deadline).unwrap();
        let _slot_c = table.register(&c, &NodeId::from("other"), deadline).unwrap();

        assert_eq!(table.fail_connection(&NodeId::from("relay")), 2);
        assert_eq!(table.len(), 1);

        let response = slot_a.wait(deadline, &CancellationToken::new()).await;
        assert_eq!(response.result(), ResultCode::NetworkError);
    }

    #[tokio::test]
    async fn test_reap_after_grace_period() {
        let table = Arc::new(CorrelationTable::with_grace_period(Duration::from_secs(1)));
        let req = request();
        let now = Instant::now();
        let _slot = table.register(&req, &NodeId::from("csms"), now).unwrap();

        assert_eq!(table.reap(now), 0);
        assert_eq!(table.reap(now + Duration::from_secs(2)), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_slot_is_forgotten() {
        let table = Arc::new(CorrelationTable::new());
        let req = request();
        let slot = table
            .register(&req, &NodeId::from("csms"), Instant::now() + Duration::from_secs(5))
            .unwrap();
        drop(slot);

        assert!(table.is_empty());
        assert!(!table.resolve(req.request_id(), &NodeId::from("csms"), reply(&req)));
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let table = Arc::new(CorrelationTable::new());
        let shutdown = CancellationToken::new();
        let handle = table.spawn_reaper(Duration::from_millis(10), shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
