//! Outbound request correlation
//!
//! Every request this node originates gets a pending entry keyed by its
//! message id. The entry is resolved exactly once: by the matching response
//! or error, by its deadline, by loss of the connection it was sent on, or
//! by cancellation. Resolution removes the entry under the lock before the
//! outcome is delivered, so a late or duplicate reply finds nothing and is
//! discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::envelope::{ErrorEnvelope, Outcome, RequestEnvelope, ResponseEnvelope};
use crate::frame::{ErrorCode, Frame};
use crate::observer::{EngineEvent, Observers};
use crate::operation::Catalog;
use crate::signature::SignaturePolicy;
use crate::transport::Transport;
use crate::types::{MessageId, NodeId};

struct PendingRequest {
    action: String,
    next_hop: NodeId,
    issued_at: Instant,
    response_tx: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<MessageId, PendingRequest>>,
}

impl PendingTable {
    /// Remove the entry and deliver `outcome`. False if it was already resolved.
    fn resolve(&self, message_id: &MessageId, outcome: Outcome) -> bool {
        let Some(pending) = self.entries.lock().remove(message_id) else {
            return false;
        };
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        debug!(
            "Resolved {} ({}) after {:?}: {}",
            pending.action,
            message_id,
            pending.issued_at.elapsed(),
            outcome
        );
        // The waiter may have given up on the handle
        let _ = pending.response_tx.send(outcome);
        true
    }

    fn lookup(&self, message_id: &MessageId) -> Option<(String, NodeId, Instant)> {
        self.entries
            .lock()
            .get(message_id)
            .map(|p| (p.action.clone(), p.next_hop.clone(), p.issued_at))
    }
}

/// Receives the outcome of one outbound request
pub struct ResponseHandle {
    message_id: MessageId,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PendingTable>,
}

impl ResponseHandle {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub async fn outcome(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Cancelled)
    }

    /// Wait for the outcome, resolving it as `Cancelled` if `cancel` fires first
    pub async fn outcome_or_cancel(mut self, cancel: &CancelSignal) -> Outcome {
        tokio::select! {
            outcome = &mut self.rx => outcome.unwrap_or(Outcome::Cancelled),
            _ = cancel.cancelled() => {
                self.table.resolve(&self.message_id, Outcome::Cancelled);
                // Someone else may have resolved it first
                self.rx.await.unwrap_or(Outcome::Cancelled)
            }
        }
    }

    /// Resolve the request as `Cancelled` if still pending
    pub fn cancel(&self) -> bool {
        self.table.resolve(&self.message_id, Outcome::Cancelled)
    }
}

pub struct CorrelationManager {
    local: NodeId,
    table: Arc<PendingTable>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn SignaturePolicy>,
    catalog: Arc<Catalog>,
    observers: Arc<Observers>,
}

impl CorrelationManager {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn SignaturePolicy>,
        catalog: Arc<Catalog>,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            local,
            table: Arc::new(PendingTable::default()),
            transport,
            policy,
            catalog,
            observers,
        }
    }

    /// Sign, register and transmit `request` to `next_hop`.
    ///
    /// The handle always resolves: signing or transmit failures resolve it
    /// immediately, otherwise the deadline bounds the wait.
    pub async fn send(
        &self,
        next_hop: NodeId,
        mut request: RequestEnvelope,
        timeout: Duration,
    ) -> ResponseHandle {
        if request.message_id.is_empty() {
            request.message_id = MessageId::generate();
        }
        request.timeout = timeout;
        let message_id = request.message_id.clone();

        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle {
            message_id: message_id.clone(),
            rx,
            table: self.table.clone(),
        };

        let request = match self.policy.sign_request(request) {
            Ok(signed) => signed,
            Err(e) => {
                warn!("Could not sign outbound request {}: {}", message_id, e);
                let _ = tx.send(Outcome::SignatureError { reason: e.to_string() });
                return handle;
            }
        };
        let bytes = match Frame::Request(request.clone()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode outbound request {}: {}", message_id, e);
                let _ = tx.send(Outcome::failed(format!("Could not encode request: {}", e)));
                return handle;
            }
        };

        let issued_at = Instant::now();
        {
            let mut entries = self.table.entries.lock();
            if entries.contains_key(&message_id) {
                warn!("Message id {} is already pending", message_id);
                let _ = tx.send(Outcome::failed(format!(
                    "Message id {} is already pending",
                    message_id
                )));
                return handle;
            }
            entries.insert(
                message_id.clone(),
                PendingRequest {
                    action: request.action.clone(),
                    next_hop: next_hop.clone(),
                    issued_at,
                    response_tx: tx,
                    timer: None,
                },
            );
        }
        self.arm_timer(&message_id, issued_at + timeout, timeout);

        info!(
            "Sending {} ({}) to {} via {}",
            request.action, message_id, request.destination, next_hop
        );
        let result = self.transport.send(&next_hop, bytes).await;
        self.observers.notify(&EngineEvent::RequestSent {
            request: &request,
            next_hop: &next_hop,
            result: &result,
        });
        if let Err(e) = result {
            warn!("Failed to send {} to {}: {}", message_id, next_hop, e);
            self.table
                .resolve(&message_id, Outcome::ConnectionLost { peer: next_hop });
        }

        handle
    }

    /// Send and wait for the outcome
    pub async fn request(
        &self,
        next_hop: NodeId,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> Outcome {
        self.send(next_hop, request, timeout).await.outcome().await
    }

    fn arm_timer(&self, message_id: &MessageId, deadline: Instant, timeout: Duration) {
        let table = self.table.clone();
        let id = message_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if table.resolve(&id, Outcome::Timeout { after: timeout }) {
                warn!("Request {} timed out after {:?}", id, timeout);
            }
        });

        let mut entries = self.table.entries.lock();
        match entries.get_mut(message_id) {
            Some(pending) => pending.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    /// Feed a response addressed to this node, received from neighbour
    /// `sender`. False if nothing was waiting for it on that link.
    pub async fn on_response_arrived(&self, sender: &NodeId, response: ResponseEnvelope) -> bool {
        let Some((action, next_hop, issued_at)) = self.table.lookup(&response.message_id) else {
            warn!(
                "Discarding response {}: no pending request (late, duplicate or unknown)",
                response.message_id
            );
            return false;
        };
        if &next_hop != sender {
            warn!(
                "Discarding response {} from {}: request was sent via {}",
                response.message_id, sender, next_hop
            );
            return false;
        }

        let rejection = self
            .validate_response(&action, &response)
            .err();
        let outcome = match &rejection {
            None => Outcome::Success(response.clone()),
            Some((code, description)) => Outcome::ResponseError {
                code: *code,
                description: description.clone(),
            },
        };

        if !self.table.resolve(&response.message_id, outcome.clone()) {
            warn!("Discarding response {}: already resolved", response.message_id);
            return false;
        }
        self.observers.notify(&EngineEvent::ResponseReceived {
            action: &action,
            message_id: &response.message_id,
            outcome: &outcome,
            runtime: issued_at.elapsed(),
        });

        if let Some((code, description)) = rejection {
            self.reject_response(&response, code, description).await;
        }
        true
    }

    fn validate_response(
        &self,
        action: &str,
        response: &ResponseEnvelope,
    ) -> Result<(), (ErrorCode, String)> {
        if self.catalog.contains(action) {
            self.catalog
                .try_parse_response(action, &response.payload)
                .map_err(|e| (ErrorCode::FormatViolation, e))?;
        }
        self.policy
            .verify_response(action, response)
            .map_err(|e| (ErrorCode::SecurityError, e.to_string()))
    }

    async fn reject_response(
        &self,
        response: &ResponseEnvelope,
        code: ErrorCode,
        description: String,
    ) {
        warn!(
            "Rejecting response {} from {:?}: {}",
            response.message_id,
            response.responder(),
            description
        );
        let error =
            ErrorEnvelope::rejecting_response(response, self.local.clone(), code, description);
        let Some(next_hop) = error.route.origin_node().cloned() else {
            return;
        };
        let frame = Frame::ResponseError(error);
        match frame.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(&next_hop, bytes).await {
                    warn!("Could not send response error to {}: {}", next_hop, e);
                }
            }
            Err(e) => warn!("Could not encode response error: {}", e),
        }
    }

    /// Feed a request error addressed to this node, received from `sender`
    pub fn on_request_error_arrived(&self, sender: &NodeId, error: ErrorEnvelope) -> bool {
        let Some((action, next_hop, issued_at)) = self.table.lookup(&error.message_id) else {
            warn!(
                "Discarding error {}: no pending request (late, duplicate or unknown)",
                error.message_id
            );
            return false;
        };
        if &next_hop != sender {
            warn!(
                "Discarding error {} from {}: request was sent via {}",
                error.message_id, sender, next_hop
            );
            return false;
        }
        let message_id = error.message_id.clone();
        let outcome = Outcome::RequestError(error);
        if !self.table.resolve(&message_id, outcome.clone()) {
            return false;
        }
        self.observers.notify(&EngineEvent::ResponseReceived {
            action: &action,
            message_id: &message_id,
            outcome: &outcome,
            runtime: issued_at.elapsed(),
        });
        true
    }

    /// Fail every request sent via `peer`. Returns how many were resolved.
    pub fn on_connection_lost(&self, peer: &NodeId) -> usize {
        let ids: Vec<MessageId> = self
            .table
            .entries
            .lock()
            .iter()
            .filter(|(_, p)| &p.next_hop == peer)
            .map(|(id, _)| id.clone())
            .collect();

        let resolved = ids
            .iter()
            .filter(|id| {
                self.table
                    .resolve(id, Outcome::ConnectionLost { peer: peer.clone() })
            })
            .count();
        if resolved > 0 {
            warn!("Connection to {} lost, failed {} pending request(s)", peer, resolved);
        }
        resolved
    }

    pub fn cancel(&self, message_id: &MessageId) -> bool {
        self.table.resolve(message_id, Outcome::Cancelled)
    }

    pub fn pending_count(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.table.entries.lock().contains_key(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::ocpp;
    use crate::signature::AcceptAll;
    use crate::transport::{InboundFrame, MemoryHub};
    use crate::types::HopPath;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        manager: CorrelationManager,
        relay_rx: mpsc::UnboundedReceiver<InboundFrame>,
        hub: Arc<MemoryHub>,
    }

    fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let (transport, _own_rx) = hub.join("csms".into());
        let (_relay, relay_rx) = hub.join("relay-a".into());
        let manager = CorrelationManager::new(
            "csms".into(),
            transport,
            Arc::new(AcceptAll),
            Arc::new(ocpp::standard_catalog()),
            Arc::new(Observers::new()),
        );
        Fixture { manager, relay_rx, hub }
    }

    fn reset(id: &str) -> RequestEnvelope {
        RequestEnvelope::new("csms".into(), "cs-1".into(), "Reset", json!({ "type": "Immediate" }))
            .with_message_id(id)
    }

    fn relay() -> NodeId {
        NodeId::from("relay-a")
    }

    fn accepted(request_id: &str) -> ResponseEnvelope {
        ResponseEnvelope {
            message_id: request_id.into(),
            payload: json!({ "status": "Accepted" }),
            route: HopPath::default(),
            path: HopPath::origin("cs-1".into()),
            timestamp: chrono::Utc::now(),
            signatures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_response_resolves_once() {
        let mut f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset("42"), Duration::from_secs(5))
            .await;
        assert!(f.relay_rx.recv().await.is_some());
        assert_eq!(f.manager.pending_count(), 1);

        assert!(f.manager.on_response_arrived(&relay(), accepted("42")).await);
        assert!(!f.manager.on_response_arrived(&relay(), accepted("42")).await);

        let outcome = handle.outcome().await;
        assert!(outcome.is_success());
        assert_eq!(f.manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_from_other_neighbour_ignored() {
        let f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset("13"), Duration::from_secs(5))
            .await;

        assert!(!f.manager.on_response_arrived(&"relay-b".into(), accepted("13")).await);
        let error =
            ErrorEnvelope::answering(&reset("13"), "relay-b".into(), ErrorCode::GenericError, "x");
        assert!(!f.manager.on_request_error_arrived(&"relay-b".into(), error));
        assert!(f.manager.is_pending(handle.message_id()));

        assert!(f.manager.on_response_arrived(&relay(), accepted("13")).await);
        assert!(handle.outcome().await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_timeout() {
        let f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset("7"), Duration::from_millis(50))
            .await;

        let started = Instant::now();
        let outcome = handle.outcome().await;
        assert_eq!(outcome, Outcome::Timeout { after: Duration::from_millis(50) });
        assert_eq!(started.elapsed(), Duration::from_millis(50));
        assert!(!f.manager.on_response_arrived(&relay(), accepted("7")).await);
    }

    #[tokio::test]
    async fn test_invalid_response_payload_rejected_back() {
        let mut f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset("9"), Duration::from_secs(5))
            .await;
        let _request = f.relay_rx.recv().await.unwrap();

        let mut bad = accepted("9");
        bad.payload = json!({ "status": "Maybe" });
        bad.path = HopPath::origin("cs-1".into()).append("relay-a".into());
        assert!(f.manager.on_response_arrived(&relay(), bad).await);

        match handle.outcome().await {
            Outcome::ResponseError { code, .. } => assert_eq!(code, ErrorCode::FormatViolation),
            other => panic!("Expected ResponseError, got {:?}", other),
        }

        let (from, bytes) = f.relay_rx.recv().await.unwrap();
        assert_eq!(from, NodeId::from("csms"));
        let ctx = crate::frame::ParseContext::new("csms".into(), "relay-a".into());
        match Frame::parse(&bytes, &ctx).unwrap() {
            Frame::ResponseError(e) => {
                assert_eq!(e.message_id, MessageId::from("9"));
                assert_eq!(e.route.as_slice(), &[NodeId::from("relay-a"), NodeId::from("cs-1")]);
            }
            other => panic!("Expected ResponseError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_error_resolves() {
        let f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset("11"), Duration::from_secs(5))
            .await;

        let error =
            ErrorEnvelope::answering(&reset("11"), "cs-1".into(), ErrorCode::NotSupported, "nope");
        assert!(f.manager.on_request_error_arrived(&relay(), error));

        match handle.outcome().await {
            Outcome::RequestError(e) => assert_eq!(e.code, ErrorCode::NotSupported),
            other => panic!("Expected RequestError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_fails_only_that_peer() {
        let f = fixture();
        let (_other, _other_rx) = f.hub.join("relay-b".into());
        let via_a = f.manager.send("relay-a".into(), reset("1"), Duration::from_secs(5)).await;
        let via_b = f.manager.send("relay-b".into(), reset("2"), Duration::from_secs(5)).await;

        assert_eq!(f.manager.on_connection_lost(&"relay-a".into()), 1);
        assert_eq!(
            via_a.outcome().await,
            Outcome::ConnectionLost { peer: "relay-a".into() }
        );
        assert!(f.manager.is_pending(via_b.message_id()));
    }

    #[tokio::test]
    async fn test_unreachable_next_hop() {
        let f = fixture();
        let outcome = f
            .manager
            .request("nowhere".into(), reset("3"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome, Outcome::ConnectionLost { peer: "nowhere".into() });
        assert_eq!(f.manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_resolves_cancelled() {
        let f = fixture();
        let handle = f.manager.send("relay-a".into(), reset("5"), Duration::from_secs(5)).await;
        let (cancel, signal) = cancel_pair();
        cancel.cancel();

        assert_eq!(handle.outcome_or_cancel(&signal).await, Outcome::Cancelled);
        assert_eq!(f.manager.pending_count(), 0);
        assert!(!f.manager.on_response_arrived(&relay(), accepted("5")).await);
    }

    #[tokio::test]
    async fn test_empty_message_id_is_generated() {
        let f = fixture();
        let handle = f
            .manager
            .send("relay-a".into(), reset(""), Duration::from_secs(5))
            .await;
        assert!(!handle.message_id().is_empty());
        assert!(f.manager.cancel(handle.message_id()));
    }
}
