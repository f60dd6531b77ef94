//! Engine node
//!
//! Ties the pipelines to a transport. Inbound frames are classified here:
//! requests for this node go to dispatch, other requests to the forwarding
//! pipeline, and replies are either delivered to the correlation manager or
//! passed one hop further along their route.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::config::NodeConfig;
use crate::correlation::{CorrelationManager, ResponseHandle};
use crate::dispatch::{encode_reply, DispatchPipeline, HandlerError, HandlerResult};
use crate::envelope::{ErrorEnvelope, Outcome, RequestEnvelope, ResponseEnvelope};
use crate::forwarding::{FilterResult, ForwardingPipeline, SendReport, Verdict};
use crate::frame::{ErrorCode, Frame, ParseContext};
use crate::observer::{EngineEvent, HookKind, Observers};
use crate::ocpp::standard_catalog;
use crate::operation::{Catalog, Operation};
use crate::registry::RegistrationId;
use crate::signature::SignaturePolicy;
use crate::transport::{InboundFrame, Transport, TransportError};
use crate::types::{HopPath, NodeId};

/// One participant in the network: station, relay or CSMS
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    catalog: Arc<Catalog>,
    observers: Arc<Observers>,
    transport: Arc<dyn Transport>,
    dispatch: DispatchPipeline,
    forwarding: ForwardingPipeline,
    correlation: CorrelationManager,
    shutdown: CancelHandle,
    shutdown_signal: CancelSignal,
}

impl Node {
    /// Node with the standard OCPP operation catalog
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn SignaturePolicy>,
    ) -> Self {
        Self::with_catalog(config, standard_catalog(), transport, policy)
    }

    pub fn with_catalog(
        config: NodeConfig,
        catalog: Catalog,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn SignaturePolicy>,
    ) -> Self {
        let local = config.node_id.clone();
        let catalog = Arc::new(catalog);
        let observers = Arc::new(Observers::new());
        let (shutdown, shutdown_signal) = cancel_pair();

        let dispatch = DispatchPipeline::new(
            local.clone(),
            catalog.clone(),
            policy.clone(),
            observers.clone(),
        );
        let forwarding = ForwardingPipeline::new(
            local.clone(),
            catalog.clone(),
            observers.clone(),
            config.default_verdict,
        );
        let correlation = CorrelationManager::new(
            local,
            transport.clone(),
            policy,
            catalog.clone(),
            observers.clone(),
        );

        Self {
            inner: Arc::new(NodeInner {
                config,
                catalog,
                observers,
                transport,
                dispatch,
                forwarding,
                correlation,
                shutdown,
                shutdown_signal,
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    pub fn dispatch(&self) -> &DispatchPipeline {
        &self.inner.dispatch
    }

    pub fn forwarding(&self) -> &ForwardingPipeline {
        &self.inner.forwarding
    }

    pub fn correlation(&self) -> &CorrelationManager {
        &self.inner.correlation
    }

    pub fn register_handler<F, Fut>(&self, action: &str, handler: F) -> RegistrationId
    where
        F: Fn(Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.dispatch.register_handler(action, handler)
    }

    pub fn register_operation<O, F, Fut>(&self, handler: F) -> RegistrationId
    where
        O: Operation,
        F: Fn(O::Request, Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<O::Response>, HandlerError>> + Send + 'static,
    {
        self.inner.dispatch.register_operation::<O, F, Fut>(handler)
    }

    pub fn register_filter<F, Fut>(&self, action: &str, filter: F) -> RegistrationId
    where
        F: Fn(Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FilterResult> + Send + 'static,
    {
        self.inner.forwarding.register_filter(action, filter)
    }

    pub fn observe<F>(&self, action: &str, kind: HookKind, hook: F) -> RegistrationId
    where
        F: Fn(&EngineEvent<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.inner.observers.observe(action, kind, hook)
    }

    /// Originate a request and return a handle to its outcome
    pub async fn send(&self, request: RequestEnvelope, timeout: Duration) -> ResponseHandle {
        let next_hop = self.inner.config.next_hop(&request.destination);
        self.inner.correlation.send(next_hop, request, timeout).await
    }

    /// Originate a request and wait for its outcome
    pub async fn send_request(
        &self,
        destination: NodeId,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Outcome {
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let request = RequestEnvelope::new(self.id().clone(), destination, action, payload);
        self.send(request, timeout)
            .await
            .outcome_or_cancel(&self.inner.shutdown_signal)
            .await
    }

    /// Typed request: the response payload is decoded into `O::Response`
    pub async fn call<O: Operation>(
        &self,
        destination: NodeId,
        request: &O::Request,
    ) -> Result<O::Response, Outcome> {
        let payload = O::request_to_wire(request).map_err(Outcome::failed)?;
        match self.send_request(destination, O::ACTION, payload, None).await {
            Outcome::Success(response) => {
                O::parse_response(&response.payload).map_err(|description| Outcome::ResponseError {
                    code: ErrorCode::FormatViolation,
                    description,
                })
            }
            other => Err(other),
        }
    }

    /// Fail every request sent through `peer`
    pub fn on_connection_lost(&self, peer: &NodeId) -> usize {
        self.inner.correlation.on_connection_lost(peer)
    }

    /// Cancel in-flight dispatches, forwarding decisions and waits started
    /// through `send_request`
    pub fn shutdown(&self) {
        info!("Node {} shutting down", self.id());
        self.inner.shutdown.cancel();
    }

    /// Handle one frame received from neighbour `sender`
    pub async fn on_frame_received(&self, sender: NodeId, bytes: Vec<u8>) {
        let ctx = ParseContext::new(sender.clone(), self.id().clone());
        let frame = match Frame::parse(&bytes, &ctx) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(result) = self.inner.dispatch.reject_broken_frame(&e, &ctx) {
                    self.transmit(&sender, result.wire).await;
                }
                return;
            }
        };
        debug!(
            "Frame {:?} {} from {}",
            frame.message_type(),
            frame.message_id(),
            sender
        );

        if let Frame::Request(request) = &frame {
            if request.path.last_hop() != Some(&sender) {
                self.reject_foreign_path(&sender, request).await;
                return;
            }
        }

        match frame {
            Frame::Request(request) if &request.destination == self.id() => {
                self.answer(request).await
            }
            Frame::Request(request) => self.relay_request(request).await,
            Frame::Response(response) => match self.reply_next_hop(&response.route) {
                None => {
                    self.inner.correlation.on_response_arrived(&sender, response).await;
                }
                Some(next) => {
                    let relayed = ResponseEnvelope {
                        path: response.path.append(self.id().clone()),
                        ..response
                    };
                    self.relay_reply(&next, Frame::Response(relayed)).await
                }
            },
            Frame::RequestError(error) => match self.reply_next_hop(&error.route) {
                None => {
                    self.inner.correlation.on_request_error_arrived(&sender, error);
                }
                Some(next) => {
                    let relayed = self.extend_error_path(error);
                    self.relay_reply(&next, Frame::RequestError(relayed)).await
                }
            },
            Frame::ResponseError(error) => match self.reply_next_hop(&error.route) {
                None => warn!(
                    "Response {} rejected by {:?}: {} {}",
                    error.message_id,
                    error.path.origin_node(),
                    error.code,
                    error.description
                ),
                Some(next) => {
                    let relayed = self.extend_error_path(error);
                    self.relay_reply(&next, Frame::ResponseError(relayed)).await
                }
            },
        }
    }

    /// Feed inbound frames to the node, one task per frame
    pub fn spawn_receiver(&self, mut rx: mpsc::UnboundedReceiver<InboundFrame>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some((sender, bytes)) = rx.recv().await {
                let node = node.clone();
                tokio::spawn(async move { node.on_frame_received(sender, bytes).await });
            }
            debug!("Receiver for {} stopped", node.id());
        })
    }

    async fn answer(&self, request: RequestEnvelope) {
        let result = self
            .inner
            .dispatch
            .handle(request, &self.inner.shutdown_signal)
            .await;
        match result.next_hop {
            Some(next) => self.transmit(&next, result.wire).await,
            None => warn!("No route for reply {}", result.message_id),
        }
    }

    async fn relay_request(&self, request: RequestEnvelope) {
        if request.path.contains(self.id()) {
            warn!(
                "Routing loop for {} ({}): {}",
                request.action, request.message_id, request.path
            );
            let outcome = Outcome::FormationViolation {
                description: format!("Routing loop through {}", self.id()),
            };
            self.reply_to_origin(&request, outcome).await;
            return;
        }

        let mut decision = self
            .inner
            .forwarding
            .decide(&request, &self.inner.shutdown_signal)
            .await;

        if decision.verdict() == Verdict::Reject {
            if let (Some(wire), Some(next)) = (decision.rejection_wire(), request.path.last_hop()) {
                self.transmit(next, wire.to_vec()).await;
            }
            return;
        }

        let Some(outgoing) = decision.outgoing().cloned() else {
            warn!("Forward decision for {} has no outgoing request", request.message_id);
            return;
        };
        let next_hop = self.inner.config.next_hop(&outgoing.destination);
        info!(
            "Forwarding {} ({}) to {} via {}",
            outgoing.action, outgoing.message_id, outgoing.destination, next_hop
        );

        let result = match Frame::Request(outgoing).to_bytes() {
            Ok(bytes) => self.inner.transport.send(&next_hop, bytes).await,
            Err(e) => Err(TransportError::Io(e.to_string())),
        };
        let report = SendReport { next_hop, result };
        decision.notify_sent(&report);

        if let Err(e) = report.result {
            warn!(
                "Could not forward {} to {}: {}",
                request.message_id, report.next_hop, e
            );
            let outcome =
                Outcome::failed(format!("Could not forward to {}: {}", report.next_hop, e));
            self.reply_to_origin(&request, outcome).await;
        }
    }

    /// Answer a request whose hop path does not end at the neighbour that sent it
    async fn reject_foreign_path(&self, sender: &NodeId, request: &RequestEnvelope) {
        warn!(
            "Request {} ({}) from {} carries hop path {}",
            request.action, request.message_id, sender, request.path
        );
        let outcome = Outcome::FormationViolation {
            description: format!("Hop path {} does not end at {}", request.path, sender),
        };
        let error = ErrorEnvelope::new(
            request.message_id.clone(),
            ErrorCode::FormationViolation,
            outcome.description(),
            HopPath::origin(sender.clone()),
            self.id().clone(),
        )
        .with_details(json!({ "result": outcome.name() }));
        self.transmit(sender, encode_reply(&Frame::RequestError(error))).await;
    }

    async fn reply_to_origin(&self, request: &RequestEnvelope, outcome: Outcome) {
        let frame = outcome.into_frame(request, self.id());
        if let Some(next) = request.path.last_hop() {
            self.transmit(next, encode_reply(&frame)).await;
        }
    }

    /// Next neighbour for a reply, or None to deliver it here
    fn reply_next_hop(&self, route: &HopPath) -> Option<NodeId> {
        if route.is_empty() || route.last_hop() == Some(self.id()) {
            return None;
        }
        match route.next_after(self.id()) {
            Some(next) => Some(next.clone()),
            None => {
                warn!("Reply route {} does not include {}, delivering locally", route, self.id());
                None
            }
        }
    }

    fn extend_error_path(&self, error: ErrorEnvelope) -> ErrorEnvelope {
        ErrorEnvelope {
            path: error.path.append(self.id().clone()),
            ..error
        }
    }

    async fn relay_reply(&self, next: &NodeId, frame: Frame) {
        debug!("Relaying reply {} to {}", frame.message_id(), next);
        match frame.to_bytes() {
            Ok(bytes) => self.transmit(next, bytes).await,
            Err(e) => warn!("Could not encode reply {}: {}", frame.message_id(), e),
        }
    }

    async fn transmit(&self, to: &NodeId, bytes: Vec<u8>) {
        if let Err(e) = self.inner.transport.send(to, bytes).await {
            warn!("Send to {} failed: {}", to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::AcceptAll;
    use crate::transport::MemoryHub;

    #[tokio::test]
    async fn test_direct_request_response() {
        let hub = MemoryHub::new();
        let (cs_transport, cs_rx) = hub.join("cs-1".into());
        let (csms_transport, csms_rx) = hub.join("csms".into());

        let station = Node::new(NodeConfig::new("cs-1"), cs_transport, Arc::new(AcceptAll));
        let csms = Node::new(NodeConfig::new("csms"), csms_transport, Arc::new(AcceptAll));
        station.spawn_receiver(cs_rx);
        csms.spawn_receiver(csms_rx);

        csms.register_handler("Heartbeat", |_| async {
            Ok(Some(json!({ "currentTime": "2026-01-20T12:00:00Z" })))
        });

        let outcome = station
            .send_request("csms".into(), "Heartbeat", json!({}), Some(Duration::from_secs(2)))
            .await;

        let response = outcome.response().unwrap();
        assert_eq!(response.responder(), Some(&NodeId::from("csms")));
        assert_eq!(station.correlation().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_legacy_frame_answered_to_sender() {
        let hub = MemoryHub::new();
        let (csms_transport, _csms_rx) = hub.join("csms".into());
        let (_cs_transport, mut cs_rx) = hub.join("cs-1".into());
        let csms = Node::new(NodeConfig::new("csms"), csms_transport, Arc::new(AcceptAll));

        let legacy = br#"[2, "42", "Reset", {"type": "Immediate"}]"#.to_vec();
        csms.on_frame_received("cs-1".into(), legacy).await;

        let (from, bytes) = cs_rx.recv().await.unwrap();
        assert_eq!(from, NodeId::from("csms"));
        let ctx = ParseContext::new("csms".into(), "cs-1".into());
        match Frame::parse(&bytes, &ctx).unwrap() {
            Frame::RequestError(e) => {
                assert_eq!(e.message_id.as_str(), "42");
                assert_eq!(e.description, "Undefined handler");
            }
            other => panic!("Expected RequestError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_path_not_ending_at_sender_rejected() {
        let hub = MemoryHub::new();
        let (relay_transport, _relay_rx) = hub.join("relay-a".into());
        let (_cs_transport, mut cs_rx) = hub.join("cs-1".into());
        let (_csms_transport, mut csms_rx) = hub.join("csms".into());
        let relay = Node::new(NodeConfig::new("relay-a"), relay_transport, Arc::new(AcceptAll));
        relay.register_handler("Heartbeat", |_| async {
            Ok(Some(json!({ "currentTime": "2026-01-20T12:00:00Z" })))
        });

        let request = RequestEnvelope::new("csms".into(), "relay-a".into(), "Heartbeat", json!({}));
        let bytes = Frame::Request(request).to_bytes().unwrap();
        relay.on_frame_received("cs-1".into(), bytes).await;

        let (from, reply) = cs_rx.recv().await.unwrap();
        assert_eq!(from, NodeId::from("relay-a"));
        let ctx = ParseContext::new("relay-a".into(), "cs-1".into());
        match Frame::parse(&reply, &ctx).unwrap() {
            Frame::RequestError(e) => {
                assert_eq!(e.code, ErrorCode::FormationViolation);
                assert_eq!(e.route.as_slice(), &[NodeId::from("cs-1")]);
            }
            other => panic!("Expected RequestError, got {:?}", other),
        }
        assert!(csms_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_routing_loop_rejected() {
        let hub = MemoryHub::new();
        let (relay_transport, _relay_rx) = hub.join("relay-a".into());
        let (_csms_transport, mut csms_rx) = hub.join("csms".into());
        let relay = Node::new(NodeConfig::new("relay-a"), relay_transport, Arc::new(AcceptAll));

        let payload = json!({ "type": "Immediate" });
        let request = RequestEnvelope::new("csms".into(), "cs-1".into(), "Reset", payload)
            .forwarded_by("relay-a".into())
            .forwarded_by("csms".into());
        let bytes = Frame::Request(request).to_bytes().unwrap();
        relay.on_frame_received("csms".into(), bytes).await;

        let (_, reply) = csms_rx.recv().await.unwrap();
        let ctx = ParseContext::new("relay-a".into(), "csms".into());
        match Frame::parse(&reply, &ctx).unwrap() {
            Frame::RequestError(e) => assert_eq!(e.result_kind(), Some("FormationViolation")),
            other => panic!("Expected RequestError, got {:?}", other),
        }
    }
}
