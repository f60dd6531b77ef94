//! Inbound dispatch pipeline
//!
//! A request addressed to this node goes through
//! `Received -> Verified -> HandlerInvoked -> ResponseReady -> Signed`.
//! Every exit produces exactly one reply frame: the adopted handler
//! response, or a request error describing where the pipeline stopped.
//!
//! All handlers registered for the operation run concurrently. The reply
//! comes from the first handler in registration order that produced
//! something; a handler that errored or panicked counts as having produced
//! something and yields `ExceptionOccurred` if selected. When no handler
//! returned a payload and some failed, the reply is a generic `Failed`.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::envelope::{ErrorEnvelope, Outcome, RequestEnvelope, ResponseEnvelope};
use crate::fanout::{invoke_all, select_first, Invocation};
use crate::frame::{ErrorCode, Frame, FrameError, ParseContext};
use crate::observer::{EngineEvent, Observers};
use crate::operation::{Catalog, Operation};
use crate::registry::{Registry, RegistrationId};
use crate::signature::SignaturePolicy;
use crate::types::{HopPath, MessageId, NodeId};

/// Error returned by a request handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(e.to_string())
    }
}

/// `Ok(None)` means "not mine": the handler declines to answer
pub type HandlerResult = Result<Option<Value>, HandlerError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type Handler = Arc<dyn Fn(Arc<RequestEnvelope>) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Received,
    Verified,
    HandlerInvoked,
    ResponseReady,
    Signed,
}

/// Reply produced for one inbound request
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub message_id: MessageId,
    pub outcome: Outcome,
    pub reply: Frame,
    pub wire: Vec<u8>,
    /// Neighbour the reply goes to first; None when it stays local
    pub next_hop: Option<NodeId>,
    /// Stage the pipeline stopped at, None on success
    pub rejected_at: Option<DispatchStage>,
    /// Registration index of the adopted handler
    pub handler_index: Option<usize>,
}

pub struct DispatchPipeline {
    local: NodeId,
    catalog: Arc<Catalog>,
    handlers: Registry<Handler>,
    policy: Arc<dyn SignaturePolicy>,
    observers: Arc<Observers>,
}

impl DispatchPipeline {
    pub fn new(
        local: NodeId,
        catalog: Arc<Catalog>,
        policy: Arc<dyn SignaturePolicy>,
        observers: Arc<Observers>,
    ) -> Self {
        Self {
            local,
            catalog,
            handlers: Registry::new(),
            policy,
            observers,
        }
    }

    pub fn register_handler<F, Fut>(&self, action: &str, handler: F) -> RegistrationId
    where
        F: Fn(Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |request: Arc<RequestEnvelope>| handler(request).boxed());
        self.handlers.register(action, handler)
    }

    /// Register a handler working on the operation's typed records.
    ///
    /// Also registers the operation's codec in the catalog.
    pub fn register_operation<O, F, Fut>(&self, handler: F) -> RegistrationId
    where
        O: Operation,
        F: Fn(O::Request, Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<O::Response>, HandlerError>> + Send + 'static,
    {
        if !self.catalog.contains(O::ACTION) {
            self.catalog.register::<O>();
        }
        let handler = Arc::new(handler);
        self.register_handler(O::ACTION, move |request: Arc<RequestEnvelope>| {
            let handler = handler.clone();
            async move {
                let typed =
                    O::parse_request(&request.payload).map_err(HandlerError::InvalidPayload)?;
                match handler(typed, request).await? {
                    Some(response) => O::response_to_wire(&response)
                        .map(Some)
                        .map_err(HandlerError::InvalidPayload),
                    None => Ok(None),
                }
            }
        })
    }

    pub fn unregister_handler(&self, id: RegistrationId) -> bool {
        self.handlers.unregister(id)
    }

    pub fn handler_count(&self, action: &str) -> usize {
        self.handlers.count(action)
    }

    /// Parse raw bytes and dispatch the request they carry.
    ///
    /// Returns None for frames that are not requests and for broken frames
    /// that cannot be answered.
    pub async fn handle_frame(
        &self,
        ctx: &ParseContext,
        bytes: &[u8],
        cancel: &CancelSignal,
    ) -> Option<DispatchResult> {
        match Frame::parse(bytes, ctx) {
            Ok(Frame::Request(request)) => Some(self.handle(request, cancel).await),
            Ok(other) => {
                debug!("Dispatch ignoring non-request frame {}", other.message_id());
                None
            }
            Err(e) => self.reject_broken_frame(&e, ctx),
        }
    }

    /// Reply to a request frame that failed to parse
    pub fn reject_broken_frame(
        &self,
        e: &FrameError,
        ctx: &ParseContext,
    ) -> Option<DispatchResult> {
        if !e.is_call() {
            warn!("Dropping unparseable frame from {}: {}", ctx.sender, e);
            return None;
        }
        let message_id = e.message_id()?.clone();
        let outcome = e.outcome();
        warn!("Rejecting request {} from {}: {}", message_id, ctx.sender, e);

        let route = HopPath::origin(ctx.sender.clone());
        let error = ErrorEnvelope::new(
            message_id.clone(),
            outcome.error_code().unwrap_or(ErrorCode::GenericError),
            outcome.description(),
            route,
            self.local.clone(),
        )
        .with_details(json!({ "result": outcome.name() }));
        let reply = Frame::RequestError(error);
        let wire = encode_reply(&reply);

        Some(DispatchResult {
            message_id,
            outcome,
            reply,
            wire,
            next_hop: Some(ctx.sender.clone()),
            rejected_at: Some(DispatchStage::Received),
            handler_index: None,
        })
    }

    /// Run the pipeline for a request addressed to this node
    pub async fn handle(&self, request: RequestEnvelope, cancel: &CancelSignal) -> DispatchResult {
        let started = Instant::now();
        let request = Arc::new(request);
        info!(
            "Received {} ({}) from {}",
            request.action, request.message_id, request.path
        );
        self.observers
            .notify(&EngineEvent::RequestReceived { request: &request });

        if let Err(e) = self.catalog.try_parse_request(&request.action, &request.payload) {
            warn!("Cannot parse {} ({}): {}", request.action, request.message_id, e);
            let outcome = Outcome::CouldNotParse { description: e };
            return self.finish(&request, outcome, Some(DispatchStage::Received), None, started);
        }

        if let Err(e) = self.policy.verify_request(&request) {
            warn!(
                "Signature check failed for {} ({}): {}",
                request.action, request.message_id, e
            );
            let outcome = Outcome::SignatureError { reason: e.to_string() };
            return self.finish(&request, outcome, Some(DispatchStage::Verified), None, started);
        }
        debug!("Dispatch {} ({}): verified", request.action, request.message_id);

        let handlers = self.handlers.snapshot(&request.action);
        if handlers.is_empty() {
            warn!("No handler for {} ({})", request.action, request.message_id);
            let outcome = Outcome::failed("Undefined handler");
            let stage = Some(DispatchStage::HandlerInvoked);
            return self.finish(&request, outcome, stage, None, started);
        }

        // Handlers are called on their own task so a panic before the first
        // await is caught like any other.
        let futures = handlers
            .into_iter()
            .map(|handler| {
                let request = request.clone();
                async move { handler(request).await }.boxed()
            })
            .collect();
        let invocations = match invoke_all(futures, cancel).await {
            Ok(invocations) => invocations,
            Err(_) => {
                info!("Dispatch of {} ({}) cancelled", request.action, request.message_id);
                return self.finish(
                    &request,
                    Outcome::Cancelled,
                    Some(DispatchStage::HandlerInvoked),
                    None,
                    started,
                );
            }
        };

        let slots: Vec<Option<Result<Value, String>>> = invocations
            .into_iter()
            .enumerate()
            .map(|(idx, invocation)| match invocation {
                Invocation::Completed(Ok(payload)) => payload.map(Ok),
                Invocation::Completed(Err(e)) => {
                    error!("Handler {} for {} failed: {}", idx, request.action, e);
                    Some(Err(e.to_string()))
                }
                Invocation::Panicked(msg) => {
                    error!("Handler {} for {} panicked: {}", idx, request.action, msg);
                    Some(Err(format!("Handler panicked: {}", msg)))
                }
            })
            .collect();
        let produced = slots.iter().filter(|s| s.is_some()).count();
        let any_payload = slots.iter().any(|s| matches!(s, Some(Ok(_))));

        if produced > 0 && !any_payload {
            let description = match slots.iter().flatten().next() {
                Some(Err(first)) => format!("All handlers failed: {}", first),
                _ => "All handlers failed".to_string(),
            };
            let outcome = Outcome::failed(description);
            let stage = Some(DispatchStage::HandlerInvoked);
            return self.finish(&request, outcome, stage, None, started);
        }

        let (idx, payload) = match select_first(slots) {
            None => {
                let outcome = Outcome::failed("No handler produced a response");
                let stage = Some(DispatchStage::HandlerInvoked);
                return self.finish(&request, outcome, stage, None, started);
            }
            Some((idx, Err(description))) => {
                let outcome = Outcome::ExceptionOccurred { description };
                return self.finish(
                    &request,
                    outcome,
                    Some(DispatchStage::HandlerInvoked),
                    Some(idx),
                    started,
                );
            }
            Some((idx, Ok(payload))) => (idx, payload),
        };
        if produced > 1 {
            debug!(
                "Adopted handler {} for {} ({}), discarded {} other result(s)",
                idx,
                request.action,
                request.message_id,
                produced - 1
            );
        }

        let response = ResponseEnvelope::answering(&request, self.local.clone(), payload);
        match self.policy.sign_response(&request.action, response) {
            Ok(signed) => self.finish(&request, Outcome::Success(signed), None, Some(idx), started),
            Err(e) => {
                error!(
                    "Could not sign {} response ({}): {}",
                    request.action, request.message_id, e
                );
                let outcome = Outcome::SignatureError {
                    reason: format!("Could not sign response: {}", e),
                };
                self.finish(&request, outcome, Some(DispatchStage::Signed), Some(idx), started)
            }
        }
    }

    fn finish(
        &self,
        request: &RequestEnvelope,
        outcome: Outcome,
        rejected_at: Option<DispatchStage>,
        handler_index: Option<usize>,
        started: Instant,
    ) -> DispatchResult {
        self.observers.notify(&EngineEvent::ResponseSending {
            request,
            outcome: &outcome,
            runtime: started.elapsed(),
        });

        let reply = outcome.clone().into_frame(request, &self.local);
        let wire = encode_reply(&reply);
        let next_hop = request.reply_route().origin_node().cloned();
        info!(
            "Responding to {} ({}) with {}",
            request.action, request.message_id, outcome
        );

        DispatchResult {
            message_id: request.message_id.clone(),
            outcome,
            reply,
            wire,
            next_hop,
            rejected_at,
            handler_index,
        }
    }
}

/// Encode a reply, falling back to a bare CALLERROR if encoding fails
pub(crate) fn encode_reply(reply: &Frame) -> Vec<u8> {
    match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode reply {}: {}", reply.message_id(), e);
            serde_json::to_vec(&json!([
                4,
                reply.message_id(),
                "InternalError",
                "Reply encoding failed",
                {}
            ]))
            .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::ocpp::{self, Heartbeat, ResetRequest, ResetResponse, ResetStatus, ResetType};
    use crate::signature::AcceptAll;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pipeline() -> DispatchPipeline {
        DispatchPipeline::new(
            "csms".into(),
            Arc::new(ocpp::standard_catalog()),
            Arc::new(AcceptAll),
            Arc::new(Observers::new()),
        )
    }

    fn heartbeat() -> RequestEnvelope {
        RequestEnvelope::new("cs-1".into(), "csms".into(), "Heartbeat", json!({}))
    }

    fn reply_now() -> HandlerResult {
        Ok(Some(json!({ "currentTime": "2026-01-20T12:00:00Z" })))
    }

    fn explode(msg: &str) -> HandlerResult {
        panic!("{}", msg)
    }

    #[tokio::test]
    async fn test_undefined_handler() {
        let result = pipeline().handle(heartbeat(), &CancelSignal::never()).await;

        assert_eq!(result.outcome, Outcome::failed("Undefined handler"));
        assert_eq!(result.rejected_at, Some(DispatchStage::HandlerInvoked));
        assert_eq!(result.next_hop, Some(NodeId::from("cs-1")));
        match result.reply {
            Frame::RequestError(e) => assert_eq!(e.code, ErrorCode::GenericError),
            other => panic!("Expected RequestError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_registered_producer_wins() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |_| async { Ok(None) });
        pipeline.register_handler("Heartbeat", |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Some(json!({ "currentTime": "2026-01-20T12:00:00Z" })))
        });
        pipeline.register_handler("Heartbeat", |_| async {
            Ok(Some(json!({ "currentTime": "1999-01-01T00:00:00Z" })))
        });

        let result = pipeline.handle(heartbeat(), &CancelSignal::never()).await;

        assert_eq!(result.handler_index, Some(1));
        let response = result.outcome.response().unwrap();
        assert_eq!(response.payload["currentTime"], "2026-01-20T12:00:00Z");
    }

    #[tokio::test]
    async fn test_all_decline() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |_| async { Ok(None) });
        pipeline.register_handler("Heartbeat", |_| async { Ok(None) });

        let result = pipeline.handle(heartbeat(), &CancelSignal::never()).await;
        assert_eq!(result.outcome, Outcome::failed("No handler produced a response"));
    }

    #[tokio::test]
    async fn test_failing_handler_selected_before_later_success() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |_| async { Err(HandlerError::msg("db down")) });
        pipeline.register_handler("Heartbeat", |_| async { reply_now() });

        let result = pipeline.handle(heartbeat(), &CancelSignal::never()).await;

        assert!(matches!(
            &result.outcome,
            Outcome::ExceptionOccurred { description } if description == "db down"
        ));
        assert_eq!(result.outcome.error_code(), Some(ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_result() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |_| async { Ok(None) });
        pipeline.register_handler("Heartbeat", |_| async { explode("second handler") });
        pipeline.register_handler("Heartbeat", |_| async { reply_now() });

        let result = pipeline.handle(heartbeat(), &CancelSignal::never()).await;

        assert_eq!(result.handler_index, Some(1));
        assert_eq!(result.outcome.name(), "ExceptionOccurred");
    }

    #[tokio::test]
    async fn test_handler_panicking_when_called_is_isolated() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |req: Arc<RequestEnvelope>| {
            let _missing = req.payload["missing"].as_str().unwrap();
            async { reply_now() }
        });
        pipeline.register_handler("Heartbeat", |_| async { reply_now() });

        let result =
            tokio::spawn(async move { pipeline.handle(heartbeat(), &CancelSignal::never()).await })
                .await
                .unwrap();

        assert_eq!(result.handler_index, Some(0));
        assert_eq!(result.outcome.name(), "ExceptionOccurred");
        assert_eq!(result.next_hop, Some(NodeId::from("cs-1")));
    }

    #[tokio::test]
    async fn test_all_handlers_failing_is_generic_failure() {
        let pipeline = pipeline();
        pipeline.register_handler("Heartbeat", |_| async { Err(HandlerError::msg("a")) });
        pipeline.register_handler("Heartbeat", |_| async { explode("b") });

        let result = pipeline.handle(heartbeat(), &CancelSignal::never()).await;

        assert_eq!(result.outcome, Outcome::failed("All handlers failed: a"));
        assert_eq!(result.handler_index, None);
        match result.reply {
            Frame::RequestError(e) => assert_eq!(e.code, ErrorCode::GenericError),
            other => panic!("Expected RequestError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_skips_handlers() {
        let pipeline = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            pipeline.register_handler("Teleport", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Some(json!({}))) }
            });
        }

        let request = RequestEnvelope::new("cs-1".into(), "csms".into(), "Teleport", json!({}));
        let result = pipeline.handle(request, &CancelSignal::never()).await;

        assert_eq!(result.outcome.name(), "CouldNotParse");
        assert_eq!(result.rejected_at, Some(DispatchStage::Received));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_typed_operation_handler() {
        let pipeline = pipeline();
        pipeline.register_operation::<ocpp::Reset, _, _>(|req: ResetRequest, _| async move {
            let status = match req.reset_type {
                ResetType::Immediate => ResetStatus::Accepted,
                ResetType::OnIdle => ResetStatus::Scheduled,
            };
            Ok(Some(ResetResponse { status, status_info: None }))
        });

        let payload = json!({ "type": "OnIdle" });
        let request = RequestEnvelope::new("cs-1".into(), "csms".into(), "Reset", payload);
        let result = pipeline.handle(request, &CancelSignal::never()).await;

        let response = result.outcome.response().unwrap();
        assert_eq!(response.payload["status"], "Scheduled");
    }

    #[tokio::test]
    async fn test_cancel_during_fan_out() {
        let pipeline = Arc::new(pipeline());
        pipeline.register_handler("Heartbeat", |_| async {
            std::future::pending::<()>().await;
            reply_now()
        });

        let (handle, signal) = cancel_pair();
        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle(heartbeat(), &signal).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert_eq!(result.outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_broken_call_frame_gets_reply() {
        let pipeline = pipeline();
        let ctx = ParseContext::new("cs-1".into(), "csms".into());

        let result = pipeline
            .handle_frame(
                &ctx,
                br#"[2, "17", "Heartbeat", {}, {"path": []}]"#,
                &CancelSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(result.message_id, MessageId::from("17"));
        assert_eq!(result.outcome.name(), "FormationViolation");
        assert_eq!(result.next_hop, Some(NodeId::from("cs-1")));

        let none = pipeline
            .handle_frame(&ctx, br#"[3, "17", {}]"#, &CancelSignal::never())
            .await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_codec_registered() {
        let pipeline = pipeline();
        pipeline.register_operation::<Heartbeat, _, _>(|_, _| async {
            Ok(Some(ocpp::HeartbeatResponse {
                current_time: chrono::Utc::now(),
            }))
        });
        assert_eq!(pipeline.handler_count("Heartbeat"), 1);
    }
}
