//! Relay forwarding decision pipeline
//!
//! A request passing through a relay is offered to every filter registered
//! for its operation. Filters run concurrently; the first one in
//! registration order that returns a decision wins. Filters that decline,
//! error or panic are ignored, and with no decision at all the relay's
//! default verdict applies.
//!
//! A REJECT always leaves the pipeline with a rejection reply ready to send
//! back towards the origin. A FORWARD carries the outgoing request with this
//! relay appended to its path.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::dispatch::encode_reply;
use crate::envelope::{Outcome, RequestEnvelope};
use crate::fanout::{invoke_all, select_first, Invocation};
use crate::frame::Frame;
use crate::observer::{EngineEvent, Observers};
use crate::operation::Catalog;
use crate::registry::{Registry, RegistrationId};
use crate::transport::TransportError;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    Forward,
    Reject,
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(Verdict::Forward),
            "reject" => Ok(Verdict::Reject),
            other => Err(format!("unknown verdict '{}', expected forward or reject", other)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Forward => f.write_str("forward"),
            Verdict::Reject => f.write_str("reject"),
        }
    }
}

/// Where a decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Filter at this registration index
    Filter(usize),
    DefaultPolicy,
    ParseFailure,
    Cancelled,
}

/// Result of an attempt to send the forwarded request
#[derive(Debug, Clone)]
pub struct SendReport {
    pub next_hop: NodeId,
    pub result: Result<(), TransportError>,
}

pub type SentCallback = Box<dyn FnOnce(&SendReport) + Send>;

/// Decision on one relayed request
pub struct ForwardingDecision {
    verdict: Verdict,
    source: DecisionSource,
    replacement: Option<RequestEnvelope>,
    outgoing: Option<RequestEnvelope>,
    rejection: Option<Outcome>,
    rejection_frame: Option<Frame>,
    rejection_wire: Option<Vec<u8>>,
    sent_callbacks: Vec<SentCallback>,
}

impl ForwardingDecision {
    fn with_verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            source: DecisionSource::DefaultPolicy,
            replacement: None,
            outgoing: None,
            rejection: None,
            rejection_frame: None,
            rejection_wire: None,
            sent_callbacks: Vec::new(),
        }
    }

    pub fn forward() -> Self {
        Self::with_verdict(Verdict::Forward)
    }

    /// Forward `replacement` instead of the received request.
    ///
    /// The message id and hop path of the received request are kept.
    pub fn forward_rewritten(replacement: RequestEnvelope) -> Self {
        Self {
            replacement: Some(replacement),
            ..Self::forward()
        }
    }

    pub fn reject() -> Self {
        Self::with_verdict(Verdict::Reject)
    }

    /// Reject with a specific outcome reported to the origin
    pub fn reject_with(outcome: Outcome) -> Self {
        Self {
            rejection: Some(outcome),
            ..Self::reject()
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn source(&self) -> DecisionSource {
        self.source
    }

    pub fn replacement(&self) -> Option<&RequestEnvelope> {
        self.replacement.as_ref()
    }

    /// Request to transmit, set on FORWARD decisions leaving the pipeline
    pub fn outgoing(&self) -> Option<&RequestEnvelope> {
        self.outgoing.as_ref()
    }

    pub fn rejection(&self) -> Option<&Outcome> {
        self.rejection.as_ref()
    }

    pub fn rejection_frame(&self) -> Option<&Frame> {
        self.rejection_frame.as_ref()
    }

    /// Encoded rejection reply, set on REJECT decisions leaving the pipeline
    pub fn rejection_wire(&self) -> Option<&[u8]> {
        self.rejection_wire.as_deref()
    }

    /// Run `callback` once the forwarded request has been handed to the transport
    pub fn on_sent(&mut self, callback: impl FnOnce(&SendReport) + Send + 'static) {
        self.sent_callbacks.push(Box::new(callback));
    }

    pub fn notify_sent(&mut self, report: &SendReport) {
        for callback in self.sent_callbacks.drain(..) {
            callback(report);
        }
    }
}

impl fmt::Debug for ForwardingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingDecision")
            .field("verdict", &self.verdict)
            .field("source", &self.source)
            .field("replacement", &self.replacement.as_ref().map(|r| &r.message_id))
            .field("rejection", &self.rejection)
            .field("sent_callbacks", &self.sent_callbacks.len())
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FilterError(pub String);

/// `Ok(None)` leaves the decision to other filters or the default verdict
pub type FilterResult = Result<Option<ForwardingDecision>, FilterError>;
pub type Filter =
    Arc<dyn Fn(Arc<RequestEnvelope>) -> BoxFuture<'static, FilterResult> + Send + Sync>;

pub struct ForwardingPipeline {
    local: NodeId,
    catalog: Arc<Catalog>,
    filters: Registry<Filter>,
    observers: Arc<Observers>,
    default_verdict: Verdict,
}

impl ForwardingPipeline {
    pub fn new(
        local: NodeId,
        catalog: Arc<Catalog>,
        observers: Arc<Observers>,
        default_verdict: Verdict,
    ) -> Self {
        Self {
            local,
            catalog,
            filters: Registry::new(),
            observers,
            default_verdict,
        }
    }

    pub fn default_verdict(&self) -> Verdict {
        self.default_verdict
    }

    pub fn register_filter<F, Fut>(&self, action: &str, filter: F) -> RegistrationId
    where
        F: Fn(Arc<RequestEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FilterResult> + Send + 'static,
    {
        let filter: Filter = Arc::new(move |request: Arc<RequestEnvelope>| filter(request).boxed());
        self.filters.register(action, filter)
    }

    pub fn unregister_filter(&self, id: RegistrationId) -> bool {
        self.filters.unregister(id)
    }

    /// Decide what happens to `request` at this relay
    pub async fn decide(
        &self,
        request: &RequestEnvelope,
        cancel: &CancelSignal,
    ) -> ForwardingDecision {
        if let Err(e) = self.catalog.try_parse_request(&request.action, &request.payload) {
            warn!(
                "Relay {} cannot parse {} ({}): {}",
                self.local, request.action, request.message_id, e
            );
            let mut decision =
                ForwardingDecision::reject_with(Outcome::CouldNotParse { description: e });
            decision.source = DecisionSource::ParseFailure;
            return self.complete(request, decision);
        }

        let shared = Arc::new(request.clone());
        self.observers
            .notify(&EngineEvent::RequestReceived { request: &shared });

        let filters = self.filters.snapshot(&request.action);
        let chosen = if filters.is_empty() {
            None
        } else {
            let futures = filters
                .into_iter()
                .map(|filter| {
                    let request = shared.clone();
                    async move { filter(request).await }.boxed()
                })
                .collect();
            match invoke_all(futures, cancel).await {
                Ok(invocations) => {
                    let slots = invocations
                        .into_iter()
                        .enumerate()
                        .map(|(idx, invocation)| match invocation {
                            Invocation::Completed(Ok(decision)) => decision,
                            Invocation::Completed(Err(e)) => {
                                warn!("Filter {} for {} failed: {}", idx, request.action, e);
                                None
                            }
                            Invocation::Panicked(msg) => {
                                warn!("Filter {} for {} panicked: {}", idx, request.action, msg);
                                None
                            }
                        })
                        .collect();
                    select_first(slots)
                }
                Err(_) => {
                    info!("Forwarding of {} ({}) cancelled", request.action, request.message_id);
                    let mut decision = ForwardingDecision::reject_with(Outcome::Cancelled);
                    decision.source = DecisionSource::Cancelled;
                    return self.complete(request, decision);
                }
            }
        };

        let decision = match chosen {
            Some((idx, mut decision)) => {
                debug!("Filter {} decided {} for {}", idx, decision.verdict, request.message_id);
                decision.source = DecisionSource::Filter(idx);
                decision
            }
            None => ForwardingDecision::with_verdict(self.default_verdict),
        };
        self.complete(request, decision)
    }

    fn complete(
        &self,
        request: &RequestEnvelope,
        mut decision: ForwardingDecision,
    ) -> ForwardingDecision {
        match decision.verdict {
            Verdict::Reject => {
                let outcome = decision.rejection.take().unwrap_or_else(|| {
                    Outcome::filtered(format!(
                        "{} request filtered by relay {}",
                        request.action, self.local
                    ))
                });
                let frame = outcome.clone().into_frame(request, &self.local);
                decision.rejection_wire = Some(encode_reply(&frame));
                decision.rejection_frame = Some(frame);
                decision.rejection = Some(outcome);
                info!(
                    "Relay {} rejected {} ({}): {:?}",
                    self.local, request.action, request.message_id, decision.source
                );
            }
            Verdict::Forward => {
                let base = match &decision.replacement {
                    Some(replacement) => RequestEnvelope {
                        message_id: request.message_id.clone(),
                        path: request.path.clone(),
                        ..replacement.clone()
                    },
                    None => request.clone(),
                };
                let outgoing = base.forwarded_by(self.local.clone());

                let observers = self.observers.clone();
                let sent = outgoing.clone();
                decision.on_sent(move |report| {
                    observers.notify(&EngineEvent::RequestSent {
                        request: &sent,
                        next_hop: &report.next_hop,
                        result: &report.result,
                    });
                });
                decision.outgoing = Some(outgoing);
            }
        }

        self.observers.notify(&EngineEvent::RequestFiltered {
            request,
            decision: &decision,
        });
        decision
    }
}
