//! Observation hooks
//!
//! Hooks see the engine's lifecycle events: request received, about to
//! respond, forwarding decision made, request sent, response received.
//! They run inline and are isolated: a hook that errors or panics is logged
//! and reported on the failure channel, and the engine carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::envelope::{Outcome, RequestEnvelope};
use crate::forwarding::ForwardingDecision;
use crate::registry::{Registry, RegistrationId};
use crate::transport::TransportError;
use crate::types::{MessageId, NodeId};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    RequestReceived,
    ResponseSending,
    RequestFiltered,
    RequestSent,
    ResponseReceived,
}

/// Event delivered to hooks
#[derive(Debug)]
pub enum EngineEvent<'a> {
    RequestReceived {
        request: &'a RequestEnvelope,
    },
    ResponseSending {
        request: &'a RequestEnvelope,
        outcome: &'a Outcome,
        runtime: Duration,
    },
    RequestFiltered {
        request: &'a RequestEnvelope,
        decision: &'a ForwardingDecision,
    },
    RequestSent {
        request: &'a RequestEnvelope,
        next_hop: &'a NodeId,
        result: &'a Result<(), TransportError>,
    },
    ResponseReceived {
        action: &'a str,
        message_id: &'a MessageId,
        outcome: &'a Outcome,
        runtime: Duration,
    },
}

impl EngineEvent<'_> {
    pub fn kind(&self) -> HookKind {
        match self {
            EngineEvent::RequestReceived { .. } => HookKind::RequestReceived,
            EngineEvent::ResponseSending { .. } => HookKind::ResponseSending,
            EngineEvent::RequestFiltered { .. } => HookKind::RequestFiltered,
            EngineEvent::RequestSent { .. } => HookKind::RequestSent,
            EngineEvent::ResponseReceived { .. } => HookKind::ResponseReceived,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            EngineEvent::RequestReceived { request }
            | EngineEvent::ResponseSending { request, .. }
            | EngineEvent::RequestFiltered { request, .. }
            | EngineEvent::RequestSent { request, .. } => &request.action,
            EngineEvent::ResponseReceived { action, .. } => action,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            EngineEvent::RequestReceived { request }
            | EngineEvent::ResponseSending { request, .. }
            | EngineEvent::RequestFiltered { request, .. }
            | EngineEvent::RequestSent { request, .. } => &request.message_id,
            EngineEvent::ResponseReceived { message_id, .. } => message_id,
        }
    }
}

pub type Hook = Arc<dyn Fn(&EngineEvent<'_>) -> Result<(), String> + Send + Sync>;

/// Report of a hook that errored or panicked
#[derive(Debug, Clone)]
pub struct HookFailure {
    pub kind: HookKind,
    pub action: String,
    pub message_id: MessageId,
    pub error: String,
}

pub struct Observers {
    hooks: Registry<(HookKind, Hook)>,
    failures: broadcast::Sender<HookFailure>,
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

impl Observers {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            hooks: Registry::new(),
            failures,
        }
    }

    /// Register a hook for `action`, or for every action with `ANY_ACTION`
    pub fn observe<F>(&self, action: &str, kind: HookKind, hook: F) -> RegistrationId
    where
        F: Fn(&EngineEvent<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        let hook: Hook = Arc::new(hook);
        self.hooks.register(action, (kind, hook))
    }

    pub fn unobserve(&self, id: RegistrationId) -> bool {
        self.hooks.unregister(id)
    }

    /// Stream of hook failures
    pub fn failures(&self) -> broadcast::Receiver<HookFailure> {
        self.failures.subscribe()
    }

    pub fn notify(&self, event: &EngineEvent<'_>) {
        let kind = event.kind();
        for (hook_kind, hook) in self.hooks.snapshot_with_wildcard(event.action()) {
            if hook_kind != kind {
                continue;
            }

            let error = match catch_unwind(AssertUnwindSafe(|| hook(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => "hook panicked".to_string(),
            };

            warn!(
                "{:?} hook for {} ({}) failed: {}",
                kind,
                event.action(),
                event.message_id(),
                error
            );
            // No subscribers is fine
            let _ = self.failures.send(HookFailure {
                kind,
                action: event.action().to_string(),
                message_id: event.message_id().clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ANY_ACTION;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> RequestEnvelope {
        RequestEnvelope::new("cs-1".into(), "csms".into(), "Heartbeat", json!({}))
    }

    #[test]
    fn test_hooks_filtered_by_kind_and_action() {
        let observers = Observers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for (action, kind) in [
            ("Heartbeat", HookKind::RequestReceived),
            (ANY_ACTION, HookKind::RequestReceived),
            ("Heartbeat", HookKind::ResponseSending),
            ("Reset", HookKind::RequestReceived),
        ] {
            let hits = hits.clone();
            observers.observe(action, kind, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let req = request();
        observers.notify(&EngineEvent::RequestReceived { request: &req });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_hook_is_reported_and_isolated() {
        let observers = Observers::new();
        let mut failures = observers.failures();
        let after = Arc::new(AtomicUsize::new(0));

        observers.observe("Heartbeat", HookKind::RequestReceived, |_| Err("nope".into()));
        observers.observe("Heartbeat", HookKind::RequestReceived, |_| panic!("hook blew up"));
        {
            let after = after.clone();
            observers.observe("Heartbeat", HookKind::RequestReceived, move |_| {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let req = request();
        observers.notify(&EngineEvent::RequestReceived { request: &req });

        assert_eq!(after.load(Ordering::SeqCst), 1);
        let first = failures.try_recv().unwrap();
        assert_eq!(first.error, "nope");
        assert_eq!(first.kind, HookKind::RequestReceived);
        let second = failures.try_recv().unwrap();
        assert_eq!(second.error, "hook panicked");
        assert_eq!(second.message_id, req.message_id);
    }
}
