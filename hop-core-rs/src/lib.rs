//! # Hop Core
//!
//! Message adapter engine for multi-hop OCPP networks.
//!
//! Charging stations, relays (local controllers, gateways) and a CSMS
//! exchange OCPP requests over persistent connections. A message may pass
//! through any number of relays, so every envelope carries the ordered path
//! of nodes it has traversed and replies travel back along that path.
//!
//! ## Architecture
//!
//! ```text
//!              inbound bytes
//!                   │
//!                   ▼
//! ┌──────────────────────────────────────────┐
//! │ Node                                     │
//! │  request for us ──► DispatchPipeline     │──► handlers (fan-out)
//! │  request for other ► ForwardingPipeline  │──► filters (fan-out)
//! │  reply for us ────► CorrelationManager   │──► pending handles
//! │  reply for other ─► next hop on route    │
//! └──────────────┬───────────────────────────┘
//!                │ Transport::send
//!                ▼
//!         MemoryHub / WebSocket
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use hop_core::{AcceptAll, MemoryHub, Node, NodeConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let (transport, rx) = hub.join("csms".into());
//!
//!     let csms = Node::new(NodeConfig::new("csms"), transport, Arc::new(AcceptAll));
//!     csms.register_handler("Heartbeat", |_| async {
//!         Ok(Some(json!({ "currentTime": "2026-01-20T12:00:00Z" })))
//!     });
//!     csms.spawn_receiver(rx).await.ok();
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod envelope;
pub mod fanout;
pub mod forwarding;
pub mod frame;
pub mod node;
pub mod observer;
pub mod ocpp;
pub mod operation;
pub mod registry;
pub mod signature;
pub mod transport;
pub mod types;

pub use config::{NodeConfig, SigningConfig};
pub use node::Node;

// Re-export key types
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use correlation::{CorrelationManager, ResponseHandle};
pub use dispatch::{DispatchPipeline, DispatchResult, DispatchStage, HandlerError, HandlerResult};
pub use envelope::{
    ErrorEnvelope, Outcome, RequestEnvelope, RequestErrorEnvelope, ResponseEnvelope,
    ResponseErrorEnvelope, Signature, DEFAULT_REQUEST_TIMEOUT,
};
pub use forwarding::{
    DecisionSource, FilterError, FilterResult, ForwardingDecision, ForwardingPipeline, SendReport,
    Verdict,
};
pub use frame::{ErrorCode, Frame, FrameError, MessageType, ParseContext};
pub use observer::{EngineEvent, HookFailure, HookKind, Observers};
pub use operation::{Catalog, JsonCodec, OpaqueCodec, Operation, OperationCodec};
pub use registry::{RegistrationId, ANY_ACTION};
pub use signature::{
    AcceptAll, Ed25519Policy, SignatureError, SignaturePolicy, SignatureRequirement,
};
pub use transport::{InboundFrame, MemoryHub, MemoryTransport, Transport, TransportError};
pub use types::{HopPath, MessageId, NodeId, PathError};
