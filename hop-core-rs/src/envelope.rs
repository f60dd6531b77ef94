//! Request, response and error envelopes
//!
//! An envelope is the engine's view of one OCPP message: the operation
//! payload plus the routing metadata (hop path, destination, reply route)
//! and signatures that travel with it. `Outcome` is the closed set of ways a
//! request can end.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::frame::{ErrorCode, Frame};
use crate::types::{HopPath, MessageId, NodeId};

/// Timeout applied when a request does not carry one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Detached signature over an envelope payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub algorithm: String,
    /// Hex encoded signature bytes
    pub value: String,
}

/// Outbound or inbound request (CALL)
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub message_id: MessageId,
    pub action: String,
    pub payload: Value,
    pub destination: NodeId,
    pub path: HopPath,
    pub timestamp: DateTime<Utc>,
    pub timeout: Duration,
    pub signatures: Vec<Signature>,
}

impl RequestEnvelope {
    /// Create a request originating at `origin` with an auto-generated id
    pub fn new(
        origin: NodeId,
        destination: NodeId,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            action: action.into(),
            payload,
            destination,
            path: HopPath::origin(origin),
            timestamp: Utc::now(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            signatures: Vec::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Node that originated the request
    pub fn origin(&self) -> Option<&NodeId> {
        self.path.origin_node()
    }

    /// Copy of this request as sent onward by `relay`
    pub fn forwarded_by(&self, relay: NodeId) -> Self {
        Self {
            path: self.path.append(relay),
            ..self.clone()
        }
    }

    /// Route a reply to this request takes
    pub fn reply_route(&self) -> HopPath {
        self.path.reverse_for_reply()
    }
}

/// Successful response (CALLRESULT)
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub message_id: MessageId,
    pub payload: Value,
    /// Hops the response still has to take; the last one is the request origin
    pub route: HopPath,
    /// Hops the response has traversed, starting at the responder
    pub path: HopPath,
    pub timestamp: DateTime<Utc>,
    pub signatures: Vec<Signature>,
}

impl ResponseEnvelope {
    /// Response from `responder` to `request`, routed back along its path
    pub fn answering(request: &RequestEnvelope, responder: NodeId, payload: Value) -> Self {
        Self {
            message_id: request.message_id.clone(),
            payload,
            route: request.reply_route(),
            path: HopPath::origin(responder),
            timestamp: Utc::now(),
            signatures: Vec::new(),
        }
    }

    pub fn responder(&self) -> Option<&NodeId> {
        self.path.origin_node()
    }
}

/// Error reply: CALLERROR for requests, CALLRESULTERROR for responses
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub message_id: MessageId,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
    pub route: HopPath,
    pub path: HopPath,
    pub timestamp: DateTime<Utc>,
}

/// Request rejected before or instead of a handler result
pub type RequestErrorEnvelope = ErrorEnvelope;

/// Response that failed validation on its way back
pub type ResponseErrorEnvelope = ErrorEnvelope;

impl ErrorEnvelope {
    pub fn new(
        message_id: MessageId,
        code: ErrorCode,
        description: impl Into<String>,
        route: HopPath,
        responder: NodeId,
    ) -> Self {
        Self {
            message_id,
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
            route,
            path: HopPath::origin(responder),
            timestamp: Utc::now(),
        }
    }

    /// Error from `responder` to `request`, routed back along its path
    pub fn answering(
        request: &RequestEnvelope,
        responder: NodeId,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            request.message_id.clone(),
            code,
            description,
            request.reply_route(),
            responder,
        )
    }

    /// Error about a received response, routed back to the responder
    pub fn rejecting_response(
        response: &ResponseEnvelope,
        local: NodeId,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            response.message_id.clone(),
            code,
            description,
            response.path.reverse_for_reply(),
            local,
        )
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Engine result kind recorded by the peer that produced this error
    pub fn result_kind(&self) -> Option<&str> {
        self.details.get("result").and_then(Value::as_str)
    }
}

/// How a request ended.
///
/// `Success` and `RequestError` come from the remote peer; every other
/// variant is synthesized locally by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ResponseEnvelope),
    /// Remote peer reported failure (CALLERROR)
    RequestError(ErrorEnvelope),
    /// The response arrived but failed signature or payload validation
    ResponseError { code: ErrorCode, description: String },
    CouldNotParse { description: String },
    FormationViolation { description: String },
    SignatureError { reason: String },
    Failed { description: String },
    ExceptionOccurred { description: String },
    Timeout { after: Duration },
    Filtered { description: String },
    ConnectionLost { peer: NodeId },
    Cancelled,
}

impl Outcome {
    pub fn failed(description: impl Into<String>) -> Self {
        Outcome::Failed {
            description: description.into(),
        }
    }

    pub fn filtered(description: impl Into<String>) -> Self {
        Outcome::Filtered {
            description: description.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn response(&self) -> Option<&ResponseEnvelope> {
        match self {
            Outcome::Success(r) => Some(r),
            _ => None,
        }
    }

    /// Stable name of the outcome kind
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "Success",
            Outcome::RequestError(_) => "RequestError",
            Outcome::ResponseError { .. } => "ResponseError",
            Outcome::CouldNotParse { .. } => "CouldNotParse",
            Outcome::FormationViolation { .. } => "FormationViolation",
            Outcome::SignatureError { .. } => "SignatureError",
            Outcome::Failed { .. } => "Failed",
            Outcome::ExceptionOccurred { .. } => "ExceptionOccurred",
            Outcome::Timeout { .. } => "Timeout",
            Outcome::Filtered { .. } => "Filtered",
            Outcome::ConnectionLost { .. } => "ConnectionLost",
            Outcome::Cancelled => "Cancelled",
        }
    }

    /// Wire error code for a failure outcome
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RequestError(e) => Some(e.code),
            Outcome::ResponseError { code, .. } => Some(*code),
            Outcome::CouldNotParse { .. } => Some(ErrorCode::FormatViolation),
            Outcome::FormationViolation { .. } => Some(ErrorCode::FormationViolation),
            Outcome::SignatureError { .. } => Some(ErrorCode::SecurityError),
            Outcome::Failed { .. } => Some(ErrorCode::GenericError),
            Outcome::ExceptionOccurred { .. } => Some(ErrorCode::InternalError),
            Outcome::Timeout { .. } => Some(ErrorCode::Timeout),
            Outcome::Filtered { .. } => Some(ErrorCode::Filtered),
            Outcome::ConnectionLost { .. } => Some(ErrorCode::GenericError),
            Outcome::Cancelled => Some(ErrorCode::GenericError),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Outcome::Success(_) => String::new(),
            Outcome::RequestError(e) => e.description.clone(),
            Outcome::ResponseError { description, .. }
            | Outcome::CouldNotParse { description }
            | Outcome::FormationViolation { description }
            | Outcome::Failed { description }
            | Outcome::ExceptionOccurred { description }
            | Outcome::Filtered { description } => description.clone(),
            Outcome::SignatureError { reason } => reason.clone(),
            Outcome::Timeout { after } => format!("No response within {:?}", after),
            Outcome::ConnectionLost { peer } => format!("Connection to {} lost", peer),
            Outcome::Cancelled => "Cancelled".to_string(),
        }
    }

    /// Wire frame answering `request` with this outcome
    pub fn into_frame(self, request: &RequestEnvelope, responder: &NodeId) -> Frame {
        match self {
            Outcome::Success(response) => Frame::Response(response),
            Outcome::RequestError(error) => Frame::RequestError(error),
            other => {
                let code = other.error_code().unwrap_or(ErrorCode::GenericError);
                Frame::RequestError(
                    ErrorEnvelope::answering(request, responder.clone(), code, other.description())
                        .with_details(json!({ "result": other.name() })),
                )
            }
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(r) => write!(f, "Success({})", r.message_id),
            other => write!(f, "{}({})", other.name(), other.description()),
        }
    }
}
