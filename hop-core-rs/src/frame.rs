//! OCPP-J message framing with a routing header
//!
//! Plain OCPP-J frames are JSON arrays:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//! - CALLRESULTERROR: [5, messageId, errorCode, errorDescription, errorDetails]
//!
//! Multi-hop frames append one trailing header object. For CALL it carries
//! `destination`, `path`, `timestamp` and `timeoutMs`; for replies `route`,
//! `path` and `timestamp`. Frames without the header come from a direct
//! neighbour: the path is just the sender and the destination is us.
//!
//! Signatures travel inside the payload object under `"signatures"`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::envelope::{
    ErrorEnvelope, Outcome, RequestEnvelope, ResponseEnvelope, Signature,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::types::{HopPath, MessageId, NodeId, PathError};

/// Name of the payload member holding signatures
pub const SIGNATURES_FIELD: &str = "signatures";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
}

/// Error codes carried by CALLERROR and CALLRESULTERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Filtered,
    Timeout,
}

impl ErrorCode {
    /// Parse a wire code; codes we do not know map to GenericError
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors decoding a wire frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {reason}")]
    InvalidFormat {
        message_id: Option<MessageId>,
        is_call: bool,
        reason: String,
    },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("{source} (message {message_id})")]
    MalformedPath {
        message_id: MessageId,
        is_call: bool,
        #[source]
        source: PathError,
    },
}

impl FrameError {
    fn invalid(message_id: Option<&MessageId>, is_call: bool, reason: impl Into<String>) -> Self {
        FrameError::InvalidFormat {
            message_id: message_id.cloned(),
            is_call,
            reason: reason.into(),
        }
    }

    /// Message id, when the frame got far enough to carry one
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            FrameError::InvalidFormat { message_id, .. } => message_id.as_ref(),
            FrameError::MalformedPath { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Whether the broken frame was a request that deserves a reply
    pub fn is_call(&self) -> bool {
        match self {
            FrameError::InvalidFormat { is_call, .. }
            | FrameError::MalformedPath { is_call, .. } => {
                *is_call
            }
            _ => false,
        }
    }

    /// Outcome to reply with when the frame was a request
    pub fn outcome(&self) -> Outcome {
        match self {
            FrameError::MalformedPath { .. } => Outcome::FormationViolation {
                description: self.to_string(),
            },
            _ => Outcome::CouldNotParse {
                description: self.to_string(),
            },
        }
    }
}

/// Who handed us the bytes and who we are
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub sender: NodeId,
    pub local: NodeId,
}

impl ParseContext {
    pub fn new(sender: NodeId, local: NodeId) -> Self {
        Self { sender, local }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<NodeId>,
    #[serde(default)]
    path: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyHeader {
    #[serde(default)]
    route: Vec<NodeId>,
    #[serde(default)]
    path: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

/// Any parsed OCPP frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    RequestError(ErrorEnvelope),
    ResponseError(ErrorEnvelope),
}

impl Frame {
    /// Parse a frame from JSON bytes
    pub fn parse(bytes: &[u8], ctx: &ParseContext) -> Result<Self, FrameError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| FrameError::invalid(None, false, "missing message type"))?;

        let is_call = msg_type == MessageType::Call as i64;
        if !(2..=5).contains(&msg_type) {
            return Err(FrameError::UnknownMessageType(msg_type));
        }

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .map(MessageId::from)
            .ok_or_else(|| FrameError::invalid(None, is_call, "missing message id"))?;

        match msg_type {
            2 => parse_call(array, message_id, ctx),
            3 => parse_call_result(array, message_id, ctx),
            _ => {
                let error = parse_error(array, &message_id, ctx)?;
                if msg_type == MessageType::CallError as i64 {
                    Ok(Frame::RequestError(error))
                } else {
                    Ok(Frame::ResponseError(error))
                }
            }
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Frame::Request(r) => &r.message_id,
            Frame::Response(r) => &r.message_id,
            Frame::RequestError(e) | Frame::ResponseError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Request(_) => MessageType::Call,
            Frame::Response(_) => MessageType::CallResult,
            Frame::RequestError(_) => MessageType::CallError,
            Frame::ResponseError(_) => MessageType::CallResultError,
        }
    }

    /// Serialize to the wire format, always including the routing header
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = match self {
            Frame::Request(r) => {
                let header = serde_json::to_value(RequestHeader {
                    destination: Some(r.destination.clone()),
                    path: r.path.as_slice().to_vec(),
                    timestamp: Some(r.timestamp),
                    timeout_ms: Some(r.timeout.as_millis() as u64),
                })?;
                json!([
                    MessageType::Call as i32,
                    &r.message_id,
                    &r.action,
                    attach_signatures(&r.payload, &r.signatures),
                    header
                ])
            }
            Frame::Response(r) => {
                let header = serde_json::to_value(ReplyHeader {
                    route: r.route.as_slice().to_vec(),
                    path: r.path.as_slice().to_vec(),
                    timestamp: Some(r.timestamp),
                })?;
                json!([
                    MessageType::CallResult as i32,
                    &r.message_id,
                    attach_signatures(&r.payload, &r.signatures),
                    header
                ])
            }
            Frame::RequestError(e) | Frame::ResponseError(e) => {
                let header = serde_json::to_value(ReplyHeader {
                    route: e.route.as_slice().to_vec(),
                    path: e.path.as_slice().to_vec(),
                    timestamp: Some(e.timestamp),
                })?;
                json!([
                    self.message_type() as i32,
                    &e.message_id,
                    e.code.to_string(),
                    &e.description,
                    &e.details,
                    header
                ])
            }
        };
        Ok(serde_json::to_vec(&array)?)
    }
}

fn parse_call(
    array: Vec<Value>,
    message_id: MessageId,
    ctx: &ParseContext,
) -> Result<Frame, FrameError> {
    // CALL: [2, messageId, action, payload, header?]
    if array.len() != 4 && array.len() != 5 {
        return Err(FrameError::invalid(Some(&message_id), true, "CALL must have 4 or 5 elements"));
    }

    let action = array[2]
        .as_str()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| FrameError::invalid(Some(&message_id), true, "missing action"))?
        .to_string();

    let (payload, signatures) = split_signatures(array[3].clone())
        .map_err(|reason| FrameError::invalid(Some(&message_id), true, reason))?;

    let (destination, path, timestamp, timeout) = match array.get(4) {
        Some(raw) => {
            let header: RequestHeader = serde_json::from_value(raw.clone()).map_err(|e| {
                FrameError::invalid(Some(&message_id), true, format!("bad routing header: {}", e))
            })?;
            let path = HopPath::from_wire(header.path).map_err(|source| FrameError::MalformedPath {
                message_id: message_id.clone(),
                is_call: true,
                source,
            })?;
            (
                header.destination.unwrap_or_else(|| ctx.local.clone()),
                path,
                header.timestamp.unwrap_or_else(Utc::now),
                header
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )
        }
        None => (
            ctx.local.clone(),
            HopPath::origin(ctx.sender.clone()),
            Utc::now(),
            DEFAULT_REQUEST_TIMEOUT,
        ),
    };

    Ok(Frame::Request(RequestEnvelope {
        message_id,
        action,
        payload,
        destination,
        path,
        timestamp,
        timeout,
        signatures,
    }))
}

fn parse_call_result(
    array: Vec<Value>,
    message_id: MessageId,
    ctx: &ParseContext,
) -> Result<Frame, FrameError> {
    // CALLRESULT: [3, messageId, payload, header?]
    if array.len() != 3 && array.len() != 4 {
        return Err(FrameError::invalid(
            Some(&message_id),
            false,
            "CALLRESULT must have 3 or 4 elements",
        ));
    }

    let (payload, signatures) = split_signatures(array[2].clone())
        .map_err(|reason| FrameError::invalid(Some(&message_id), false, reason))?;
    let (route, path, timestamp) = parse_reply_header(array.get(3), &message_id, ctx)?;

    Ok(Frame::Response(ResponseEnvelope {
        message_id,
        payload,
        route,
        path,
        timestamp,
        signatures,
    }))
}

fn parse_error(
    array: Vec<Value>,
    message_id: &MessageId,
    ctx: &ParseContext,
) -> Result<ErrorEnvelope, FrameError> {
    // CALLERROR / CALLRESULTERROR:
    // [t, messageId, errorCode, errorDescription, errorDetails, header?]
    if array.len() != 5 && array.len() != 6 {
        return Err(FrameError::invalid(
            Some(message_id),
            false,
            "error frame must have 5 or 6 elements",
        ));
    }

    let code = array[2]
        .as_str()
        .map(ErrorCode::from_wire)
        .ok_or_else(|| FrameError::invalid(Some(message_id), false, "missing error code"))?;
    let description = array[3].as_str().unwrap_or("").to_string();
    let details = array[4].clone();
    let (route, path, timestamp) = parse_reply_header(array.get(5), message_id, ctx)?;

    Ok(ErrorEnvelope {
        message_id: message_id.clone(),
        code,
        description,
        details,
        route,
        path,
        timestamp,
    })
}

fn parse_reply_header(
    raw: Option<&Value>,
    message_id: &MessageId,
    ctx: &ParseContext,
) -> Result<(HopPath, HopPath, DateTime<Utc>), FrameError> {
    let Some(raw) = raw else {
        return Ok((HopPath::default(), HopPath::origin(ctx.sender.clone()), Utc::now()));
    };

    let header: ReplyHeader = serde_json::from_value(raw.clone()).map_err(|e| {
        FrameError::invalid(Some(message_id), false, format!("bad routing header: {}", e))
    })?;
    let path = HopPath::from_wire(header.path).map_err(|source| FrameError::MalformedPath {
        message_id: message_id.clone(),
        is_call: false,
        source,
    })?;
    // An empty route means the reply is already at its destination
    let route = if header.route.is_empty() {
        HopPath::default()
    } else {
        HopPath::from_wire(header.route).map_err(|source| FrameError::MalformedPath {
            message_id: message_id.clone(),
            is_call: false,
            source,
        })?
    };

    Ok((route, path, header.timestamp.unwrap_or_else(Utc::now)))
}

/// Pull the signatures member out of a payload object
fn split_signatures(mut payload: Value) -> Result<(Value, Vec<Signature>), String> {
    let raw = match payload.as_object_mut() {
        Some(obj) => obj.remove(SIGNATURES_FIELD),
        None => None,
    };

    match raw {
        None => Ok((payload, Vec::new())),
        Some(raw) => {
            let signatures: Vec<Signature> =
                serde_json::from_value(raw).map_err(|e| format!("bad signatures: {}", e))?;
            Ok((payload, signatures))
        }
    }
}

/// Payload as it goes on the wire, with signatures folded back in
fn attach_signatures(payload: &Value, signatures: &[Signature]) -> Value {
    if signatures.is_empty() {
        return payload.clone();
    }

    let mut payload = payload.clone();
    if let Some(obj) = payload.as_object_mut() {
        if let Ok(sigs) = serde_json::to_value(signatures) {
            obj.insert(SIGNATURES_FIELD.to_string(), sigs);
        }
    }
    payload
}
