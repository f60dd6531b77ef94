//! Operation catalog interface
//!
//! The engine does not know the field layout of any OCPP operation. Each
//! operation tag contributes an `OperationCodec` that can check a request or
//! response payload, and typed code works with `Operation` implementations
//! whose request/response records are plain serde types.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A typed request/response operation
pub trait Operation: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Operation tag on the wire
    const ACTION: &'static str;

    fn parse_request(payload: &Value) -> Result<Self::Request, String> {
        serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
    }

    fn parse_response(payload: &Value) -> Result<Self::Response, String> {
        serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
    }

    fn request_to_wire(request: &Self::Request) -> Result<Value, String> {
        serde_json::to_value(request).map_err(|e| e.to_string())
    }

    fn response_to_wire(response: &Self::Response) -> Result<Value, String> {
        serde_json::to_value(response).map_err(|e| e.to_string())
    }
}

/// Type-erased per-operation parse capability
pub trait OperationCodec: Send + Sync {
    fn action(&self) -> &str;

    fn try_parse_request(&self, payload: &Value) -> Result<(), String>;

    fn try_parse_response(&self, payload: &Value) -> Result<(), String>;
}

/// Codec backed by an `Operation`'s serde types
pub struct JsonCodec<O: Operation>(PhantomData<fn() -> O>);

impl<O: Operation> JsonCodec<O> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<O: Operation> Default for JsonCodec<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Operation> OperationCodec for JsonCodec<O> {
    fn action(&self) -> &str {
        O::ACTION
    }

    fn try_parse_request(&self, payload: &Value) -> Result<(), String> {
        O::parse_request(payload).map(|_| ())
    }

    fn try_parse_response(&self, payload: &Value) -> Result<(), String> {
        O::parse_response(payload).map(|_| ())
    }
}

/// Codec that accepts any JSON object payload for one tag
pub struct OpaqueCodec {
    action: String,
}

impl OpaqueCodec {
    pub fn new(action: impl Into<String>) -> Self {
        Self { action: action.into() }
    }
}

impl OperationCodec for OpaqueCodec {
    fn action(&self) -> &str {
        &self.action
    }

    fn try_parse_request(&self, payload: &Value) -> Result<(), String> {
        if payload.is_object() {
            Ok(())
        } else {
            Err("payload must be a JSON object".into())
        }
    }

    fn try_parse_response(&self, payload: &Value) -> Result<(), String> {
        self.try_parse_request(payload)
    }
}

/// Known operation tags and their codecs
#[derive(Default)]
pub struct Catalog {
    codecs: RwLock<HashMap<String, Arc<dyn OperationCodec>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_codec(&self, codec: Arc<dyn OperationCodec>) {
        self.codecs.write().insert(codec.action().to_string(), codec);
    }

    pub fn register<O: Operation>(&self) {
        self.register_codec(Arc::new(JsonCodec::<O>::new()));
    }

    pub fn contains(&self, action: &str) -> bool {
        self.codecs.read().contains_key(action)
    }

    pub fn codec(&self, action: &str) -> Option<Arc<dyn OperationCodec>> {
        self.codecs.read().get(action).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.codecs.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Check a request payload for `action`
    pub fn try_parse_request(&self, action: &str, payload: &Value) -> Result<(), String> {
        let codec = self
            .codec(action)
            .ok_or_else(|| format!("Unknown action: {}", action))?;
        codec
            .try_parse_request(payload)
            .map_err(|e| format!("Invalid {} request: {}", action, e))
    }

    /// Check a response payload for `action`
    pub fn try_parse_response(&self, action: &str, payload: &Value) -> Result<(), String> {
        let codec = self
            .codec(action)
            .ok_or_else(|| format!("Unknown action: {}", action))?;
        codec
            .try_parse_response(payload)
            .map_err(|e| format!("Invalid {} response: {}", action, e))
    }
}
