//! Signing and verification of envelope payloads
//!
//! A `SignaturePolicy` is built once at startup and shared read-only by every
//! concurrent dispatch, forward and send. Implementations hold no per-call
//! mutable state.
//!
//! Signed bytes are the canonical JSON encoding (object keys sorted) of the
//! operation tag, the message id and the payload. A relay that rewrites a
//! payload invalidates the signatures on it, and a signature cannot be
//! replayed under another action or message id.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Value};
use thiserror::Error;

use crate::envelope::{RequestEnvelope, ResponseEnvelope, Signature};
use crate::types::MessageId;

/// Algorithm name written into `Signature::algorithm`
pub const ED25519: &str = "ed25519";

/// Signature verification or signing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Missing signature")]
    Missing,

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Malformed signature from {key_id}: {reason}")]
    Malformed { key_id: String, reason: String },

    #[error("Signature from {0} does not verify")]
    Invalid(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// Pluggable signing and verification of requests and responses.
///
/// `action` is the operation tag of the exchange; responses do not carry it
/// on the wire, so callers pass the action of the originating request.
pub trait SignaturePolicy: Send + Sync {
    fn verify_request(&self, request: &RequestEnvelope) -> Result<(), SignatureError>;

    fn verify_response(
        &self,
        action: &str,
        response: &ResponseEnvelope,
    ) -> Result<(), SignatureError>;

    fn sign_request(&self, request: RequestEnvelope) -> Result<RequestEnvelope, SignatureError>;

    fn sign_response(
        &self,
        action: &str,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, SignatureError>;
}

/// Policy that neither signs nor checks anything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SignaturePolicy for AcceptAll {
    fn verify_request(&self, _request: &RequestEnvelope) -> Result<(), SignatureError> {
        Ok(())
    }

    fn verify_response(
        &self,
        _action: &str,
        _response: &ResponseEnvelope,
    ) -> Result<(), SignatureError> {
        Ok(())
    }

    fn sign_request(&self, request: RequestEnvelope) -> Result<RequestEnvelope, SignatureError> {
        Ok(request)
    }

    fn sign_response(
        &self,
        _action: &str,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, SignatureError> {
        Ok(response)
    }
}

/// Which operations a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignatureRequirement {
    #[default]
    Never,
    Always,
    Operations(HashSet<String>),
}

impl SignatureRequirement {
    pub fn operations<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SignatureRequirement::Operations(actions.into_iter().map(Into::into).collect())
    }

    pub fn applies_to(&self, action: &str) -> bool {
        match self {
            SignatureRequirement::Never => false,
            SignatureRequirement::Always => true,
            SignatureRequirement::Operations(set) => set.contains(action),
        }
    }
}

/// Ed25519 signing with a set of trusted verification keys
pub struct Ed25519Policy {
    signing: Option<(String, SigningKey)>,
    trusted: HashMap<String, VerifyingKey>,
    require_requests: SignatureRequirement,
    require_responses: SignatureRequirement,
    sign_requests: SignatureRequirement,
    sign_responses: SignatureRequirement,
}

impl Default for Ed25519Policy {
    fn default() -> Self {
        Self::new()
    }
}

impl Ed25519Policy {
    /// Policy with no keys; signs everything once a key is set
    pub fn new() -> Self {
        Self {
            signing: None,
            trusted: HashMap::new(),
            require_requests: SignatureRequirement::Never,
            require_responses: SignatureRequirement::Never,
            sign_requests: SignatureRequirement::Always,
            sign_responses: SignatureRequirement::Always,
        }
    }

    /// Fresh random signing key
    pub fn generate_key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    pub fn with_signing_key(mut self, key_id: impl Into<String>, key: SigningKey) -> Self {
        self.signing = Some((key_id.into(), key));
        self
    }

    /// Signing key from a hex encoded 32-byte seed
    pub fn with_signing_seed_hex(
        self,
        key_id: impl Into<String>,
        seed_hex: &str,
    ) -> Result<Self, SignatureError> {
        let seed: [u8; 32] = decode_fixed(seed_hex).map_err(SignatureError::InvalidKey)?;
        Ok(self.with_signing_key(key_id, SigningKey::from_bytes(&seed)))
    }

    pub fn trust(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.trusted.insert(key_id.into(), key);
        self
    }

    /// Trust a hex encoded 32-byte public key
    pub fn trust_hex(
        self,
        key_id: impl Into<String>,
        public_hex: &str,
    ) -> Result<Self, SignatureError> {
        let bytes: [u8; 32] = decode_fixed(public_hex).map_err(SignatureError::InvalidKey)?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(self.trust(key_id, key))
    }

    pub fn require_request_signatures(mut self, rule: SignatureRequirement) -> Self {
        self.require_requests = rule;
        self
    }

    pub fn require_response_signatures(mut self, rule: SignatureRequirement) -> Self {
        self.require_responses = rule;
        self
    }

    pub fn sign_requests(mut self, rule: SignatureRequirement) -> Self {
        self.sign_requests = rule;
        self
    }

    pub fn sign_responses(mut self, rule: SignatureRequirement) -> Self {
        self.sign_responses = rule;
        self
    }

    /// Public half of the signing key, if one is set
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.signing.as_ref().map(|(_, key)| key.verifying_key())
    }

    fn verify(
        &self,
        required: bool,
        signed: SignedContent<'_>,
        signatures: &[Signature],
    ) -> Result<(), SignatureError> {
        if signatures.is_empty() {
            return if required { Err(SignatureError::Missing) } else { Ok(()) };
        }

        let message = canonical_bytes(signed)?;
        let mut verified = 0usize;

        for sig in signatures {
            let Some(key) = self.trusted.get(&sig.key_id) else {
                if required {
                    return Err(SignatureError::UnknownKey(sig.key_id.clone()));
                }
                continue;
            };

            if sig.algorithm != ED25519 {
                return Err(SignatureError::UnsupportedAlgorithm(sig.algorithm.clone()));
            }

            let raw: [u8; 64] =
                decode_fixed(&sig.value).map_err(|reason| SignatureError::Malformed {
                    key_id: sig.key_id.clone(),
                    reason,
                })?;
            let signature = ed25519_dalek::Signature::from_bytes(&raw);

            key.verify(&message, &signature)
                .map_err(|_| SignatureError::Invalid(sig.key_id.clone()))?;
            verified += 1;
        }

        if required && verified == 0 {
            return Err(SignatureError::Missing);
        }
        Ok(())
    }

    fn sign(
        &self,
        signed: SignedContent<'_>,
        signatures: &mut Vec<Signature>,
    ) -> Result<(), SignatureError> {
        let Some((key_id, key)) = &self.signing else {
            return Ok(());
        };
        if !signed.payload.is_object() {
            return Err(SignatureError::SigningFailed(
                "payload is not a JSON object".into(),
            ));
        }

        let message = canonical_bytes(signed)?;
        let signature = key.sign(&message);

        signatures.retain(|s| &s.key_id != key_id);
        signatures.push(Signature {
            key_id: key_id.clone(),
            algorithm: ED25519.to_string(),
            value: hex::encode(signature.to_bytes()),
        });
        Ok(())
    }
}

impl SignaturePolicy for Ed25519Policy {
    fn verify_request(&self, request: &RequestEnvelope) -> Result<(), SignatureError> {
        let required = self.require_requests.applies_to(&request.action);
        self.verify(required, SignedContent::of_request(request), &request.signatures)
    }

    fn verify_response(
        &self,
        action: &str,
        response: &ResponseEnvelope,
    ) -> Result<(), SignatureError> {
        let required = self.require_responses.applies_to(action);
        let signed = SignedContent::of_response(action, response);
        self.verify(required, signed, &response.signatures)
    }

    fn sign_request(
        &self,
        mut request: RequestEnvelope,
    ) -> Result<RequestEnvelope, SignatureError> {
        if self.sign_requests.applies_to(&request.action) {
            let signed = SignedContent {
                action: &request.action,
                message_id: &request.message_id,
                payload: &request.payload,
            };
            self.sign(signed, &mut request.signatures)?;
        }
        Ok(request)
    }

    fn sign_response(
        &self,
        action: &str,
        mut response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, SignatureError> {
        if self.sign_responses.applies_to(action) {
            let signed = SignedContent {
                action,
                message_id: &response.message_id,
                payload: &response.payload,
            };
            self.sign(signed, &mut response.signatures)?;
        }
        Ok(response)
    }
}

/// The parts of an envelope a signature covers
#[derive(Clone, Copy)]
struct SignedContent<'a> {
    action: &'a str,
    message_id: &'a MessageId,
    payload: &'a Value,
}

impl<'a> SignedContent<'a> {
    fn of_request(request: &'a RequestEnvelope) -> Self {
        Self {
            action: &request.action,
            message_id: &request.message_id,
            payload: &request.payload,
        }
    }

    fn of_response(action: &'a str, response: &'a ResponseEnvelope) -> Self {
        Self {
            action,
            message_id: &response.message_id,
            payload: &response.payload,
        }
    }
}

/// Canonical encoding of the signed content
fn canonical_bytes(signed: SignedContent<'_>) -> Result<Vec<u8>, SignatureError> {
    let document = json!({
        "action": signed.action,
        "messageId": signed.message_id,
        "payload": signed.payload,
    });
    serde_json::to_vec(&document).map_err(|e| SignatureError::SigningFailed(e.to_string()))
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("expected {} bytes, got {}", N, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> RequestEnvelope {
        RequestEnvelope::new("cs-1".into(), "csms".into(), "Reset", json!({"type": "Immediate"}))
    }

    fn keyed(seed: u8) -> (SigningKey, VerifyingKey) {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let public = key.verifying_key();
        (key, public)
    }

    #[test]
    fn test_sign_then_verify() {
        let (key, public) = keyed(1);
        let signer = Ed25519Policy::new().with_signing_key("cs-1", key);
        let verifier = Ed25519Policy::new()
            .trust("cs-1", public)
            .require_request_signatures(SignatureRequirement::Always);

        let signed = signer.sign_request(request()).unwrap();
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[0].algorithm, ED25519);
        assert!(verifier.verify_request(&signed).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let (key, public) = keyed(2);
        let signer = Ed25519Policy::new().with_signing_key("cs-1", key);
        let verifier = Ed25519Policy::new().trust("cs-1", public);

        let mut signed = signer.sign_request(request()).unwrap();
        signed.payload = json!({"type": "OnIdle"});

        assert_eq!(
            verifier.verify_request(&signed),
            Err(SignatureError::Invalid("cs-1".into()))
        );
    }

    #[test]
    fn test_signature_bound_to_action_and_message_id() {
        let (key, public) = keyed(7);
        let signer = Ed25519Policy::new().with_signing_key("cs-1", key);
        let verifier = Ed25519Policy::new().trust("cs-1", public);
        let signed = signer.sign_request(request()).unwrap();

        let mut other_id = signed.clone();
        other_id.message_id = "replayed".into();
        assert_eq!(
            verifier.verify_request(&other_id),
            Err(SignatureError::Invalid("cs-1".into()))
        );

        let mut other_action = signed;
        other_action.action = "DataTransfer".into();
        assert_eq!(
            verifier.verify_request(&other_action),
            Err(SignatureError::Invalid("cs-1".into()))
        );
    }

    #[test]
    fn test_response_signature_bound_to_action() {
        let (key, public) = keyed(8);
        let signer = Ed25519Policy::new().with_signing_key("csms", key);
        let verifier = Ed25519Policy::new().trust("csms", public);
        let response =
            ResponseEnvelope::answering(&request(), "csms".into(), json!({"status": "Accepted"}));

        let signed = signer.sign_response("Reset", response).unwrap();
        assert!(verifier.verify_response("Reset", &signed).is_ok());
        assert!(verifier.verify_response("ChangeAvailability", &signed).is_err());
    }

    #[test]
    fn test_required_but_missing() {
        let verifier = Ed25519Policy::new()
            .require_request_signatures(SignatureRequirement::operations(["Reset"]));

        assert_eq!(verifier.verify_request(&request()), Err(SignatureError::Missing));

        let heartbeat = RequestEnvelope::new("cs-1".into(), "csms".into(), "Heartbeat", json!({}));
        assert!(verifier.verify_request(&heartbeat).is_ok());
    }

    #[test]
    fn test_unknown_key_only_fails_when_required() {
        let (key, _) = keyed(3);
        let signed = Ed25519Policy::new()
            .with_signing_key("stranger", key)
            .sign_request(request())
            .unwrap();

        assert!(Ed25519Policy::new().verify_request(&signed).is_ok());
        assert_eq!(
            Ed25519Policy::new()
                .require_request_signatures(SignatureRequirement::Always)
                .verify_request(&signed),
            Err(SignatureError::UnknownKey("stranger".into()))
        );
    }

    #[test]
    fn test_signing_non_object_payload_fails() {
        let (key, _) = keyed(4);
        let policy = Ed25519Policy::new().with_signing_key("cs-1", key);
        let req = RequestEnvelope::new("cs-1".into(), "csms".into(), "Reset", json!([1, 2]));

        assert!(matches!(
            policy.sign_request(req),
            Err(SignatureError::SigningFailed(_))
        ));
    }

    #[test]
    fn test_hex_keys() {
        let (key, public) = keyed(5);
        let policy = Ed25519Policy::new()
            .with_signing_seed_hex("cs-1", &hex::encode(key.to_bytes()))
            .unwrap()
            .trust_hex("cs-1", &hex::encode(public.to_bytes()))
            .unwrap();

        let signed = policy.sign_request(request()).unwrap();
        assert!(policy.verify_request(&signed).is_ok());
        assert!(Ed25519Policy::new().trust_hex("x", "zz").is_err());
    }

    #[test]
    fn test_resigning_replaces_own_signature() {
        let (key, _) = keyed(6);
        let policy = Ed25519Policy::new().with_signing_key("cs-1", key);

        let once = policy.sign_request(request()).unwrap();
        let twice = policy.sign_request(once).unwrap();
        assert_eq!(twice.signatures.len(), 1);
    }
}
