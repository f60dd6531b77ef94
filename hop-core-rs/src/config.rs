//! Node configuration
//!
//! Identity, routing and signature settings for one engine instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::DEFAULT_REQUEST_TIMEOUT;
use crate::forwarding::Verdict;
use crate::signature::{
    AcceptAll, Ed25519Policy, SignatureError, SignaturePolicy, SignatureRequirement,
};
use crate::types::NodeId;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,

    /// Verdict for relayed requests no filter decided on
    pub default_verdict: Verdict,

    /// Deadline for requests this node originates
    pub request_timeout: Duration,

    /// Static routes: destination -> neighbour to send through
    pub routes: HashMap<NodeId, NodeId>,

    /// Neighbour for destinations without a static route
    pub default_route: Option<NodeId>,

    pub signing: SigningConfig,
}

/// Signature settings
#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    /// Key id and hex seed of this node's signing key
    pub signing_key: Option<(String, String)>,

    /// Key id and hex public key of trusted peers
    pub trusted_keys: Vec<(String, String)>,

    pub require_request_signatures: bool,
    pub require_response_signatures: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("hop-node"),
            default_verdict: Verdict::Forward,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            routes: HashMap::new(),
            default_route: None,
            signing: SigningConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_default_verdict(mut self, verdict: Verdict) -> Self {
        self.default_verdict = verdict;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send traffic for `destination` through neighbour `via`
    pub fn with_route(mut self, destination: impl Into<NodeId>, via: impl Into<NodeId>) -> Self {
        self.routes.insert(destination.into(), via.into());
        self
    }

    pub fn with_default_route(mut self, via: impl Into<NodeId>) -> Self {
        self.default_route = Some(via.into());
        self
    }

    pub fn with_signing_key(
        mut self,
        key_id: impl Into<String>,
        seed_hex: impl Into<String>,
    ) -> Self {
        self.signing.signing_key = Some((key_id.into(), seed_hex.into()));
        self
    }

    pub fn with_trusted_key(
        mut self,
        key_id: impl Into<String>,
        public_hex: impl Into<String>,
    ) -> Self {
        self.signing.trusted_keys.push((key_id.into(), public_hex.into()));
        self
    }

    pub fn with_required_signatures(mut self, requests: bool, responses: bool) -> Self {
        self.signing.require_request_signatures = requests;
        self.signing.require_response_signatures = responses;
        self
    }

    /// Neighbour to send to for `destination`: static route, then default
    /// route, then the destination itself as a direct neighbour
    pub fn next_hop(&self, destination: &NodeId) -> NodeId {
        self.routes
            .get(destination)
            .or(self.default_route.as_ref())
            .unwrap_or(destination)
            .clone()
    }
}

impl SigningConfig {
    pub fn is_enabled(&self) -> bool {
        self.signing_key.is_some()
            || !self.trusted_keys.is_empty()
            || self.require_request_signatures
            || self.require_response_signatures
    }

    /// Build the signature policy described by these settings
    pub fn build_policy(&self) -> Result<Arc<dyn SignaturePolicy>, SignatureError> {
        if !self.is_enabled() {
            return Ok(Arc::new(AcceptAll));
        }

        let mut policy = Ed25519Policy::new();
        if let Some((key_id, seed_hex)) = &self.signing_key {
            policy = policy.with_signing_seed_hex(key_id.clone(), seed_hex)?;
        }
        for (key_id, public_hex) in &self.trusted_keys {
            policy = policy.trust_hex(key_id.clone(), public_hex)?;
        }
        if self.require_request_signatures {
            policy = policy.require_request_signatures(SignatureRequirement::Always);
        }
        if self.require_response_signatures {
            policy = policy.require_response_signatures(SignatureRequirement::Always);
        }
        Ok(Arc::new(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_hop_precedence() {
        let config = NodeConfig::new("relay-a")
            .with_route("cs-1", "relay-b")
            .with_default_route("csms");

        assert_eq!(config.next_hop(&"cs-1".into()), NodeId::from("relay-b"));
        assert_eq!(config.next_hop(&"cs-9".into()), NodeId::from("csms"));

        let direct = NodeConfig::new("relay-a");
        assert_eq!(direct.next_hop(&"cs-9".into()), NodeId::from("cs-9"));
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.default_verdict, Verdict::Forward);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.signing.is_enabled());
    }

    #[test]
    fn test_bad_seed_rejected() {
        let config = NodeConfig::new("csms").with_signing_key("csms-key", "not-hex");
        assert!(config.signing.build_policy().is_err());
    }
}
