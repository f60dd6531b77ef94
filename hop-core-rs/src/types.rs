//! Core identity and routing types
//!
//! - `NodeId`: a protocol participant (station, relay, CSMS)
//! - `MessageId`: correlation token shared by a request and its single reply
//! - `HopPath`: append-only record of the nodes a message has traversed

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a protocol participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Request/reply correlation token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a newly originated request
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Errors building a hop path from wire data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Malformed hop path: {0}")]
    MalformedPath(String),
}

/// Ordered route a message has physically traversed.
///
/// The first element is the origin, the last element the most recent hop.
/// Extending a path never mutates it; `append` returns a new path so
/// concurrent forwards of one request cannot share a mutated route.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HopPath(Vec<NodeId>);

impl HopPath {
    /// Path of a message that has not left its origin yet
    pub fn origin(node: NodeId) -> Self {
        Self(vec![node])
    }

    /// Build a path received from the wire. Any message on the wire has left
    /// its origin, so an empty path is rejected.
    pub fn from_wire(nodes: Vec<NodeId>) -> Result<Self, PathError> {
        if nodes.is_empty() {
            return Err(PathError::MalformedPath("empty hop path".into()));
        }
        if let Some(blank) = nodes.iter().position(|n| n.as_str().is_empty()) {
            return Err(PathError::MalformedPath(format!(
                "empty node id at hop {}",
                blank
            )));
        }
        Ok(Self(nodes))
    }

    /// Extended copy with `node` as the most recent hop
    pub fn append(&self, node: NodeId) -> Self {
        let mut nodes = Vec::with_capacity(self.0.len() + 1);
        nodes.extend(self.0.iter().cloned());
        nodes.push(node);
        Self(nodes)
    }

    /// Destination path for a reply: the request's hops in reverse order.
    ///
    /// The replying node sends to the first element; the last element is the
    /// origin the reply is addressed to.
    pub fn reverse_for_reply(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    /// Hop following `node`, or None if `node` is last or absent
    pub fn next_after(&self, node: &NodeId) -> Option<&NodeId> {
        let idx = self.0.iter().position(|n| n == node)?;
        self.0.get(idx + 1)
    }

    pub fn origin_node(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

impl fmt::Display for HopPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(|n| n.as_str()).collect();
        write!(f, "{}", hops.join(" -> "))
    }
}
