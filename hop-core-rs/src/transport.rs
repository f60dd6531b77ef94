//! Transport seam
//!
//! The engine only needs "send these bytes to that neighbour". Inbound bytes
//! are fed to `Node::on_frame_received` by whoever owns the connections.
//! `MemoryHub` wires nodes together in-process for tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::NodeId;

/// Frame received from a neighbour
pub type InboundFrame = (NodeId, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No connection to {0}")]
    NotConnected(NodeId),

    #[error("Connection to {0} closed")]
    ConnectionClosed(NodeId),

    #[error("Send failed: {0}")]
    Io(String),
}

/// Byte transport towards directly connected neighbours
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process switchboard connecting nodes by id
#[derive(Default)]
pub struct MemoryHub {
    peers: RwLock<HashMap<NodeId, mpsc::UnboundedSender<InboundFrame>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node`, returning its transport and inbound frame stream
    pub fn join(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<InboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().insert(node.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            local: node,
            hub: self.clone(),
        });
        (transport, rx)
    }

    /// Detach `node`; later sends to it fail
    pub fn leave(&self, node: &NodeId) {
        self.peers.write().remove(node);
    }

    pub fn is_joined(&self, node: &NodeId) -> bool {
        self.peers.read().contains_key(node)
    }
}

pub struct MemoryTransport {
    local: NodeId,
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn local(&self) -> &NodeId {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .hub
            .peers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;

        peer.send((self.local.clone(), bytes))
            .map_err(|_| TransportError::ConnectionClosed(to.clone()))
    }
}
