//! OCPP WebSocket transport
//!
//! Carries engine frames over WebSocket connections to direct neighbours.
//! Handles:
//! - Server side: accept with the OCPP subprotocol, peer id from the URL path
//! - Client side: connect to `{url}/{node_id}` with exponential backoff
//! - Connection loss reported to the node so pending requests fail fast

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hop_core::{InboundFrame, Node, NodeId, Transport, TransportError};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// OCPP 2.0.1 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Reconnect timing for outbound connections
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial reconnect delay
    pub initial_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Live WebSocket connections keyed by neighbour id
pub struct WsTransport {
    local: NodeId,
    peers: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Message>>>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
}

impl WsTransport {
    pub fn new(local: NodeId) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundFrame>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            peers: RwLock::new(HashMap::new()),
            inbound,
        });
        (transport, rx)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Accept neighbours on `addr` until the listener fails
    pub async fn listen(self: Arc<Self>, addr: SocketAddr, node: Node) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for OCPP connections on {}", addr);

        loop {
            let (stream, remote) = listener.accept().await?;
            let transport = self.clone();
            let node = node.clone();
            tokio::spawn(async move {
                match accept_peer(stream).await {
                    Ok((peer, ws)) => {
                        info!("Accepted {} from {}", peer, remote);
                        transport.run_connection(peer, ws, &node).await;
                    }
                    Err(e) => warn!("Handshake with {} failed: {}", remote, e),
                }
            });
        }
    }

    /// Keep a connection to `peer` at `url` open, reconnecting with backoff
    pub async fn connect(
        self: Arc<Self>,
        peer: NodeId,
        url: String,
        node: Node,
        policy: ReconnectPolicy,
    ) {
        let mut reconnect_delay = policy.initial_delay;

        loop {
            let endpoint = format!("{}/{}", url.trim_end_matches('/'), self.local);
            info!("Connecting to {} at {}", peer, endpoint);

            match open_client(&endpoint).await {
                Ok(ws) => {
                    reconnect_delay = policy.initial_delay;
                    self.run_connection(peer.clone(), ws, &node).await;
                    info!("Connection to {} closed", peer);
                }
                Err(e) => error!("Connection to {} failed: {}", peer, e),
            }

            // Exponential backoff
            info!("Reconnecting to {} in {:?}", peer, reconnect_delay);
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, policy.max_delay);
        }
    }

    async fn run_connection<S>(&self, peer: NodeId, ws: WebSocketStream<S>, node: &Node)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();

        if self.peers.write().insert(peer.clone(), send_tx.clone()).is_some() {
            warn!("Replacing existing connection to {}", peer);
        }

        // Spawn sender task
        let sender_peer = peer.clone();
        let sender_handle = tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    error!("Failed to send to {}: {}", sender_peer, e);
                    break;
                }
            }
        });

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!("Received from {}: {}", peer, text);
                    let bytes = text.as_bytes().to_vec();
                    if self.inbound.send((peer.clone(), bytes)).is_err() {
                        warn!("Inbound channel closed, dropping frame from {}", peer);
                    }
                }
                Ok(Message::Binary(bytes)) => {
                    if self.inbound.send((peer.clone(), bytes.to_vec())).is_err() {
                        warn!("Inbound channel closed, dropping frame from {}", peer);
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("{} closed the connection: {:?}", peer, frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from {}: {}", peer, e);
                    break;
                }
            }
        }

        {
            let mut peers = self.peers.write();
            if peers.get(&peer).is_some_and(|tx| tx.same_channel(&send_tx)) {
                peers.remove(&peer);
            }
        }
        sender_handle.abort();
        node.on_connection_lost(&peer);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, to: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .peers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;

        let text = String::from_utf8(bytes).map_err(|e| TransportError::Io(e.to_string()))?;
        debug!("Sending to {}: {}", to, text);
        peer.send(Message::Text(text.into()))
            .map_err(|_| TransportError::ConnectionClosed(to.clone()))
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 * 1024),
        max_frame_size: Some(16 * 1024),
        ..Default::default()
    }
}

/// Server handshake; the last URL path segment names the peer
async fn accept_peer(stream: TcpStream) -> Result<(NodeId, WebSocketStream<TcpStream>), String> {
    let mut requested_path = String::new();
    let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        requested_path = req.uri().path().to_string();

        let offers_ocpp = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL));
        if offers_ocpp {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(OCPP_SUBPROTOCOL),
            );
        }
        Ok(response)
    };

    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| e.to_string())?;

    let peer = requested_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .ok_or_else(|| "connection URL does not name a node".to_string())?;
    Ok((NodeId::from(peer), ws))
}

async fn open_client(
    endpoint: &str,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, String> {
    let mut request = endpoint.into_client_request().map_err(|e| e.to_string())?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );

    let (ws, response) = connect_async_with_config(request, Some(ws_config()), false)
        .await
        .map_err(|e| e.to_string())?;

    // Verify subprotocol
    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "Peer did not accept OCPP 2.0.1 subprotocol, got: {:?}",
            accepted_protocol
        );
    }
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_connection() {
        let (transport, _rx) = WsTransport::new("relay-a".into());
        let err = transport.send(&"csms".into(), b"[]".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::NotConnected("csms".into()));
        assert!(transport.connected_peers().is_empty());
    }

    #[test]
    fn test_default_reconnect_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
    }
}
