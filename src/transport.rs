//! Message transport seam
//!
//! The core does not implement framing, delivery, or reconnection; it talks
//! to a `Transport` that yields a pair of message channels per connection.
//! Link open is a successful `connect`, link close is the incoming channel
//! ending, link error is a failed `connect`. `LoopbackTransport` couples a
//! provider directly to an in-process server, for tests and demos.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::protocol::Message;
use crate::server::CollabServer;

/// Connection handshake: the namespace path addressing a room, plus an
/// arbitrary auth payload for the server's authentication hook.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub namespace: String,
    pub auth: Value,
}

/// One live connection: a sender towards the peer and a receiver from it.
/// Dropping `outgoing` closes the connection; `incoming` ending means the
/// peer closed it.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<Message>,
    pub incoming: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection. An authentication refusal or unreachable server
    /// surfaces here as an error; the core performs no retry.
    async fn connect(&self, handshake: Handshake) -> Result<TransportLink, SyncError>;
}

/// In-process transport that connects straight to a `CollabServer`.
pub struct LoopbackTransport {
    server: Arc<CollabServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<CollabServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, handshake: Handshake) -> Result<TransportLink, SyncError> {
        self.server.open_connection(handshake).await
    }
}
