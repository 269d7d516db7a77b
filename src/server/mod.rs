//! Server side of the sync relay
//!
//! `CollabServer` is the front door: it gates every connection through the
//! authentication hook, maps the namespace path to a room, resolves the
//! room's document through the registry, and attaches a `Session` that
//! pumps the connection's messages.

pub mod registry;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::persistence::PersistenceAdapter;
use crate::protocol::room_from_namespace;
use crate::transport::{Handshake, TransportLink};
pub use registry::{DocRegistry, RegistryEvent, RegistryOptions, ReplicaFactory};
pub use session::Session;

/// Connection gate. Returning false refuses the connection before any
/// document is touched.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, handshake: &Handshake) -> bool;
}

/// Default authenticator: every connection is accepted.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _handshake: &Handshake) -> bool {
        true
    }
}

pub struct ServerConfig {
    /// Garbage-collection toggle for replicated state, threaded to the
    /// registry's replica factory.
    pub gc: bool,
    pub persistence: Option<Arc<dyn PersistenceAdapter>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub replica_factory: Option<ReplicaFactory>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gc: true,
            persistence: None,
            authenticator: Arc::new(AllowAll),
            replica_factory: None,
        }
    }
}

pub struct CollabServer {
    registry: Arc<DocRegistry>,
    authenticator: Arc<dyn Authenticator>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let registry = DocRegistry::new(RegistryOptions {
            gc: config.gc,
            persistence: config.persistence,
            replica_factory: config.replica_factory,
        });
        Arc::new(Self {
            registry,
            authenticator: config.authenticator,
        })
    }

    pub fn registry(&self) -> &Arc<DocRegistry> {
        &self.registry
    }

    /// Accept one connection: authenticate, resolve the room document,
    /// attach a session, and return the client's end of the link.
    pub async fn open_connection(&self, handshake: Handshake) -> Result<TransportLink, SyncError> {
        if !self.authenticator.authenticate(&handshake).await {
            debug!("[server] refused connection to '{}'", handshake.namespace);
            return Err(SyncError::Unauthorized);
        }

        let room = room_from_namespace(&handshake.namespace)
            .ok_or_else(|| {
                SyncError::Protocol(format!("unrecognized namespace: {}", handshake.namespace))
            })?
            .to_string();

        let doc = self.registry.resolve(&room).await;

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel();
        let session = Session::attach(self.registry.clone(), room, doc, to_client_tx);

        tokio::spawn(async move {
            while let Some(message) = from_client_rx.recv().await {
                session.handle_message(message);
            }
            session.close().await;
        });

        Ok(TransportLink {
            outgoing: from_client_tx,
            incoming: to_client_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::room_namespace;
    use serde_json::json;

    struct DenyAll;

    #[async_trait]
    impl Authenticator for DenyAll {
        async fn authenticate(&self, _handshake: &Handshake) -> bool {
            false
        }
    }

    fn handshake(room: &str) -> Handshake {
        Handshake {
            namespace: room_namespace(room),
            auth: json!({}),
        }
    }

    #[tokio::test]
    async fn test_rejected_auth_touches_no_document() {
        let server = CollabServer::new(ServerConfig {
            authenticator: Arc::new(DenyAll),
            ..Default::default()
        });

        let result = server.open_connection(handshake("private")).await;
        assert!(matches!(result, Err(SyncError::Unauthorized)));
        assert!(server.registry().rooms().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_namespace_is_refused() {
        let server = CollabServer::new(ServerConfig::default());
        let result = server
            .open_connection(Handshake {
                namespace: "/chat|general".into(),
                auth: json!({}),
            })
            .await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert!(server.registry().rooms().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_connection_creates_room_document() {
        let server = CollabServer::new(ServerConfig::default());
        let _link = server.open_connection(handshake("r1")).await.unwrap();
        assert_eq!(server.registry().rooms(), vec!["r1".to_string()]);
    }
}
