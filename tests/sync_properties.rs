// Roomsync - Collaborative Document Sync Relay
//
// End-to-end properties: convergence through the server, presence
// propagation, relay-only convergence for providers without a network
// link, resync self-healing, the auth gate, and room lifecycle with and
// without persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use roomsync::protocol::Message;

use roomsync::persistence::FilePersistence;
use roomsync::provider::relay::LocalBus;
use roomsync::{
    Authenticator, CollabServer, ConnectionStatus, Document, Handshake, LoopbackTransport,
    ProviderConfig, ServerConfig, SyncError, SyncProvider, Transport, TransportLink,
};

// ---- Helpers ----

fn manual_config() -> ProviderConfig {
    ProviderConfig {
        auto_connect: false,
        ..Default::default()
    }
}

fn provider(
    transport: Arc<dyn Transport>,
    room: &str,
    config: ProviderConfig,
) -> SyncProvider {
    SyncProvider::new(
        "ws://localhost:1234",
        room,
        Document::new(room),
        transport,
        config,
    )
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_converged(a: &SyncProvider, b: &SyncProvider) {
    wait_for(
        || a.doc().state_hash() == b.doc().state_hash(),
        "documents to converge",
    )
    .await;
}

/// A transport whose connections never come up.
struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn connect(&self, _handshake: Handshake) -> Result<TransportLink, SyncError> {
        Err(SyncError::Transport("no route to server".into()))
    }
}

/// Wraps a transport and silently drops server-to-client push updates,
/// leaving sync requests and replies intact. Models a lossy link the
/// resync timer must heal.
struct UpdateDroppingTransport {
    inner: Arc<dyn Transport>,
}

#[async_trait]
impl Transport for UpdateDroppingTransport {
    async fn connect(&self, handshake: Handshake) -> Result<TransportLink, SyncError> {
        let mut link = self.inner.connect(handshake).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = link.incoming.recv().await {
                if matches!(message, Message::Update { .. }) {
                    continue;
                }
                if tx.send(message).is_err() {
                    return;
                }
            }
        });
        Ok(TransportLink {
            outgoing: link.outgoing,
            incoming: rx,
        })
    }
}

/// Wraps a transport and diverts the first sync reply off the link,
/// delivering it only when `release` is called — models a reply that was
/// still in flight when the connection went down.
struct HoldingTransport {
    inner: Arc<dyn Transport>,
    held: Arc<Mutex<Option<(mpsc::UnboundedSender<Message>, Message)>>>,
    armed: Arc<AtomicBool>,
}

impl HoldingTransport {
    fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            held: Arc::new(Mutex::new(None)),
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Deliver the held reply on the link it was diverted from.
    fn release(&self) {
        if let Some((tx, message)) = self.held.lock().unwrap().take() {
            let _ = tx.send(message);
        }
    }
}

#[async_trait]
impl Transport for HoldingTransport {
    async fn connect(&self, handshake: Handshake) -> Result<TransportLink, SyncError> {
        let mut link = self.inner.connect(handshake).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let held = self.held.clone();
        let armed = self.armed.clone();
        let reinject = tx.clone();
        tokio::spawn(async move {
            while let Some(message) = link.incoming.recv().await {
                if matches!(message, Message::SyncReply { .. })
                    && armed.swap(false, Ordering::SeqCst)
                {
                    *held.lock().unwrap() = Some((reinject.clone(), message));
                    continue;
                }
                if tx.send(message).is_err() {
                    return;
                }
            }
        });
        Ok(TransportLink {
            outgoing: link.outgoing,
            incoming: rx,
        })
    }
}

/// Accepts only handshakes carrying the expected token.
struct TokenGate {
    token: String,
}

#[async_trait]
impl Authenticator for TokenGate {
    async fn authenticate(&self, handshake: &Handshake) -> bool {
        handshake.auth.get("token").and_then(|t| t.as_str()) == Some(self.token.as_str())
    }
}

// ---- Convergence through the server ----

#[tokio::test]
async fn test_two_providers_converge_in_both_directions() {
    let server = CollabServer::new(ServerConfig::default());
    let transport = LoopbackTransport::new(server);

    let a = provider(transport.clone(), "room", manual_config());
    let b = provider(transport, "room", manual_config());
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.doc().write(b"from a".to_vec());
    b.doc().write(b"from b".to_vec());

    wait_converged(&a, &b).await;
    assert!(a.synced());
    assert!(b.synced());
}

#[tokio::test]
async fn test_late_joiner_receives_prior_state() {
    let server = CollabServer::new(ServerConfig::default());
    let transport = LoopbackTransport::new(server);

    let a = provider(transport.clone(), "room", manual_config());
    a.connect().await.unwrap();
    a.doc().write(b"early edit".to_vec());
    wait_for(|| a.synced(), "first provider to sync").await;

    let b = provider(transport, "room", manual_config());
    b.connect().await.unwrap();
    wait_converged(&a, &b).await;
}

// ---- Presence ----

#[tokio::test]
async fn test_presence_propagates_and_departure_tombstones() {
    let server = CollabServer::new(ServerConfig::default());
    let transport = LoopbackTransport::new(server);

    let a = provider(transport.clone(), "room", manual_config());
    let b = provider(transport, "room", manual_config());
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.doc().set_presence(Some(json!({"cursor": 3})));
    let a_id = a.doc().client_id();
    wait_for(
        || b.doc().presence_states().contains_key(&a_id),
        "presence to reach the peer",
    )
    .await;

    // A leaving tombstones its entry everywhere.
    a.destroy();
    wait_for(
        || !b.doc().presence_states().contains_key(&a_id),
        "departure tombstone to reach the peer",
    )
    .await;
}

// ---- Local relay ----

#[tokio::test]
async fn test_offline_provider_converges_through_local_relay() {
    let server = CollabServer::new(ServerConfig::default());
    let bus = LocalBus::new();

    let online = provider(
        LoopbackTransport::new(server),
        "room",
        ProviderConfig {
            auto_connect: false,
            local_relay: Some(bus.clone()),
            ..Default::default()
        },
    );
    online.connect().await.unwrap();
    online.doc().write(b"shared state".to_vec());

    // The second provider never reaches the server, but its connection
    // attempt joins the relay.
    let offline = provider(
        Arc::new(OfflineTransport),
        "room",
        ProviderConfig {
            auto_connect: false,
            local_relay: Some(bus),
            ..Default::default()
        },
    );
    assert!(offline.connect().await.is_err());
    assert_eq!(offline.status(), ConnectionStatus::Disconnected);

    wait_converged(&online, &offline).await;

    // Edits flow the other way too.
    offline.doc().write(b"offline edit".to_vec());
    wait_converged(&online, &offline).await;
}

#[tokio::test]
async fn test_relay_carries_presence_between_co_located_providers() {
    let bus = LocalBus::new();
    let config = || ProviderConfig {
        auto_connect: false,
        local_relay: Some(bus.clone()),
        ..Default::default()
    };

    let a = provider(Arc::new(OfflineTransport), "room", config());
    let b = provider(Arc::new(OfflineTransport), "room", config());
    let _ = a.connect().await;
    a.doc().set_presence(Some(json!({"name": "a"})));
    let _ = b.connect().await;

    // B's relay handshake queries presence; A answers with its snapshot.
    let a_id = a.doc().client_id();
    wait_for(
        || b.doc().presence_states().contains_key(&a_id),
        "relay presence exchange",
    )
    .await;
}

// ---- Resync self-healing ----

#[tokio::test]
async fn test_resync_timer_heals_missed_pushes() {
    let server = CollabServer::new(ServerConfig::default());
    let lossy = Arc::new(UpdateDroppingTransport {
        inner: LoopbackTransport::new(server.clone()),
    });

    let a = provider(LoopbackTransport::new(server), "room", manual_config());
    let b = provider(
        lossy,
        "room",
        ProviderConfig {
            auto_connect: false,
            resync_interval: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    wait_for(|| b.synced(), "initial sync").await;

    // The push for this edit is dropped on B's link; only the periodic
    // sync request can recover it.
    a.doc().write(b"missed push".to_vec());
    wait_converged(&a, &b).await;
}

#[tokio::test]
async fn test_stale_sync_reply_after_disconnect_is_discarded() {
    let server = CollabServer::new(ServerConfig::default());

    let a = provider(
        LoopbackTransport::new(server.clone()),
        "room",
        manual_config(),
    );
    a.connect().await.unwrap();
    a.doc().write(b"missing edit".to_vec());
    let server_doc = server.registry().get("room").unwrap();
    wait_for(
        || server_doc.state_hash() == a.doc().state_hash(),
        "server to apply the edit",
    )
    .await;

    let holding = Arc::new(HoldingTransport::new(LoopbackTransport::new(server)));
    let b = provider(holding.clone(), "room", manual_config());
    b.connect().await.unwrap();
    // B serves the server's sync request and reports synced, but the
    // server's reply carrying A's edit was diverted off the link.
    wait_for(|| b.synced(), "initial handshake").await;
    let before = b.doc().state_hash();
    assert_ne!(before, a.doc().state_hash());

    b.disconnect();
    assert!(!b.synced());

    // The diverted reply now lands on the dead link and must be dropped.
    holding.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.doc().state_hash(), before);
    assert!(!b.synced());

    // A fresh connection recovers the state legitimately.
    b.connect().await.unwrap();
    wait_converged(&a, &b).await;
}

// ---- Auth gate ----

#[tokio::test]
async fn test_auth_gate_end_to_end() {
    let server = CollabServer::new(ServerConfig {
        authenticator: Arc::new(TokenGate {
            token: "sesame".into(),
        }),
        ..Default::default()
    });
    let transport = LoopbackTransport::new(server.clone());

    let intruder = provider(
        transport.clone(),
        "room",
        ProviderConfig {
            auto_connect: false,
            auth: json!({"token": "guess"}),
            ..Default::default()
        },
    );
    assert!(matches!(
        intruder.connect().await,
        Err(SyncError::Unauthorized)
    ));
    assert_eq!(intruder.status(), ConnectionStatus::Disconnected);
    assert!(server.registry().rooms().is_empty());

    let member = provider(
        transport,
        "room",
        ProviderConfig {
            auto_connect: false,
            auth: json!({"token": "sesame"}),
            ..Default::default()
        },
    );
    member.connect().await.unwrap();
    wait_for(|| member.synced(), "authorized client to sync").await;
}

// ---- Room lifecycle ----

#[tokio::test]
async fn test_room_emptied_with_persistence_flushes_and_destroys() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(FilePersistence::new(dir.path()).unwrap());
    let server = CollabServer::new(ServerConfig {
        persistence: Some(persistence.clone()),
        ..Default::default()
    });
    let transport = LoopbackTransport::new(server.clone());

    let p = provider(transport, "room", manual_config());
    p.connect().await.unwrap();
    p.doc().write(b"durable edit".to_vec());
    let server_doc = server.registry().get("room").unwrap();
    wait_for(
        || server_doc.state_hash() == p.doc().state_hash(),
        "server to apply the edit",
    )
    .await;
    let snapshot = server_doc.snapshot();

    p.disconnect();
    wait_for(
        || server.registry().get("room").is_none(),
        "room document to be destroyed",
    )
    .await;

    let stored = std::fs::read(persistence.room_path("room")).unwrap();
    assert_eq!(stored, snapshot);
}

#[tokio::test]
async fn test_persisted_room_state_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || ServerConfig {
        persistence: Some(Arc::new(FilePersistence::new(dir.path()).unwrap())),
        ..Default::default()
    };

    let server = CollabServer::new(config());
    let p = provider(LoopbackTransport::new(server.clone()), "room", manual_config());
    p.connect().await.unwrap();
    p.doc().write(b"before restart".to_vec());
    let expected = p.doc().state_hash();
    let server_doc = server.registry().get("room").unwrap();
    wait_for(
        || server_doc.state_hash() == expected,
        "server to apply the edit",
    )
    .await;
    drop(server_doc);
    p.disconnect();
    wait_for(|| server.registry().get("room").is_none(), "shutdown flush").await;

    let server = CollabServer::new(config());
    let q = provider(LoopbackTransport::new(server), "room", manual_config());
    q.connect().await.unwrap();
    wait_for(
        || q.doc().state_hash() == expected,
        "restored state to reach the new client",
    )
    .await;
}

#[tokio::test]
async fn test_room_emptied_without_persistence_retains_document() {
    let server = CollabServer::new(ServerConfig::default());
    let transport = LoopbackTransport::new(server.clone());

    let p = provider(transport, "room", manual_config());
    p.connect().await.unwrap();
    wait_for(|| p.synced(), "provider to sync").await;
    p.disconnect();

    wait_for(
        || server.registry().get("room").map(|d| d.connection_count()) == Some(0),
        "session to close",
    )
    .await;
    assert!(server.registry().get("room").is_some());
}
