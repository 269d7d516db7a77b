//! Client sync provider
//!
//! A `SyncProvider` keeps one document and its presence in lockstep with a
//! server over a network transport, while cooperating with co-located
//! providers over the local broadcast relay. It survives disconnect and
//! reconnect cycles: each connection gets a fresh generation, and a sync
//! acknowledgment arriving for a stale generation is discarded.

pub mod relay;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::doc::{next_endpoint_id, Document, Origin};
use crate::error::SyncError;
use crate::protocol::{relay_channel, room_namespace, Message, RelayFrame, RelayMessage};
use crate::transport::{Handshake, Transport};
pub use relay::LocalBus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the host application.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    StatusChanged(ConnectionStatus),
    /// The synced flag flipped. True only after a completed state-vector
    /// round-trip with the server.
    SyncedChanged(bool),
    ConnectionError(String),
    ConnectionClosed(String),
}

/// Host hook registration for terminal cleanup (page unload, process exit).
/// The provider hands the registrar a closure that tombstones this client's
/// presence entry; `destroy()` disarms it.
pub type CleanupRegistrar = Box<dyn FnOnce(Box<dyn Fn() + Send + Sync>) + Send>;

pub struct ProviderConfig {
    /// Connect as soon as the provider is created.
    pub auto_connect: bool,
    /// Periodically re-issue a sync request while connected; `None`
    /// disables the timer.
    pub resync_interval: Option<Duration>,
    /// The local broadcast relay medium; `None` disables the relay.
    pub local_relay: Option<Arc<LocalBus>>,
    /// Auth payload passed in the connection handshake.
    pub auth: Value,
    pub cleanup: Option<CleanupRegistrar>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            resync_interval: None,
            local_relay: None,
            auth: Value::Null,
            cleanup: None,
        }
    }
}

struct ActiveConnection {
    outgoing: mpsc::UnboundedSender<Message>,
    generation: u64,
}

struct RelayHandle {
    task: JoinHandle<()>,
}

struct ProviderInner {
    url: String,
    room: String,
    relay_channel: String,
    /// Origin marker for everything this provider applies, and its sender
    /// tag on the local relay.
    endpoint: u64,
    doc: Arc<Document>,
    transport: Arc<dyn Transport>,
    bus: Option<Arc<LocalBus>>,
    auth: Value,
    resync_interval: Option<Duration>,
    generation: AtomicU64,
    status: Mutex<ConnectionStatus>,
    synced: AtomicBool,
    events: broadcast::Sender<ProviderEvent>,
    conn: Mutex<Option<ActiveConnection>>,
    relay: Mutex<Option<RelayHandle>>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
    doc_subs: Mutex<Vec<Uuid>>,
    cleanup_armed: Arc<AtomicBool>,
    destroyed: AtomicBool,
}

pub struct SyncProvider {
    inner: Arc<ProviderInner>,
}

impl SyncProvider {
    /// Create a provider for one document. Must be called inside a tokio
    /// runtime; with `auto_connect` the first connection attempt is spawned
    /// immediately.
    pub fn new(
        url: impl Into<String>,
        room: impl Into<String>,
        doc: Arc<Document>,
        transport: Arc<dyn Transport>,
        config: ProviderConfig,
    ) -> Self {
        let url = url.into();
        let room = room.into();
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(ProviderInner {
            relay_channel: relay_channel(&url, &room),
            url,
            room,
            endpoint: next_endpoint_id(),
            doc: doc.clone(),
            transport,
            bus: config.local_relay,
            auth: config.auth,
            resync_interval: config.resync_interval,
            generation: AtomicU64::new(0),
            status: Mutex::new(ConnectionStatus::Disconnected),
            synced: AtomicBool::new(false),
            events,
            conn: Mutex::new(None),
            relay: Mutex::new(None),
            resync_task: Mutex::new(None),
            doc_subs: Mutex::new(Vec::new()),
            cleanup_armed: Arc::new(AtomicBool::new(true)),
            destroyed: AtomicBool::new(false),
        });

        // Forward local document changes. Changes this provider applied
        // itself carry its endpoint origin and were already relayed.
        let weak = Arc::downgrade(&inner);
        let update_sub = doc.on_update(move |update, origin| {
            if let Some(inner) = weak.upgrade() {
                if origin != Origin::Endpoint(inner.endpoint) {
                    inner.send_message(Message::Update {
                        diff: update.to_vec(),
                    });
                    inner.relay_publish(RelayMessage::SyncUpdate {
                        diff: update.to_vec(),
                    });
                }
            }
        });

        // Presence deltas are forwarded regardless of origin.
        let weak = Arc::downgrade(&inner);
        let presence_sub = doc.on_presence(move |delta, _origin| {
            if let Some(inner) = weak.upgrade() {
                inner.send_message(Message::AwarenessUpdate {
                    delta: delta.to_vec(),
                });
                inner.relay_publish(RelayMessage::AwarenessUpdate {
                    delta: delta.to_vec(),
                });
            }
        });

        *inner.doc_subs.lock().unwrap() = vec![update_sub, presence_sub];

        if let Some(registrar) = config.cleanup {
            let armed = inner.cleanup_armed.clone();
            let doc = Arc::downgrade(&doc);
            registrar(Box::new(move || {
                if armed.load(Ordering::SeqCst) {
                    if let Some(doc) = doc.upgrade() {
                        doc.set_presence(None);
                    }
                }
            }));
        }

        let provider = Self { inner };
        if config.auto_connect {
            let inner = provider.inner.clone();
            tokio::spawn(async move {
                let _ = inner.connect().await;
            });
        }
        provider
    }

    pub fn doc(&self) -> &Arc<Document> {
        &self.inner.doc
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    /// Name of the local relay channel this provider uses.
    pub fn relay_channel_name(&self) -> &str {
        &self.inner.relay_channel
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    /// Open the network transport. No-op when already connected or
    /// connecting. The local relay is joined on the attempt, independent of
    /// transport success, so a provider without a live network link still
    /// converges through co-located peers.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.inner.connect().await
    }

    /// Close the transport if connected: relay teardown first (publishing a
    /// presence removal for this client), then the link. Other participants'
    /// presence entries are dropped locally — their liveness is unknown
    /// until resynchronized.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Tear the provider down on every exit path: tombstone the local
    /// presence entry, stop the resync timer, disconnect, disarm the
    /// terminal-cleanup hook, and detach the document listeners.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl ProviderInner {
    async fn connect(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("provider destroyed".into()));
        }
        {
            let mut status = self.status.lock().unwrap();
            match *status {
                ConnectionStatus::Connected | ConnectionStatus::Connecting => return Ok(()),
                ConnectionStatus::Disconnected => *status = ConnectionStatus::Connecting,
            }
        }
        self.emit(ProviderEvent::StatusChanged(ConnectionStatus::Connecting));
        self.set_synced(false);
        self.connect_relay();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handshake = Handshake {
            namespace: room_namespace(&self.room),
            auth: self.auth.clone(),
        };

        let link = match self.transport.connect(handshake).await {
            Ok(link) => link,
            Err(e) => {
                self.emit(ProviderEvent::ConnectionError(e.to_string()));
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        tokio::spawn(read_loop(Arc::downgrade(self), generation, link.incoming));
        *self.conn.lock().unwrap() = Some(ActiveConnection {
            outgoing: link.outgoing.clone(),
            generation,
        });
        self.set_status(ConnectionStatus::Connected);
        debug!(
            "[provider {}] connected to '{}' (generation {})",
            self.endpoint, self.room, generation
        );

        let _ = link.outgoing.send(Message::SyncRequest {
            state_vector: self.doc.state_vector(),
        });
        if self.doc.local_presence().is_some() {
            let _ = link.outgoing.send(Message::AwarenessUpdate {
                delta: self.doc.local_presence_update(),
            });
        }
        self.start_resync();
        Ok(())
    }

    fn disconnect(self: &Arc<Self>) {
        let conn = self.conn.lock().unwrap().take();
        let Some(conn) = conn else { return };
        self.disconnect_relay();
        // Invalidate the link's generation. The read task drains on its own;
        // anything still in flight is discarded as stale.
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(conn.outgoing);
        self.after_disconnect("client disconnect");
    }

    fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Tombstone while the link and listeners are still live so the
        // removal propagates.
        self.doc.set_presence(None);

        if let Some(task) = self.resync_task.lock().unwrap().take() {
            task.abort();
        }
        self.disconnect();
        self.disconnect_relay();
        self.cleanup_armed.store(false, Ordering::SeqCst);

        let subs: Vec<Uuid> = self.doc_subs.lock().unwrap().drain(..).collect();
        if let [update_sub, presence_sub] = subs[..] {
            self.doc.off_update(update_sub);
            self.doc.off_presence(presence_sub);
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::SyncRequest { state_vector } => {
                match self.doc.diff_since(&state_vector) {
                    Ok(diff) => {
                        self.send_message(Message::SyncReply { diff });
                        self.set_synced(true);
                    }
                    Err(e) => warn!("[provider {}] bad sync request: {}", self.endpoint, e),
                }
            }
            Message::SyncReply { diff } => {
                if let Err(e) = self.doc.apply_update(&diff, Origin::Endpoint(self.endpoint)) {
                    warn!("[provider {}] dropped malformed sync reply: {}", self.endpoint, e);
                } else {
                    self.set_synced(true);
                }
            }
            Message::Update { diff } => {
                if let Err(e) = self.doc.apply_update(&diff, Origin::Endpoint(self.endpoint)) {
                    warn!("[provider {}] dropped malformed update: {}", self.endpoint, e);
                }
            }
            Message::AwarenessUpdate { delta } => {
                if let Err(e) = self
                    .doc
                    .apply_presence(&delta, Origin::Endpoint(self.endpoint))
                {
                    warn!("[provider {}] dropped malformed presence: {}", self.endpoint, e);
                }
            }
        }
    }

    /// The transport closed underneath us. Only acts if the closed link is
    /// still the current one.
    fn handle_remote_close(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut conn = self.conn.lock().unwrap();
            match conn.as_ref() {
                Some(active) if active.generation == generation => {
                    conn.take();
                }
                _ => return,
            }
        }
        self.after_disconnect(reason);
    }

    fn after_disconnect(self: &Arc<Self>, reason: &str) {
        self.set_synced(false);
        self.doc
            .remove_other_presence(Origin::Endpoint(self.endpoint));
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(ProviderEvent::ConnectionClosed(reason.to_string()));
        debug!(
            "[provider {}] disconnected from '{}': {}",
            self.endpoint, self.room, reason
        );
    }

    fn send_message(&self, message: Message) {
        if let Some(conn) = self.conn.lock().unwrap().as_ref() {
            let _ = conn.outgoing.send(message);
        }
    }

    // ---- local relay ------------------------------------------------------

    /// Join the relay and run the four-message handshake: state vector,
    /// full state, presence query, own presence. Any already-joined peer
    /// catches the newcomer up, and vice versa, without the network.
    fn connect_relay(self: &Arc<Self>) {
        let Some(bus) = &self.bus else { return };
        {
            let mut relay = self.relay.lock().unwrap();
            if relay.is_some() {
                return;
            }
            let rx = bus.subscribe(&self.relay_channel);
            let task = tokio::spawn(relay_loop(Arc::downgrade(self), rx));
            *relay = Some(RelayHandle { task });
        }
        self.relay_publish(RelayMessage::SyncStep1 {
            state_vector: self.doc.state_vector(),
        });
        self.relay_publish(RelayMessage::SyncStep2 {
            diff: self.doc.snapshot(),
        });
        self.relay_publish(RelayMessage::QueryAwareness);
        self.relay_publish(RelayMessage::AwarenessUpdate {
            delta: self.doc.local_presence_update(),
        });
    }

    /// Leave the relay: publish a removal for this client first, then stop
    /// listening.
    fn disconnect_relay(self: &Arc<Self>) {
        let handle = self.relay.lock().unwrap().take();
        let Some(handle) = handle else { return };
        if let Some(bus) = &self.bus {
            bus.publish(
                &self.relay_channel,
                RelayFrame {
                    sender: self.endpoint,
                    message: RelayMessage::AwarenessUpdate {
                        delta: self.doc.local_presence_tombstone(),
                    },
                },
            );
        }
        handle.task.abort();
    }

    fn relay_publish(&self, message: RelayMessage) {
        if self.relay.lock().unwrap().is_none() {
            return;
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                &self.relay_channel,
                RelayFrame {
                    sender: self.endpoint,
                    message,
                },
            );
        }
    }

    fn handle_relay(self: &Arc<Self>, message: RelayMessage) {
        match message {
            RelayMessage::SyncStep1 { state_vector } => {
                match self.doc.diff_since(&state_vector) {
                    Ok(diff) => self.relay_publish(RelayMessage::SyncStep2 { diff }),
                    Err(e) => warn!("[provider {}] bad relay sync step: {}", self.endpoint, e),
                }
            }
            RelayMessage::SyncStep2 { diff } | RelayMessage::SyncUpdate { diff } => {
                if let Err(e) = self.doc.apply_update(&diff, Origin::Endpoint(self.endpoint)) {
                    warn!("[provider {}] dropped malformed relay update: {}", self.endpoint, e);
                }
            }
            RelayMessage::QueryAwareness => {
                self.relay_publish(RelayMessage::AwarenessUpdate {
                    delta: self.doc.presence_snapshot(),
                });
            }
            RelayMessage::AwarenessUpdate { delta } => {
                if let Err(e) = self
                    .doc
                    .apply_presence(&delta, Origin::Endpoint(self.endpoint))
                {
                    warn!("[provider {}] dropped malformed relay presence: {}", self.endpoint, e);
                }
            }
        }
    }

    // ---- timers and state flags -------------------------------------------

    /// Start the periodic resync timer once per provider. Each tick, while
    /// connected, re-sends a sync request — self-healing against missed
    /// pushes.
    fn start_resync(self: &Arc<Self>) {
        let Some(interval) = self.resync_interval else { return };
        let mut task = self.resync_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if *inner.status.lock().unwrap() == ConnectionStatus::Connected {
                    inner.send_message(Message::SyncRequest {
                        state_vector: inner.doc.state_vector(),
                    });
                }
            }
        }));
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock().unwrap();
            if *current == status {
                return;
            }
            *current = status;
        }
        self.emit(ProviderEvent::StatusChanged(status));
    }

    fn set_synced(&self, synced: bool) {
        if self.synced.swap(synced, Ordering::SeqCst) != synced {
            self.emit(ProviderEvent::SyncedChanged(synced));
        }
    }

    fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }
}

async fn read_loop(
    weak: Weak<ProviderInner>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = incoming.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        // A message surfacing after a disconnect or reconnect belongs to a
        // dead link and must not touch the document.
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        inner.handle_message(message);
    }
    if let Some(inner) = weak.upgrade() {
        inner.handle_remote_close(generation, "transport closed");
    }
}

async fn relay_loop(weak: Weak<ProviderInner>, mut rx: broadcast::Receiver<RelayFrame>) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                let Some(inner) = weak.upgrade() else { return };
                if frame.sender == inner.endpoint {
                    continue;
                }
                inner.handle_relay(frame.message);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
