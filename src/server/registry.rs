//! Per-room document registry
//!
//! Owns the room id → live `Document` map. Documents are created lazily on
//! first resolve, bound to persistence when an adapter is configured, and
//! torn down through `Document::dispose()` — never by removing map entries
//! directly. The map lock is a plain mutex held only for in-memory
//! mutations, never across persistence I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::broadcast;

use crate::doc::{Document, Replica};
use crate::persistence::PersistenceAdapter;

/// Lifecycle notifications for external subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A document was created and (if configured) bound to persistence.
    DocumentLoaded { room: String },
    /// The last connection for a room closed.
    AllConnectionsClosed { room: String },
    /// A document was disposed and removed from the registry.
    DocumentDestroyed { room: String },
    /// A room document changed; carries the encoded update.
    DocumentUpdate { room: String, update: Vec<u8> },
    /// A room's presence map changed; carries the encoded delta.
    AwarenessUpdate { room: String, delta: Vec<u8> },
}

/// Builds the replica capability for a new room document. Receives the room
/// id and the configured garbage-collection toggle.
pub type ReplicaFactory = Arc<dyn Fn(&str, bool) -> Box<dyn Replica> + Send + Sync>;

pub struct RegistryOptions {
    /// Garbage-collection toggle handed to the replica factory. Resolved
    /// once at construction, never re-read.
    pub gc: bool,
    pub persistence: Option<Arc<dyn PersistenceAdapter>>,
    /// Custom replica capability; defaults to the in-memory replica.
    pub replica_factory: Option<ReplicaFactory>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            gc: true,
            persistence: None,
            replica_factory: None,
        }
    }
}

pub struct DocRegistry {
    docs: Mutex<HashMap<String, Arc<Document>>>,
    gc: bool,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    replica_factory: ReplicaFactory,
    events: broadcast::Sender<RegistryEvent>,
}

impl DocRegistry {
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let replica_factory = options.replica_factory.unwrap_or_else(|| {
            Arc::new(|_room: &str, _gc: bool| {
                Box::new(crate::doc::MemoryReplica::new()) as Box<dyn Replica>
            })
        });
        Arc::new(Self {
            docs: Mutex::new(HashMap::new()),
            gc: options.gc,
            persistence: options.persistence,
            replica_factory,
            events,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Resolve the document for a room, creating it if absent. Concurrent
    /// resolves for an unseen room yield the same instance.
    pub async fn resolve(self: &Arc<Self>, room: &str) -> Arc<Document> {
        let (doc, created) = {
            let mut docs = self.docs.lock().unwrap();
            match docs.get(room) {
                Some(doc) => (doc.clone(), false),
                None => {
                    let replica = (self.replica_factory)(room, self.gc);
                    let doc = Document::with_replica(room, replica);
                    let registry = Arc::downgrade(self);
                    let room_name = room.to_string();
                    doc.on_destroy(move || {
                        if let Some(registry) = registry.upgrade() {
                            registry.unregister(&room_name);
                        }
                    });
                    // Mirror document and presence changes to external
                    // subscribers. The sender clone does not keep the
                    // registry alive.
                    let events = self.events.clone();
                    let room_name = room.to_string();
                    doc.on_update(move |update, _origin| {
                        let _ = events.send(RegistryEvent::DocumentUpdate {
                            room: room_name.clone(),
                            update: update.to_vec(),
                        });
                    });
                    let events = self.events.clone();
                    let room_name = room.to_string();
                    doc.on_presence(move |delta, _origin| {
                        let _ = events.send(RegistryEvent::AwarenessUpdate {
                            room: room_name.clone(),
                            delta: delta.to_vec(),
                        });
                    });
                    docs.insert(room.to_string(), doc.clone());
                    (doc, true)
                }
            }
        };

        if created {
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.bind(room, &doc).await {
                    warn!("[registry] persistence bind for room '{}' failed: {}", room, e);
                }
            }
            debug!("[registry] document loaded for room '{}'", room);
            let _ = self.events.send(RegistryEvent::DocumentLoaded {
                room: room.to_string(),
            });
        }

        doc
    }

    /// The document for a room, if one is live.
    pub fn get(&self, room: &str) -> Option<Arc<Document>> {
        self.docs.lock().unwrap().get(room).cloned()
    }

    /// Room ids with live documents, for external inspection. Removal must
    /// go through `Document::dispose()`.
    pub fn rooms(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    /// Invoked when a room's last connection closes.
    ///
    /// With persistence: flush, then dispose (which unregisters the
    /// document). A failed flush retains the document so the next
    /// room-emptied event retries. Without persistence the document stays
    /// resident until something external disposes it.
    pub async fn on_room_emptied(self: &Arc<Self>, room: &str) {
        let _ = self.events.send(RegistryEvent::AllConnectionsClosed {
            room: room.to_string(),
        });

        let Some(doc) = self.get(room) else { return };
        if doc.connection_count() > 0 {
            // A new connection raced in while the room was emptying.
            return;
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.flush(room, &doc).await {
                warn!(
                    "[registry] flush for room '{}' failed, retaining document: {}",
                    room, e
                );
                return;
            }
            if doc.connection_count() > 0 {
                // A connection attached while the flush was in flight. The
                // write stands; the document must stay live.
                return;
            }
            doc.dispose();
        }
    }

    fn unregister(&self, room: &str) {
        if self.docs.lock().unwrap().remove(room).is_some() {
            debug!("[registry] document destroyed for room '{}'", room);
            let _ = self.events.send(RegistryEvent::DocumentDestroyed {
                room: room.to_string(),
            });
        }
    }
}
