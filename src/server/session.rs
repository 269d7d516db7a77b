//! Per-connection sync sessions
//!
//! One `Session` per (connection, document). It relays protocol messages
//! between its connection and the room document: serving sync requests,
//! applying inbound updates tagged with its own endpoint id (so the
//! document broadcast can skip echoing them back), and forwarding document
//! and presence changes to its connection. No retries, no buffering beyond
//! the connection's outbound queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::doc::{next_endpoint_id, ClientId, Document, Origin};
use crate::protocol::Message;
use crate::server::registry::DocRegistry;

pub struct Session {
    id: u64,
    room: String,
    doc: Arc<Document>,
    registry: Arc<DocRegistry>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Presence client ids this connection has spoken for; tombstoned when
    /// the connection closes.
    controlled: Mutex<HashSet<ClientId>>,
    subs: Mutex<Vec<(SubKind, Uuid)>>,
    closed: AtomicBool,
}

enum SubKind {
    Update,
    Presence,
    Destroy,
}

impl Session {
    /// Attach a session to a document and start the sync handshake: a sync
    /// request carrying the document's state vector, then the full presence
    /// snapshot.
    pub fn attach(
        registry: Arc<DocRegistry>,
        room: String,
        doc: Arc<Document>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Arc<Self> {
        doc.connection_opened();
        let session = Arc::new(Self {
            id: next_endpoint_id(),
            room,
            doc: doc.clone(),
            registry,
            outbound: Mutex::new(Some(outbound)),
            controlled: Mutex::new(HashSet::new()),
            subs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        let update_sub = doc.on_update(move |update, origin| {
            if let Some(session) = weak.upgrade() {
                if origin != Origin::Endpoint(session.id) {
                    session.send(Message::Update {
                        diff: update.to_vec(),
                    });
                }
            }
        });

        let weak = Arc::downgrade(&session);
        let presence_sub = doc.on_presence(move |delta, _origin| {
            if let Some(session) = weak.upgrade() {
                session.send(Message::AwarenessUpdate {
                    delta: delta.to_vec(),
                });
            }
        });

        let weak = Arc::downgrade(&session);
        let destroy_sub = doc.on_destroy(move || {
            if let Some(session) = weak.upgrade() {
                // Disposal disconnects remaining clients.
                session.outbound.lock().unwrap().take();
            }
        });

        *session.subs.lock().unwrap() = vec![
            (SubKind::Update, update_sub),
            (SubKind::Presence, presence_sub),
            (SubKind::Destroy, destroy_sub),
        ];

        session.send(Message::SyncRequest {
            state_vector: doc.state_vector(),
        });
        session.send(Message::AwarenessUpdate {
            delta: doc.presence_snapshot(),
        });

        debug!("[session {}] attached to room '{}'", session.id, session.room);
        session
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    fn send(&self, message: Message) {
        if let Some(tx) = self.outbound.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// React to one inbound message. Malformed payloads are logged and
    /// dropped; the connection and the document stay intact.
    pub fn handle_message(&self, message: Message) {
        match message {
            Message::SyncRequest { state_vector } => match self.doc.diff_since(&state_vector) {
                Ok(diff) => self.send(Message::SyncReply { diff }),
                Err(e) => warn!("[session {}] bad sync request: {}", self.id, e),
            },
            Message::SyncReply { diff } | Message::Update { diff } => {
                if let Err(e) = self.doc.apply_update(&diff, Origin::Endpoint(self.id)) {
                    warn!("[session {}] dropped malformed update: {}", self.id, e);
                }
            }
            Message::AwarenessUpdate { delta } => {
                match self.doc.apply_presence(&delta, Origin::Endpoint(self.id)) {
                    Ok(touched) => {
                        self.controlled.lock().unwrap().extend(touched);
                    }
                    Err(e) => {
                        warn!("[session {}] dropped malformed presence: {}", self.id, e)
                    }
                }
            }
        }
    }

    /// Tear the session down. Idempotent. If this was the document's last
    /// connection, the registry's room-emptied policy runs.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for (kind, id) in self.subs.lock().unwrap().drain(..) {
            match kind {
                SubKind::Update => self.doc.off_update(id),
                SubKind::Presence => self.doc.off_presence(id),
                SubKind::Destroy => self.doc.off_destroy(id),
            }
        }

        let controlled: Vec<ClientId> = self.controlled.lock().unwrap().drain().collect();
        if !controlled.is_empty() {
            self.doc
                .remove_presence(&controlled, Origin::Endpoint(self.id));
        }

        self.outbound.lock().unwrap().take();

        let remaining = self.doc.connection_closed();
        debug!(
            "[session {}] closed; {} connection(s) left in room '{}'",
            self.id, remaining, self.room
        );
        if remaining == 0 {
            self.registry.on_room_emptied(&self.room).await;
        }
    }
}
