//! Room documents
//!
//! A `Document` is the per-room unit of collaboration. It *owns* an opaque
//! replicated-content capability (`Replica`) and a presence map
//! (`Awareness`) — composition, not inheritance — and exposes only the
//! operations the sync core needs, plus named-callback registration with
//! symmetric detachment.
//!
//! Every mutation carries an `Origin` naming the endpoint (session or
//! provider) that applied it, so relays can avoid echoing a write back to
//! the endpoint it came from. Listeners fire only when a mutation actually
//! changed state; that is what terminates echo cycles between the network
//! transport and the local broadcast relay.

pub mod awareness;
pub mod replica;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;
pub use awareness::{Awareness, ClientId};
pub use replica::{MemoryReplica, Replica, StateVector};

/// Where a mutation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A local edit (application code, persistence load).
    Local,
    /// Applied by the endpoint with this id (a session or provider).
    Endpoint(u64),
}

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique endpoint id for a session or provider.
pub(crate) fn next_endpoint_id() -> u64 {
    NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed)
}

type UpdateCallback = dyn Fn(&[u8], Origin) + Send + Sync;
type DestroyCallback = dyn Fn() + Send + Sync;

/// A shared, conflict-free replicated document plus its presence map.
pub struct Document {
    name: String,
    client_id: ClientId,
    replica: Mutex<Box<dyn Replica>>,
    awareness: Mutex<Awareness>,
    update_subs: Mutex<HashMap<Uuid, Arc<UpdateCallback>>>,
    presence_subs: Mutex<HashMap<Uuid, Arc<UpdateCallback>>>,
    destroy_subs: Mutex<HashMap<Uuid, Arc<DestroyCallback>>>,
    connections: AtomicUsize,
    disposed: AtomicBool,
}

impl Document {
    /// Create a document over the default in-memory replica.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_replica(name, Box::new(MemoryReplica::new()))
    }

    /// Create a document over a caller-supplied replica capability.
    pub fn with_replica(name: impl Into<String>, replica: Box<dyn Replica>) -> Arc<Self> {
        let client_id: ClientId = rand::random();
        Arc::new(Self {
            name: name.into(),
            client_id,
            replica: Mutex::new(replica),
            awareness: Mutex::new(Awareness::new(client_id)),
            update_subs: Mutex::new(HashMap::new()),
            presence_subs: Mutex::new(HashMap::new()),
            destroy_subs: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This document's presence client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    // ---- content ----------------------------------------------------------

    pub fn state_vector(&self) -> Vec<u8> {
        self.replica.lock().unwrap().state_vector()
    }

    /// The minimal update a peer with the given state vector is missing.
    /// Read-only.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        self.replica.lock().unwrap().diff_since(state_vector)
    }

    /// Full state as a single update.
    pub fn snapshot(&self) -> Vec<u8> {
        self.replica.lock().unwrap().snapshot()
    }

    pub fn state_hash(&self) -> u64 {
        self.replica.lock().unwrap().state_hash()
    }

    /// Merge an update. Listeners are notified (with the given origin) only
    /// when the replica actually changed.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), SyncError> {
        let changed = self.replica.lock().unwrap().apply_update(update)?;
        if changed {
            self.notify_update(update, origin);
        }
        Ok(())
    }

    /// Record a local edit and notify listeners with `Origin::Local`.
    /// Returns the encoded update.
    pub fn write(&self, payload: impl Into<Vec<u8>>) -> Vec<u8> {
        let update = self.replica.lock().unwrap().write(payload.into());
        self.notify_update(&update, Origin::Local);
        update
    }

    // ---- presence ---------------------------------------------------------

    /// Set (or tombstone) the local client's presence state.
    pub fn set_presence(&self, state: Option<Value>) {
        let delta = self.awareness.lock().unwrap().set_local(state);
        self.notify_presence(&delta, Origin::Local);
    }

    /// Apply an encoded presence delta; returns the client ids that actually
    /// changed. Listeners fire only when that set is non-empty.
    pub fn apply_presence(&self, delta: &[u8], origin: Origin) -> Result<Vec<ClientId>, SyncError> {
        let (touched, delta) = {
            let mut awareness = self.awareness.lock().unwrap();
            let touched = awareness.apply_update(delta)?;
            let delta = awareness.encode_update(&touched);
            (touched, delta)
        };
        if !touched.is_empty() {
            self.notify_presence(&delta, origin);
        }
        Ok(touched)
    }

    /// Tombstone the given clients' presence entries.
    pub fn remove_presence(&self, clients: &[ClientId], origin: Origin) {
        let delta = self.awareness.lock().unwrap().remove(clients);
        if let Some(delta) = delta {
            self.notify_presence(&delta, origin);
        }
    }

    /// Tombstone every participant except the local client. Their liveness
    /// is unknown after a disconnect.
    pub fn remove_other_presence(&self, origin: Origin) {
        let others = self.awareness.lock().unwrap().other_clients();
        if !others.is_empty() {
            self.remove_presence(&others, origin);
        }
    }

    /// Full presence snapshot (tombstones included) as one delta.
    pub fn presence_snapshot(&self) -> Vec<u8> {
        self.awareness.lock().unwrap().encode_all()
    }

    /// Live presence entries by client id.
    pub fn presence_states(&self) -> HashMap<ClientId, Value> {
        self.awareness.lock().unwrap().states()
    }

    pub fn local_presence(&self) -> Option<Value> {
        self.awareness.lock().unwrap().local_state()
    }

    /// Encode the current local presence entry as a delta.
    pub fn local_presence_update(&self) -> Vec<u8> {
        self.awareness.lock().unwrap().encode_update(&[self.client_id])
    }

    /// Encode a same-clock removal for the local client without mutating
    /// state. Published when leaving the local relay.
    pub fn local_presence_tombstone(&self) -> Vec<u8> {
        self.awareness.lock().unwrap().encode_tombstone(&[self.client_id])
    }

    // ---- listeners --------------------------------------------------------

    pub fn on_update(&self, callback: impl Fn(&[u8], Origin) + Send + Sync + 'static) -> Uuid {
        let id = Uuid::new_v4();
        self.update_subs.lock().unwrap().insert(id, Arc::new(callback));
        id
    }

    pub fn off_update(&self, id: Uuid) {
        self.update_subs.lock().unwrap().remove(&id);
    }

    pub fn on_presence(&self, callback: impl Fn(&[u8], Origin) + Send + Sync + 'static) -> Uuid {
        let id = Uuid::new_v4();
        self.presence_subs.lock().unwrap().insert(id, Arc::new(callback));
        id
    }

    pub fn off_presence(&self, id: Uuid) {
        self.presence_subs.lock().unwrap().remove(&id);
    }

    pub fn on_destroy(&self, callback: impl Fn() + Send + Sync + 'static) -> Uuid {
        let id = Uuid::new_v4();
        self.destroy_subs.lock().unwrap().insert(id, Arc::new(callback));
        id
    }

    pub fn off_destroy(&self, id: Uuid) {
        self.destroy_subs.lock().unwrap().remove(&id);
    }

    fn notify_update(&self, update: &[u8], origin: Origin) {
        // Invoke outside the subscription lock; a callback may re-register.
        let callbacks: Vec<Arc<UpdateCallback>> =
            self.update_subs.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb(update, origin);
        }
    }

    fn notify_presence(&self, delta: &[u8], origin: Origin) {
        let callbacks: Vec<Arc<UpdateCallback>> =
            self.presence_subs.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb(delta, origin);
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// Record a new attached connection; returns the new count.
    pub(crate) fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a closed connection; returns the remaining count.
    pub(crate) fn connection_closed(&self) -> usize {
        let prev = self.connections.load(Ordering::SeqCst);
        if prev == 0 {
            return 0;
        }
        self.connections.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Number of currently attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Destroy the document: fire destroy callbacks once, then detach every
    /// listener. This is the only sanctioned teardown path; owners (the
    /// registry) subscribe a destroy callback to unregister the document.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<Arc<DestroyCallback>> =
            self.destroy_subs.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb();
        }
        self.update_subs.lock().unwrap().clear();
        self.presence_subs.lock().unwrap().clear();
        self.destroy_subs.lock().unwrap().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_write_notifies_with_local_origin() {
        let doc = Document::new("room");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        doc.on_update(move |_, origin| seen2.lock().unwrap().push(origin));

        doc.write(b"edit".to_vec());
        assert_eq!(*seen.lock().unwrap(), vec![Origin::Local]);
    }

    #[test]
    fn test_duplicate_update_does_not_notify() {
        let a = Document::new("room");
        let b = Document::new("room");
        let update = a.write(b"edit".to_vec());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        b.on_update(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        b.apply_update(&update, Origin::Endpoint(9)).unwrap();
        b.apply_update(&update, Origin::Endpoint(9)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_update_detaches() {
        let doc = Document::new("room");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let sub = doc.on_update(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        doc.off_update(sub);
        doc.write(b"edit".to_vec());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_presence_listener_fires_on_real_change_only() {
        let a = Document::new("room");
        let b = Document::new("room");
        a.set_presence(Some(json!({"cursor": 4})));
        let delta = a.local_presence_update();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        b.on_presence(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        b.apply_presence(&delta, Origin::Endpoint(1)).unwrap();
        // Same-clock re-delivery is a no-op
        b.apply_presence(&delta, Origin::Endpoint(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            b.presence_states().get(&a.client_id()),
            Some(&json!({"cursor": 4}))
        );
    }

    #[test]
    fn test_dispose_fires_destroy_once_and_clears_listeners() {
        let doc = Document::new("room");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        doc.on_destroy(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        doc.dispose();
        doc.dispose();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(doc.is_disposed());

        // Listeners are gone after disposal
        let updates = Arc::new(AtomicUsize::new(0));
        doc.write(b"late".to_vec());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }
}
