//! Ephemeral presence ("awareness") state
//!
//! A versioned last-write-wins map from client id to an arbitrary
//! JSON-serializable state. A `None` state is a tombstone: the client has
//! left. Each entry carries a clock; an incoming record applies only when
//! its clock is newer, or equal with a removal (removal wins ties). Stored
//! tombstones keep their clock, so a removed client cannot be resurrected
//! by a stale delta.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::protocol::{cbor_decode, cbor_encode};

/// Identifier unique per participant instance (not per user).
pub type ClientId = u64;

#[derive(Clone, Debug)]
struct PresenceEntry {
    clock: u32,
    state: Option<Value>,
}

/// One client's record inside an encoded presence delta.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PresenceRecord {
    client: ClientId,
    clock: u32,
    state: Option<Value>,
}

/// The presence map for one document.
pub struct Awareness {
    local_id: ClientId,
    entries: HashMap<ClientId, PresenceEntry>,
}

impl Awareness {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// The local client's current state, if it has one.
    pub fn local_state(&self) -> Option<Value> {
        self.entries
            .get(&self.local_id)
            .and_then(|e| e.state.clone())
    }

    /// Set (or tombstone, with `None`) the local client's state. Returns the
    /// encoded delta to broadcast.
    pub fn set_local(&mut self, state: Option<Value>) -> Vec<u8> {
        let entry = self.entries.entry(self.local_id).or_insert(PresenceEntry {
            clock: 0,
            state: None,
        });
        entry.clock += 1;
        entry.state = state;
        self.encode_update(&[self.local_id])
    }

    /// All live (non-tombstoned) entries.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Apply an encoded delta. Returns the client ids whose entries actually
    /// changed; stale records are ignored.
    pub fn apply_update(&mut self, delta: &[u8]) -> Result<Vec<ClientId>, SyncError> {
        let records: Vec<PresenceRecord> = cbor_decode(delta)?;
        let mut touched = Vec::new();
        for record in records {
            let newer = match self.entries.get(&record.client) {
                Some(existing) => {
                    record.clock > existing.clock
                        || (record.clock == existing.clock
                            && record.state.is_none()
                            && existing.state.is_some())
                }
                None => true,
            };
            if newer {
                self.entries.insert(
                    record.client,
                    PresenceEntry {
                        clock: record.clock,
                        state: record.state,
                    },
                );
                touched.push(record.client);
            }
        }
        Ok(touched)
    }

    /// Encode the current records for the given client ids.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let records: Vec<PresenceRecord> = clients
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| PresenceRecord {
                    client: *id,
                    clock: e.clock,
                    state: e.state.clone(),
                })
            })
            .collect();
        cbor_encode(&records).unwrap_or_default()
    }

    /// Encode every known entry (tombstones included) as one delta.
    pub fn encode_all(&self) -> Vec<u8> {
        let ids: Vec<ClientId> = self.entries.keys().copied().collect();
        self.encode_update(&ids)
    }

    /// Encode removal records for the given clients at their current clocks,
    /// without mutating local state. Used when leaving the relay: receivers
    /// treat the equal-clock `None` as a removal.
    pub fn encode_tombstone(&self, clients: &[ClientId]) -> Vec<u8> {
        let records: Vec<PresenceRecord> = clients
            .iter()
            .map(|id| PresenceRecord {
                client: *id,
                clock: self.entries.get(id).map(|e| e.clock).unwrap_or(0),
                state: None,
            })
            .collect();
        cbor_encode(&records).unwrap_or_default()
    }

    /// Tombstone the given clients locally, bumping their clocks. Returns
    /// the encoded delta, or None if none of them had live entries.
    pub fn remove(&mut self, clients: &[ClientId]) -> Option<Vec<u8>> {
        let mut removed = Vec::new();
        for id in clients {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.state.is_some() {
                    entry.clock += 1;
                    entry.state = None;
                    removed.push(*id);
                }
            }
        }
        if removed.is_empty() {
            None
        } else {
            Some(self.encode_update(&removed))
        }
    }

    /// Ids of every known client other than the local one.
    pub fn other_clients(&self) -> Vec<ClientId> {
        self.entries
            .keys()
            .copied()
            .filter(|id| *id != self.local_id)
            .collect()
    }
}
