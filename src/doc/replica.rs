//! The replicated-state capability seam
//!
//! The sync core treats document content as opaque: it only needs state
//! vectors, diffs, and an update-application primitive whose merge is
//! idempotent, commutative, and associative. `Replica` is that seam.
//! `MemoryReplica` is the default in-memory capability: a grow-only set of
//! operations keyed by (author, sequence number), with a version vector
//! summarizing what has been seen.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::protocol::{cbor_decode, cbor_encode};

/// Unique identifier for a replica (one per document instance).
pub type ReplicaId = u64;

/// Sequence number within a replica's operation stream.
pub type SeqNum = u64;

/// A compact summary of what a replica has already seen: the highest
/// sequence number observed from each known author.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    seen: BTreeMap<ReplicaId, SeqNum>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number seen from an author (0 if never seen).
    pub fn get(&self, author: ReplicaId) -> SeqNum {
        self.seen.get(&author).copied().unwrap_or(0)
    }

    /// Record having seen an operation from an author.
    pub fn observe(&mut self, author: ReplicaId, seq: SeqNum) {
        let current = self.seen.entry(author).or_insert(0);
        if seq > *current {
            *current = seq;
        }
    }

    /// Whether this vector covers a specific operation.
    pub fn covers(&self, author: ReplicaId, seq: SeqNum) -> bool {
        self.get(author) >= seq
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        cbor_encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        cbor_decode(data)
    }
}

/// One operation in an encoded update.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct OpRecord {
    author: ReplicaId,
    seq: SeqNum,
    payload: Vec<u8>,
}

/// Opaque replicated document content.
///
/// Implementations guarantee that applying any valid update, in any order,
/// any number of times, converges to the same state.
pub trait Replica: Send {
    /// Encode a summary of everything this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Compute the minimal update a peer with the given state vector is
    /// missing. Read-only.
    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Merge an encoded update. Returns true iff the state changed.
    /// Malformed updates fail atomically: nothing is applied.
    fn apply_update(&mut self, update: &[u8]) -> Result<bool, SyncError>;

    /// Record a local edit and return it as an encoded update.
    fn write(&mut self, payload: Vec<u8>) -> Vec<u8>;

    /// Encode the full state as a single update (a diff against nothing).
    fn snapshot(&self) -> Vec<u8>;

    /// Deterministic hash of the current state, for convergence checks.
    fn state_hash(&self) -> u64;
}

/// Default in-memory replica: a grow-only operation set.
pub struct MemoryReplica {
    id: ReplicaId,
    next_seq: SeqNum,
    ops: BTreeMap<(ReplicaId, SeqNum), Vec<u8>>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self {
            id: rand::random(),
            next_seq: 1,
            ops: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    fn vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for (author, seq) in self.ops.keys() {
            sv.observe(*author, *seq);
        }
        sv
    }

    fn encode_ops<'a>(
        &self,
        ops: impl Iterator<Item = (&'a (ReplicaId, SeqNum), &'a Vec<u8>)>,
    ) -> Vec<u8> {
        let records: Vec<OpRecord> = ops
            .map(|((author, seq), payload)| OpRecord {
                author: *author,
                seq: *seq,
                payload: payload.clone(),
            })
            .collect();
        // Encoding an in-memory Vec<OpRecord> cannot fail.
        cbor_encode(&records).unwrap_or_default()
    }
}

impl Default for MemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for MemoryReplica {
    fn state_vector(&self) -> Vec<u8> {
        self.vector().encode().unwrap_or_default()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode(state_vector)?;
        Ok(self.encode_ops(
            self.ops
                .iter()
                .filter(|((author, seq), _)| !sv.covers(*author, *seq)),
        ))
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<bool, SyncError> {
        let records: Vec<OpRecord> = cbor_decode(update)?;
        let mut changed = false;
        for record in records {
            changed |= self
                .ops
                .insert((record.author, record.seq), record.payload)
                .is_none();
        }
        Ok(changed)
    }

    fn write(&mut self, payload: Vec<u8>) -> Vec<u8> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.insert((self.id, seq), payload.clone());
        self.encode_ops(std::iter::once((&(self.id, seq), &payload)))
    }

    fn snapshot(&self) -> Vec<u8> {
        self.encode_ops(self.ops.iter())
    }

    fn state_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        for ((author, seq), payload) in &self.ops {
            author.hash(&mut hasher);
            seq.hash(&mut hasher);
            payload.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Decode an update and report the authors it mentions. Used by tests and
/// diagnostics; the core never inspects update contents.
pub fn update_authors(update: &[u8]) -> Result<Vec<ReplicaId>, SyncError> {
    let records: Vec<OpRecord> = cbor_decode(update)?;
    let mut authors: HashMap<ReplicaId, ()> = HashMap::new();
    for r in records {
        authors.insert(r.author, ());
    }
    Ok(authors.into_keys().collect())
}
