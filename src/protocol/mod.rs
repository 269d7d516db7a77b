//! Sync protocol message types and naming
//!
//! These are the transport-agnostic messages exchanged between a provider
//! and a server session, plus the message set for the same-host broadcast
//! relay shared by co-located providers. Payloads are opaque byte strings
//! produced and consumed by the document capability.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::SyncError;

/// Namespace prefix for room addressing. A room named `r` is reached through
/// the namespace path `"/doc|r"`.
pub const NAMESPACE_PREFIX: &str = "/doc|";

/// Messages exchanged over the network transport, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// "What am I missing" — carries the sender's state vector. The peer
    /// answers with a `SyncReply`.
    SyncRequest { state_vector: Vec<u8> },
    /// The diff the requester was missing.
    SyncReply { diff: Vec<u8> },
    /// Incremental change to merge.
    Update { diff: Vec<u8> },
    /// Encoded presence delta (add/change/remove client entries).
    AwarenessUpdate { delta: Vec<u8> },
}

/// Messages exchanged over the local broadcast relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    /// Sender's state vector; any peer answers with `SyncStep2`.
    SyncStep1 { state_vector: Vec<u8> },
    /// The diff the step-1 sender was missing.
    SyncStep2 { diff: Vec<u8> },
    /// Incremental change to merge.
    SyncUpdate { diff: Vec<u8> },
    /// Ask peers for a full presence snapshot.
    QueryAwareness,
    /// Encoded presence delta.
    AwarenessUpdate { delta: Vec<u8> },
}

/// A relay message tagged with the sender's endpoint id so receivers can
/// suppress their own echo.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub sender: u64,
    pub message: RelayMessage,
}

/// Build the namespace path for a room.
pub fn room_namespace(room: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, room)
}

/// Extract the room id from a namespace path, if it matches the prefix.
pub fn room_from_namespace(namespace: &str) -> Option<&str> {
    namespace.strip_prefix(NAMESPACE_PREFIX)
}

/// Name of the local broadcast relay channel for a (server url, room) pair.
/// Trailing slashes on the url are ignored so `ws://host/` and `ws://host`
/// land on the same channel.
pub fn relay_channel(url: &str, room: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), room)
}

/// Serialize a value to CBOR bytes.
pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| SyncError::Protocol(format!("CBOR encode failed: {}", e)))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, SyncError> {
    ciborium::from_reader(data)
        .map_err(|e| SyncError::Protocol(format!("CBOR decode failed: {}", e)))
}
