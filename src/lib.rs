// Roomsync - Collaborative Document Sync Relay

pub mod doc;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod transport;

pub use doc::{Document, Origin};
pub use error::SyncError;
pub use provider::{ConnectionStatus, LocalBus, ProviderConfig, ProviderEvent, SyncProvider};
pub use server::{Authenticator, CollabServer, ServerConfig};
pub use transport::{Handshake, LoopbackTransport, Transport, TransportLink};
