use thiserror::Error;

/// Errors surfaced by the sync core.
///
/// Protocol errors are recoverable: the offending message is dropped and the
/// connection stays open. The other variants are surfaced to the caller that
/// initiated the operation.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
