//! Error types for the sync engine.
//!
//! None of these surface to the end user. Every variant is absorbed by the
//! component that observes it and degrades into a coarser freshness tier or a
//! longer effective refresh interval.

/// Top-level error type for snapshot synchronization.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A single delivery channel failed to accept a payload.
    #[error("transport error: {0}")]
    Transport(String),

    /// Snapshot could not be turned into a wire payload.
    #[error("encode error: {0}")]
    Encode(String),

    /// Incoming payload could not be decoded into a snapshot.
    #[error("decode error: {0}")]
    Decode(String),

    /// Shared store read or write failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Wake facility refused to grant a background wake.
    #[error("wake denied: {0}")]
    WakeDenied(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error between engine tasks.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;
