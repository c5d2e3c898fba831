//! Error types for partyline operations.

use thiserror::Error;

/// Errors surfaced by partyline operations.
///
/// Most failure modes in the stream path are deliberately swallowed and
/// logged (malformed frames, callback panics, transport hiccups that the
/// reconnect policy absorbs); this enum covers the failures that calls
/// return to the owner.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying stream or port failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Start/connect called with missing or unusable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subscription entry with an empty message type.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Send attempted while the stream is not open; the payload is dropped.
    #[error("Send unavailable: stream is not open")]
    SendUnavailable,

    /// The shared host could not be created or attached to.
    #[error("Shared host unavailable: {0}")]
    HostUnavailable(String),

    /// The reconnect attempt ceiling was reached; a fresh trigger
    /// (network-online, visibility gain, explicit start) is required.
    #[error("Reconnect attempts exhausted")]
    ReconnectExhausted,

    /// JSON serialization failure on an outbound payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for partyline operations.
pub type Result<T> = std::result::Result<T, Error>;
