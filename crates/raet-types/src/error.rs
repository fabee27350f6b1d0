//! Shared error types for the RAET transport.

use thiserror::Error;

/// Top-level error type surfaced to applications embedding a stack.
#[derive(Error, Debug)]
pub enum RaetError {
    /// A packet could not be parsed or failed verification.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// The named or numbered remote is not in the peer directory.
    #[error("Unknown remote: {0}")]
    UnknownRemote(String),

    /// A remote with the same id or name is already registered.
    #[error("Remote already exists: {0}")]
    RemoteExists(String),

    /// The remote has not completed a Join.
    #[error("Remote {0} is not joined")]
    NotJoined(u32),

    /// The remote has not completed an Allow handshake.
    #[error("Remote {0} is not allowed")]
    NotAllowed(u32),

    /// Keys, cookie or vouch did not check out during Join or Allow.
    #[error("Trust failure: {0}")]
    TrustFailure(String),

    /// A cryptographic primitive failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A message could not be split or reassembled.
    #[error("Segmentation error: {0}")]
    Segment(String),

    /// A single unit is larger than the transport allows.
    #[error("Oversize: {size} bytes (max {max})")]
    Oversize {
        /// Actual size in bytes.
        size: usize,
        /// Ceiling in bytes.
        max: usize,
    },

    /// The identity store failed to read or write.
    #[error("Keep error: {0}")]
    Keep(String),

    /// A transaction expired before completing.
    #[error("Transaction timed out: {0}")]
    Timeout(String),

    /// The correspondent refused or rejected the exchange.
    #[error("Refused by remote: {0}")]
    Refused(String),

    /// A configuration value is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RaetError {
    fn from(e: serde_json::Error) -> Self {
        RaetError::Serialization(e.to_string())
    }
}

/// Alias for Result with RaetError.
pub type RaetResult<T> = Result<T, RaetError>;
