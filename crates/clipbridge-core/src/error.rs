//! Error types for Clipbridge.
//!
//! This module provides a unified error type for all Clipbridge operations,
//! with specific error variants for the error kinds named by the sync
//! engine's contract, plus the infrastructure failures that sit alongside
//! them (configuration, serialization, internal invariants).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A specialized `Result` type for Clipbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Clipbridge.
#[derive(Error, Debug)]
pub enum Error {
    /// No device is paired yet.
    #[error("no device is paired")]
    NotPaired,

    /// No peer address is known or reachable.
    #[error("no peer available")]
    NoPeer,

    /// Authentication with the peer failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The peer refused the connection.
    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// An operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// AEAD decryption failed (wrong key, tampered ciphertext, or tampered
    /// nonce).
    #[error("failed to decrypt frame")]
    DecryptFailed,

    /// Malformed frame: bad discriminator, unexpected message type, missing
    /// JSON keys, or a frame exceeding the size ceiling.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A chunk or whole-file checksum did not match after all retries.
    #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
    Integrity {
        /// What failed the check ("chunk 3 of file.bin", "file.bin", ...).
        what: String,
        /// Expected checksum.
        expected: String,
        /// Actual checksum computed.
        actual: String,
    },

    /// A size ceiling (`max_file_size` or `max_total_size`) was exceeded.
    #[error("size limit exceeded: {0} bytes requested, limit is {1} bytes")]
    SizeLimit(u64, u64),

    /// The transfer's `expires_at` has passed.
    #[error("transfer expired")]
    Expired,

    /// The transfer was cancelled by either side.
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// The requested local file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The caller requested an invalid or out-of-range transfer / file.
    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    /// A registry state transition was attempted that the state machine
    /// does not allow.
    #[error("illegal transfer state transition: {0}")]
    IllegalTransition(String),

    /// Configuration file could not be read, parsed, or written.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON or other serialization failure outside the protocol's own
    /// `ProtocolError` (e.g. checkpoint or pairing-file corruption).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An internal invariant was violated; should not happen.
    #[error("internal error: {0}")]
    Internal(String),

    /// Catch-all for failures that don't fit another kind.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Returns whether this error is recoverable (the operation may
    /// succeed if retried per the checkpoint store's retry policy).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Io(_) | Self::Integrity { .. } | Self::ConnectionRefused(_)
        )
    }

    /// Returns a short, user-actionable suggestion for resolving the error,
    /// if one applies. Falls back to `None` for errors whose `Display`
    /// message is already the whole story.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NotPaired => Some("Pair with a device first using the pairing PIN."),
            Self::NoPeer => Some("Check that the paired device is on the same network."),
            Self::SizeLimit(_, _) => {
                Some("Increase max_file_size / max_total_size in the configuration, or send a smaller batch.")
            }
            Self::Expired => Some("Ask the sender to re-announce; the offer is no longer valid."),
            _ => None,
        }
    }
}
