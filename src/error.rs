//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Public key is not 32 bytes of hex.
    #[error("invalid public key: must be 32 bytes hex-encoded (64 characters)")]
    InvalidKey,

    /// Post or message body is empty.
    #[error("empty message")]
    EmptyMessage,

    /// The key is already in the follow set.
    #[error("already following: {0}")]
    AlreadyFollowing(String),

    /// The key is not in the follow set.
    #[error("not following: {0}")]
    NotFollowing(String),

    /// No timeline entry or thread message with this id.
    #[error("unknown event id: {0}")]
    UnknownId(String),

    /// Cryptographic operation failed (keys, signatures, ECDH).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Payload could not be decrypted. Callers on the ingest path must treat
    /// this as "not addressed to me" and drop the event silently.
    #[error("decryption failed")]
    Decryption,

    /// Persistence port failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Relay connection failure. Transient by definition: connection tasks
    /// log it and back off, actions never see it.
    #[error("network error: {0}")]
    Network(String),

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine was constructed without a private key.
    #[error("no private key available")]
    MissingKey,
}

impl Error {
    /// Duplicate-action errors are notice-grade: the user is told, local
    /// state is untouched, and nothing is retried.
    pub fn is_notice(&self) -> bool {
        matches!(self, Error::AlreadyFollowing(_) | Error::NotFollowing(_))
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, Error>;
