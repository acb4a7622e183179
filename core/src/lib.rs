//! bftkv Core Library
//!
//! A replicated key-value store whose values are CRDTs and whose updates are
//! Byzantine-tolerant. Every update is a signed, hash-linked operation; replicas
//! exchange those operations through a causal anti-entropy protocol and fold
//! them deterministically into the same value, whatever order they arrive in.

pub mod client;
pub mod config;
pub mod crdt;
pub mod crypto;
pub mod network;
pub mod protocol;
pub mod smoothtest;
pub mod storage;
pub mod types;
pub mod version;

pub use client::Client;
pub use config::{AntiEntropyConfig, NodeConfig};
pub use types::*;
pub use version::{version_string, PROTOCOL_VERSION};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown key: {0}")]
    UnknownKey(OpHash),

    #[error("Key already exists: {0}")]
    KeyExists(OpHash),

    #[error("CRDT type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: CrdtType, actual: CrdtType },

    #[error("Unknown predecessor: {0}")]
    UnknownPredecessor(OpHash),

    #[error("Operation of type {actual} found while reducing {expected}")]
    WrongCrdtType { expected: CrdtType, actual: CrdtType },

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Request refused: {0}")]
    Refused(String),

    #[error("Network operation failed: {0}")]
    Network(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error means the graph engine itself is broken.
    ///
    /// Everything else is recoverable: bad peer input is dropped, bad local
    /// requests get a negative reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InternalConsistency(_))
    }
}
