#![forbid(unsafe_code)]

//! Common error type for Lattice crates.

use thiserror::Error;

use crate::DhtAddress;

#[derive(Debug, Error)]
pub enum DhtError {
    /// An RPC call or a whole session exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    /// Routing found no viable next hop.
    #[error("no viable route targets")]
    NoTargets,

    /// The message was already processed and has been suppressed.
    #[error("duplicate message")]
    DuplicateMessage,

    /// The operation was invoked during or after shutdown.
    #[error("node is stopped")]
    Stopped,

    /// The target of the operation is the local node itself.
    #[error("cannot connect to self")]
    CannotConnectToSelf,

    /// A liveness probe to the peer failed.
    #[error("peer unresponsive: {0}")]
    PeerUnresponsive(DhtAddress),

    /// Transport-level send/call failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed identifier input.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration parsing failures.
    #[error("config parse error: {0}")]
    ConfigParse(toml::de::Error),

    /// CBOR encode/decode errors on RPC payloads.
    #[error("codec error: {0}")]
    Codec(#[from] serde_cbor::Error),

    /// I/O related failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient alias for results throughout Lattice crates.
pub type DhtResult<T> = Result<T, DhtError>;
