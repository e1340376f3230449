//! Error types for OGP.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::LinkId;

/// Result type alias for OGP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OGP.
///
/// Only message-level failures ever reach the caller of
/// [`Endpoint::send`](crate::Endpoint::send). Link and wire faults are
/// absorbed by the endpoint and show up in statistics instead.
#[derive(Error, Debug)]
pub enum Error {
    // Submission errors
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // Link errors
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("link {0} not found")]
    LinkNotFound(LinkId),

    // Wire errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised by a single link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("MTU exceeded: packet size {size}, max {max}")]
    MtuExceeded { size: usize, max: usize },

    #[error("link closed")]
    Closed,
}

/// Wire decoding errors. Every one of these means the datagram is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated fragment: {len} bytes")]
    Truncated { len: usize },

    #[error("length mismatch: header declares {declared} payload bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid fragment index {index} for count {count}")]
    InvalidFragmentIndex { index: u16, count: u16 },

    #[error("fragment payload too large: {size} bytes (max {max})")]
    FragmentTooLarge { size: usize, max: usize },
}

impl Error {
    /// Check if error is transient and the operation may succeed if retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Link(LinkError::SendFailed(_) | LinkError::ReceiveFailed(_)) | Error::Io(_)
        )
    }
}

impl LinkError {
    /// Whether the link will never accept traffic again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, LinkError::Closed | LinkError::BindFailed { .. })
    }
}
