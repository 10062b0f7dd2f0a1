//! Error types for the DV mixing network core

use thiserror::Error;

use crate::protocol::constants::GREETING_SIZE;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("DV framing error: {0}")]
    Dif(#[from] DifError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind address did not resolve to a usable socket address")]
    AddrResolution,
}

/// Wire protocol violations by a connected peer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized greeting {0:02x?}")]
    UnknownGreeting([u8; GREETING_SIZE]),
}

/// Malformed DV frame data
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifError {
    #[error("DIF sequence shorter than one block")]
    TruncatedSequence,

    #[error("first DIF block is not a header block")]
    NotAHeader,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
