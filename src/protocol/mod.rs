//! Client greeting classification
//!
//! A freshly accepted connection is in an unknown state until its first
//! [`GREETING_SIZE`](constants::GREETING_SIZE) bytes arrive. Those bytes
//! pick the connection's role for its whole lifetime; a client can only
//! change role by opening a new connection.

pub mod constants;

use crate::error::ProtocolError;
use constants::{GREETING_RAW_SINK, GREETING_SINK, GREETING_SIZE, GREETING_SOURCE};

/// Role a client claims with its greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Streams DV frames into the mixer
    Source,
    /// Receives mixed frames, each prefixed with a control header
    Sink,
    /// Receives bare mixed frames
    RawSink,
}

/// Classify a complete greeting
pub fn identify(greeting: &[u8; GREETING_SIZE]) -> Result<ClientKind, ProtocolError> {
    match *greeting {
        GREETING_SOURCE => Ok(ClientKind::Source),
        GREETING_SINK => Ok(ClientKind::Sink),
        GREETING_RAW_SINK => Ok(ClientKind::RawSink),
        other => Err(ProtocolError::UnknownGreeting(other)),
    }
}
