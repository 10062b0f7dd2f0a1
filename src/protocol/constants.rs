//! Wire protocol constants
//!
//! Every client opens its connection with a fixed-size greeting that
//! selects the connection's role. There is no length prefix and no
//! version negotiation; an unrecognized greeting is terminal.

/// Length of the client greeting in bytes
pub const GREETING_SIZE: usize = 4;

/// Greeting sent by a DV source (streams frames into the mixer)
pub const GREETING_SOURCE: [u8; GREETING_SIZE] = *b"SORC";

/// Greeting sent by a sink that wants frames with control headers
pub const GREETING_SINK: [u8; GREETING_SIZE] = *b"SINK";

/// Greeting sent by a sink that wants bare DV frames
pub const GREETING_RAW_SINK: [u8; GREETING_SIZE] = *b"RSNK";

/// Size of the per-frame header sent to non-raw sinks
///
/// Only the cut flag byte is assigned; the rest is zero, reserved for
/// expansion.
pub const SINK_FRAME_HEADER_SIZE: usize = 16;

/// Offset of the cut flag byte within the sink frame header
///
/// The byte holds ASCII `C` when the frame starts a new cut, 0 otherwise.
pub const SINK_FRAME_CUT_FLAG_POS: usize = 0;
