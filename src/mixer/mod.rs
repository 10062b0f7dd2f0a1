//! The seam to the external mixer engine
//!
//! The server core never composes video: it feeds source frames into a
//! [`Mixer`] and the mixer feeds output frames back into each
//! registered [`Sink`]. Both traits are object-safe and shared across
//! threads: the server loop calls the mixer from its own thread, and
//! the mixer calls `Sink::put_frame` from whatever thread it mixes on.

mod frame;

use std::sync::Arc;

pub use frame::{Frame, FrameBuf};

/// Identifies a registered source; minted by the mixer, stable for the
/// connection's lifetime. Rendered 1-indexed in diagnostics.
pub type SourceId = u32;

/// Identifies a registered sink; same lifecycle as [`SourceId`].
pub type SinkId = u32;

/// Interface the server core requires of the mixer engine
pub trait Mixer: Send + Sync {
    /// Register a new source and mint its id
    fn add_source(&self) -> SourceId;

    /// Unregister a source; its id is surrendered
    fn remove_source(&self, source: SourceId);

    /// Hand out a fresh frame buffer for a source to fill
    fn allocate_frame(&self) -> FrameBuf;

    /// Deliver a completed frame from a source
    ///
    /// Called at the source's frame rate; the mixer is expected to
    /// clock, select and compose, then fan its output out to sinks.
    fn put_frame(&self, source: SourceId, frame: Frame);

    /// Register a sink and mint its id
    ///
    /// The mixer keeps the handle and calls [`Sink::put_frame`] on it
    /// for every output frame until the sink is removed.
    fn add_sink(&self, sink: Arc<dyn Sink>) -> SinkId;

    /// Unregister a sink; the mixer drops its handle
    fn remove_sink(&self, sink: SinkId);
}

/// Interface to a sink, implemented by the server core
pub trait Sink: Send + Sync {
    /// Put an output frame out.
    ///
    /// The frame is shared with other sinks and must not be modified.
    /// Implementations must return quickly: this runs on the mixer's
    /// thread and anything slow here stalls every sink.
    fn put_frame(&self, frame: &Frame);
}
