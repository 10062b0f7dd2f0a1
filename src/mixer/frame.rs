//! Frame buffers shared between the server and the mixer
//!
//! A frame is filled exactly once, by a source connection reassembling
//! wire bytes or by the mixer composing output, and is immutable from
//! then on. [`FrameBuf`] is the exclusive fill-phase handle;
//! [`Frame`] is the frozen result, cheap to clone thanks to `Bytes`
//! reference counting, so one mixer output can sit in many sink queues
//! without copies.

use bytes::{Bytes, BytesMut};

use crate::dif::{DvSystem, DIF_MAX_FRAME_SIZE};

/// An immutable, reference-shareable DV frame
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    system: DvSystem,
    cut_before: bool,
}

impl Frame {
    /// Wrap already-framed DV bytes
    pub fn new(data: Bytes, system: DvSystem, cut_before: bool) -> Self {
        Self {
            data,
            system,
            cut_before,
        }
    }

    /// Frame payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// DV system the frame belongs to
    pub fn system(&self) -> DvSystem {
        self.system
    }

    /// Whether the mixer marked an edit point right before this frame
    pub fn cut_before(&self) -> bool {
        self.cut_before
    }
}

/// A mutable frame buffer being filled
///
/// Sized for the largest DV frame; [`finish`](FrameBuf::finish) trims it
/// to the actual system's frame size and freezes it into a [`Frame`].
#[derive(Debug)]
pub struct FrameBuf {
    data: BytesMut,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self {
            data: BytesMut::zeroed(DIF_MAX_FRAME_SIZE),
        }
    }

    /// The whole buffer, for incremental filling
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The bytes filled so far
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Freeze into an immutable frame of the system's exact size
    pub fn finish(mut self, system: DvSystem, cut_before: bool) -> Frame {
        self.data.truncate(system.frame_size());
        Frame {
            data: self.data.freeze(),
            system,
            cut_before,
        }
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_trims_to_frame_size() {
        let mut buf = FrameBuf::new();
        assert_eq!(buf.bytes_mut().len(), DIF_MAX_FRAME_SIZE);
        buf.bytes_mut()[0] = 0xab;

        let frame = buf.finish(DvSystem::System525_60, false);
        assert_eq!(frame.size(), 120_000);
        assert_eq!(frame.data()[0], 0xab);
        assert_eq!(frame.system(), DvSystem::System525_60);
        assert!(!frame.cut_before());
    }

    #[test]
    fn test_clones_share_payload() {
        let frame = FrameBuf::new().finish(DvSystem::System625_50, true);
        let copy = frame.clone();
        assert_eq!(copy.size(), frame.size());
        assert!(copy.cut_before());
        // Same backing storage, not a byte copy.
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
    }
}
