//! Per-sink frame queue
//!
//! The queue is the only state a sink connection shares with the mixer.
//! The mixer pushes on its own thread; the server loop pops on its.
//! The mutex guards a push or a peek, never a syscall. Overflow does
//! not block the producer. A sink that cannot keep up is doomed
//! instead: the `overflowed` flag sticks and the next send attempt
//! fails, which drops the connection.

use mio::Token;
use parking_lot::Mutex;

use crate::mixer::{Frame, Sink};

use super::event_loop::LoopHandle;
use super::ring::RingBuffer;

/// Frames a sink may have queued before it overflows
pub(crate) const SINK_QUEUE_LEN: usize = 30;

/// What the consumer side finds when it asks for work
pub(crate) enum NextFrame {
    /// The queue overflowed at some point; the sink must be dropped
    Overflowed,
    /// Nothing queued
    Empty,
    /// The frame at the head of the queue
    Pending(Frame),
}

struct Shared {
    frames: RingBuffer<Frame, SINK_QUEUE_LEN>,
    overflowed: bool,
}

pub(crate) struct SinkQueue {
    token: Token,
    loop_handle: LoopHandle,
    shared: Mutex<Shared>,
}

impl SinkQueue {
    pub(crate) fn new(token: Token, loop_handle: LoopHandle) -> Self {
        Self {
            token,
            loop_handle,
            shared: Mutex::new(Shared {
                frames: RingBuffer::new(),
                overflowed: false,
            }),
        }
    }

    /// Advance the consumer: optionally retire the frame just finished,
    /// then peek the next one. The returned frame is a cheap clone so
    /// the lock is not held while it is being written to the socket.
    pub(crate) fn next_frame(&self, pop_finished: bool) -> NextFrame {
        let mut shared = self.shared.lock();
        if shared.overflowed {
            return NextFrame::Overflowed;
        }
        if pop_finished {
            shared.frames.pop();
        }
        match shared.frames.front() {
            Some(frame) => NextFrame::Pending(frame.clone()),
            None => NextFrame::Empty,
        }
    }
}

impl Sink for SinkQueue {
    fn put_frame(&self, frame: &Frame) {
        let was_empty;
        {
            let mut shared = self.shared.lock();
            if shared.frames.is_full() {
                shared.overflowed = true;
                return;
            }
            was_empty = shared.frames.is_empty();
            shared.frames.push(frame.clone());
        }
        // Empty -> non-empty is the only transition the loop cannot see
        // on its own; wake it so it re-arms writable interest.
        if was_empty {
            self.loop_handle.enable_output(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use crossbeam_channel::{unbounded, Receiver};
    use mio::{Poll, Waker};

    use crate::dif::DvSystem;
    use crate::server::event_loop::LoopMessage;

    use super::*;

    fn queue_with_probe() -> (Poll, SinkQueue, Receiver<LoopMessage>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = unbounded();
        let queue = SinkQueue::new(Token(9), LoopHandle::new(tx, waker));
        (poll, queue, rx)
    }

    fn frame() -> Frame {
        Frame::new(Bytes::from_static(b"dv"), DvSystem::System625_50, false)
    }

    #[test]
    fn test_wakes_only_on_empty_to_non_empty() {
        let (_poll, queue, rx) = queue_with_probe();

        queue.put_frame(&frame());
        assert_eq!(rx.try_recv(), Ok(LoopMessage::EnableOutput(Token(9))));

        queue.put_frame(&frame());
        assert!(rx.try_recv().is_err());

        // Drain completely, then push again: that is a fresh transition.
        assert!(matches!(queue.next_frame(false), NextFrame::Pending(_)));
        assert!(matches!(queue.next_frame(true), NextFrame::Pending(_)));
        assert!(matches!(queue.next_frame(true), NextFrame::Empty));
        queue.put_frame(&frame());
        assert_eq!(rx.try_recv(), Ok(LoopMessage::EnableOutput(Token(9))));
    }

    #[test]
    fn test_overflow_is_sticky() {
        let (_poll, queue, rx) = queue_with_probe();

        for _ in 0..SINK_QUEUE_LEN {
            queue.put_frame(&frame());
        }
        assert!(matches!(queue.next_frame(false), NextFrame::Pending(_)));

        // One more than capacity: the queue is now doomed, even though
        // frames are still queued.
        queue.put_frame(&frame());
        assert!(matches!(queue.next_frame(false), NextFrame::Overflowed));
        assert!(matches!(queue.next_frame(true), NextFrame::Overflowed));

        // Only the first push produced a wake.
        assert_eq!(rx.try_recv(), Ok(LoopMessage::EnableOutput(Token(9))));
        assert!(rx.try_recv().is_err());
    }
}
