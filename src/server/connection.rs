//! Per-connection protocol state machines
//!
//! A connection owns exactly one non-blocking socket and a [`Peer`]
//! state. Receives are windowed: the current state exposes the next
//! contiguous byte region it expects, the loop reads into it, and a
//! filled window advances the state machine: classifying a greeting,
//! probing a DV header, or handing a finished frame to the mixer. The
//! greeting transition swaps the `Peer` variant in place; the socket is
//! never duplicated or reopened.
//!
//! Sends exist only for sinks: a vectored write over the frame header
//! and payload, resumable at any byte offset, so a frame interrupted by
//! a full socket buffer continues exactly where it stopped.

use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::mem;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::dif::{self, DvSystem, DIF_SEQUENCE_SIZE};
use crate::mixer::{FrameBuf, Mixer, Sink, SinkId, SourceId};
use crate::protocol::constants::{
    GREETING_SIZE, SINK_FRAME_CUT_FLAG_POS, SINK_FRAME_HEADER_SIZE,
};
use crate::protocol::{self, ClientKind};

use super::event_loop::LoopHandle;
use super::sink_queue::{NextFrame, SinkQueue};

/// Loop-side collaborators a state transition may need
pub(crate) struct ConnCtx<'a> {
    pub(crate) mixer: &'a Arc<dyn Mixer>,
    pub(crate) handle: &'a LoopHandle,
}

/// Outcome of a receive turn, as seen by the loop
pub(crate) enum Turn {
    Keep,
    Drop,
}

/// Outcome of a send turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStatus {
    /// The connection is broken or overflowed; drop it
    Failed,
    /// Progress was made but the socket filled up; keep writable armed
    SentSome,
    /// The queue is drained; mask writable interest
    SentAll,
}

/// What a filled receive window did to the state machine
enum Step {
    Keep,
    Become(Peer),
    Drop,
}

pub(crate) struct Connection {
    socket: TcpStream,
    token: Token,
    /// Whether writable interest is currently registered
    pub(crate) want_write: bool,
    /// Bytes of the current receive window already filled
    window_pos: usize,
    peer: Peer,
}

impl Connection {
    pub(crate) fn new(socket: TcpStream, token: Token) -> Self {
        Self {
            socket,
            token,
            want_write: false,
            window_pos: 0,
            peer: Peer::Unknown {
                greeting: [0; GREETING_SIZE],
            },
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Read as much as the socket offers, advancing the state machine
    /// each time a window fills. Runs until the socket would block, the
    /// peer disconnects, or the state machine gives up.
    pub(crate) fn do_receive(&mut self, ctx: &ConnCtx<'_>) -> Turn {
        loop {
            let read = {
                let pos = self.window_pos;
                let window = self.peer.receive_window();
                debug_assert!(
                    !window.is_empty(),
                    "peer state handed back an empty receive window"
                );
                let len = window.len();
                self.socket.read(&mut window[pos..]).map(|n| (n, len))
            };
            match read {
                // Orderly close from the peer.
                Ok((0, _)) => return self.drop_turn(),
                Ok((n, len)) => {
                    self.window_pos += n;
                    if self.window_pos == len {
                        self.window_pos = 0;
                        match self.peer.on_window_filled(self.token, ctx) {
                            Step::Keep => {}
                            Step::Become(peer) => self.peer = peer,
                            Step::Drop => return self.drop_turn(),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Turn::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return self.drop_turn(),
            }
        }
    }

    /// Drain queued frames into the socket. Only sinks ever arm
    /// writable interest, so anything else here is broken.
    pub(crate) fn do_send(&mut self) -> SendStatus {
        let status = match &mut self.peer {
            Peer::Sink(sink) => sink.do_send(&mut self.socket),
            _ => SendStatus::Failed,
        };
        if status == SendStatus::Failed {
            tracing::warn!(peer = %self.peer, "Dropping connection");
        }
        status
    }

    fn drop_turn(&self) -> Turn {
        tracing::warn!(peer = %self.peer, "Dropping connection");
        Turn::Drop
    }
}

/// The protocol role of a connection
enum Peer {
    /// Greeting not yet complete
    Unknown { greeting: [u8; GREETING_SIZE] },
    Source(SourceConn),
    Sink(SinkConn),
}

impl Peer {
    /// The next contiguous region the receive side expects
    fn receive_window(&mut self) -> &mut [u8] {
        match self {
            Peer::Unknown { greeting } => &mut greeting[..],
            Peer::Source(source) => source.receive_window(),
            // A sink has nothing to say; one byte is enough to notice
            // it saying something anyway.
            Peer::Sink(sink) => &mut sink.scratch[..],
        }
    }

    fn on_window_filled(&mut self, token: Token, ctx: &ConnCtx<'_>) -> Step {
        match self {
            Peer::Unknown { greeting } => match protocol::identify(greeting) {
                Ok(ClientKind::Source) => {
                    Step::Become(Peer::Source(SourceConn::new(Arc::clone(ctx.mixer))))
                }
                Ok(kind @ (ClientKind::Sink | ClientKind::RawSink)) => {
                    Step::Become(Peer::Sink(SinkConn::new(
                        Arc::clone(ctx.mixer),
                        token,
                        ctx.handle.clone(),
                        kind == ClientKind::RawSink,
                    )))
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Greeting not recognized");
                    Step::Drop
                }
            },
            Peer::Source(source) => source.on_window_filled(),
            // Sinks must not send anything after the greeting.
            Peer::Sink(_) => Step::Drop,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Unknown { .. } => write!(f, "unknown client"),
            Peer::Source(source) => write!(f, "source {}", 1 + source.source_id),
            Peer::Sink(sink) => write!(f, "sink {}", 1 + sink.sink_id),
        }
    }
}

/// Where a source is within the current frame
enum FramePhase {
    /// Reading the first DIF sequence; the system is still unknown
    FirstSequence,
    /// Header probed; reading the rest of a frame of this system
    Tail(DvSystem),
}

/// A registered DV source streaming frames into the mixer
struct SourceConn {
    mixer: Arc<dyn Mixer>,
    source_id: SourceId,
    frame: FrameBuf,
    phase: FramePhase,
}

impl SourceConn {
    fn new(mixer: Arc<dyn Mixer>) -> Self {
        let source_id = mixer.add_source();
        let frame = mixer.allocate_frame();
        tracing::debug!(source = 1 + source_id, "Source connected");
        Self {
            mixer,
            source_id,
            frame,
            phase: FramePhase::FirstSequence,
        }
    }

    fn receive_window(&mut self) -> &mut [u8] {
        match self.phase {
            FramePhase::FirstSequence => &mut self.frame.bytes_mut()[..DIF_SEQUENCE_SIZE],
            FramePhase::Tail(system) => {
                &mut self.frame.bytes_mut()[DIF_SEQUENCE_SIZE..system.frame_size()]
            }
        }
    }

    fn on_window_filled(&mut self) -> Step {
        match self.phase {
            FramePhase::FirstSequence => {
                match dif::probe(&self.frame.bytes()[..DIF_SEQUENCE_SIZE]) {
                    Ok(system) => {
                        self.phase = FramePhase::Tail(system);
                        Step::Keep
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Rejecting frame header");
                        Step::Drop
                    }
                }
            }
            FramePhase::Tail(system) => {
                let full = mem::replace(&mut self.frame, self.mixer.allocate_frame());
                self.mixer.put_frame(self.source_id, full.finish(system, false));
                self.phase = FramePhase::FirstSequence;
                Step::Keep
            }
        }
    }
}

impl Drop for SourceConn {
    fn drop(&mut self) {
        self.mixer.remove_source(self.source_id);
    }
}

/// A registered sink draining mixer output to its socket
struct SinkConn {
    mixer: Arc<dyn Mixer>,
    sink_id: SinkId,
    raw: bool,
    /// Bytes of the current frame (header included) already sent
    frame_pos: usize,
    queue: Arc<SinkQueue>,
    scratch: [u8; 1],
}

impl SinkConn {
    fn new(mixer: Arc<dyn Mixer>, token: Token, handle: LoopHandle, raw: bool) -> Self {
        let queue = Arc::new(SinkQueue::new(token, handle));
        let sink_id = mixer.add_sink(Arc::clone(&queue) as Arc<dyn Sink>);
        tracing::debug!(sink = 1 + sink_id, raw, "Sink connected");
        Self {
            mixer,
            sink_id,
            raw,
            frame_pos: 0,
            queue,
            scratch: [0],
        }
    }

    fn do_send(&mut self, socket: &mut TcpStream) -> SendStatus {
        let mut finished = false;
        loop {
            let frame = match self.queue.next_frame(finished) {
                NextFrame::Overflowed => return SendStatus::Failed,
                NextFrame::Empty => return SendStatus::SentAll,
                NextFrame::Pending(frame) => frame,
            };
            finished = false;

            let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
            if !self.raw {
                header[SINK_FRAME_CUT_FLAG_POS] = if frame.cut_before() { b'C' } else { 0 };
                // Rest of the header is left as zero for expansion.
            }
            let head: &[u8] = if self.raw { &[] } else { &header };
            let total = head.len() + frame.size();

            // Resume mid-frame: skip segments already on the wire and
            // trim the partially sent one.
            let written = if self.frame_pos < head.len() {
                let bufs = [
                    IoSlice::new(&head[self.frame_pos..]),
                    IoSlice::new(frame.data()),
                ];
                socket.write_vectored(&bufs)
            } else {
                let payload = &frame.data()[self.frame_pos - head.len()..];
                socket.write_vectored(&[IoSlice::new(payload)])
            };

            match written {
                Ok(0) => return SendStatus::Failed,
                Ok(n) => {
                    self.frame_pos += n;
                    if self.frame_pos == total {
                        finished = true;
                        self.frame_pos = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SendStatus::SentSome,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return SendStatus::Failed,
            }
        }
    }
}

impl Drop for SinkConn {
    fn drop(&mut self) {
        self.mixer.remove_sink(self.sink_id);
    }
}
