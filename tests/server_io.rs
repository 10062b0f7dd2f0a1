//! Socket-level tests for the server core
//!
//! A mock mixer stands in for the engine: it records registrations and
//! received frames, and lets tests push output frames at every
//! registered sink. Clients are plain blocking `std` sockets, so these
//! tests exercise the real greeting, framing and backpressure paths
//! end to end over loopback.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use dvmix::dif::{self, DvSystem, DIF_MAX_FRAME_SIZE, DIF_SEQUENCE_SIZE};
use dvmix::protocol::constants::{
    GREETING_RAW_SINK, GREETING_SINK, GREETING_SOURCE, SINK_FRAME_CUT_FLAG_POS,
    SINK_FRAME_HEADER_SIZE,
};
use dvmix::{Frame, FrameBuf, Mixer, Server, Sink, SinkId, SourceId};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MockState {
    sources: Vec<SourceId>,
    removed_sources: Vec<SourceId>,
    frames: Vec<Frame>,
    sinks: Vec<(SinkId, Arc<dyn Sink>)>,
    removed_sinks: Vec<SinkId>,
}

#[derive(Default)]
struct MockMixer {
    next_source: AtomicU32,
    next_sink: AtomicU32,
    state: Mutex<MockState>,
}

impl MockMixer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Push one output frame at every registered sink, the way the
    /// mixer engine fans its output out.
    fn deliver(&self, frame: &Frame) {
        let sinks: Vec<Arc<dyn Sink>> =
            self.state().sinks.iter().map(|(_, sink)| Arc::clone(sink)).collect();
        for sink in sinks {
            sink.put_frame(frame);
        }
    }
}

impl Mixer for MockMixer {
    fn add_source(&self) -> SourceId {
        let id = self.next_source.fetch_add(1, Ordering::Relaxed);
        self.state().sources.push(id);
        id
    }

    fn remove_source(&self, source: SourceId) {
        let mut state = self.state();
        state.sources.retain(|&id| id != source);
        state.removed_sources.push(source);
    }

    fn allocate_frame(&self) -> FrameBuf {
        FrameBuf::new()
    }

    fn put_frame(&self, _source: SourceId, frame: Frame) {
        self.state().frames.push(frame);
    }

    fn add_sink(&self, sink: Arc<dyn Sink>) -> SinkId {
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        self.state().sinks.push((id, sink));
        id
    }

    fn remove_sink(&self, sink: SinkId) {
        let mut state = self.state();
        state.sinks.retain(|&(id, _)| id != sink);
        state.removed_sinks.push(sink);
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + CLIENT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn connect(server: &Server, greeting: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    client.write_all(greeting).unwrap();
    client
}

/// A wire-ready DV frame for the system, as a source would send it
fn wire_frame(system: DvSystem) -> Vec<u8> {
    let mut buf = vec![0u8; DIF_MAX_FRAME_SIZE];
    dif::fill_dummy(&mut buf, system);
    buf.truncate(system.frame_size());
    buf
}

fn output_frame(system: DvSystem, cut_before: bool) -> Frame {
    Frame::new(Bytes::from(wire_frame(system)), system, cut_before)
}

fn assert_eof(client: &mut TcpStream) {
    let mut byte = [0u8; 1];
    loop {
        match client.read(&mut byte) {
            Ok(0) => return,
            // The server may still be flushing queued frames.
            Ok(_) => {}
            Err(e) => panic!("expected EOF, got error {e}"),
        }
    }
}

#[test]
fn test_source_frames_reach_the_mixer() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    // Greeting split across writes: the server must not care about
    // packetization.
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&GREETING_SOURCE[..2]).unwrap();
    client.flush().unwrap();
    client.write_all(&GREETING_SOURCE[2..]).unwrap();
    wait_for("source registration", || mixer.state().sources.len() == 1);

    let pal = wire_frame(DvSystem::System625_50);
    client.write_all(&pal).unwrap();
    client.write_all(&pal).unwrap();
    wait_for("two frames", || mixer.state().frames.len() == 2);

    {
        let state = mixer.state();
        for frame in &state.frames {
            assert_eq!(frame.system(), DvSystem::System625_50);
            assert_eq!(frame.data(), &pal[..]);
            assert!(!frame.cut_before());
        }
    }

    drop(client);
    wait_for("source removal", || mixer.state().removed_sources == vec![0]);
}

#[test]
fn test_source_reassembles_any_packetization() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_SOURCE);
    let ntsc = wire_frame(DvSystem::System525_60);

    // An awkward chunk size that straddles both window boundaries.
    for chunk in ntsc.chunks(7001) {
        client.write_all(chunk).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    wait_for("frame delivery", || !mixer.state().frames.is_empty());
    let state = mixer.state();
    assert_eq!(state.frames.len(), 1);
    assert_eq!(state.frames[0].size(), 120_000);
    assert_eq!(state.frames[0].data(), &ntsc[..]);
}

#[test]
fn test_garbage_first_sequence_drops_source() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_SOURCE);
    wait_for("source registration", || mixer.state().sources.len() == 1);

    // A full first sequence whose leading block is not a header.
    client.write_all(&vec![0xffu8; DIF_SEQUENCE_SIZE]).unwrap();

    assert_eof(&mut client);
    wait_for("source removal", || mixer.state().removed_sources == vec![0]);
    assert!(mixer.state().frames.is_empty());
}

#[test]
fn test_sink_receives_framed_output() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_SINK);
    wait_for("sink registration", || mixer.state().sinks.len() == 1);

    let first = output_frame(DvSystem::System625_50, false);
    let second = output_frame(DvSystem::System625_50, true);
    mixer.deliver(&first);
    mixer.deliver(&second);

    for expected in [&first, &second] {
        let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
        client.read_exact(&mut header).unwrap();
        let cut = header[SINK_FRAME_CUT_FLAG_POS];
        assert_eq!(cut, if expected.cut_before() { b'C' } else { 0 });
        for (pos, &byte) in header.iter().enumerate() {
            if pos != SINK_FRAME_CUT_FLAG_POS {
                assert_eq!(byte, 0, "reserved header byte {pos} must be zero");
            }
        }

        let mut payload = vec![0u8; expected.size()];
        client.read_exact(&mut payload).unwrap();
        assert_eq!(&payload[..], expected.data());
    }
}

#[test]
fn test_raw_sink_gets_bare_frames() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_RAW_SINK);
    wait_for("sink registration", || mixer.state().sinks.len() == 1);

    let frame = output_frame(DvSystem::System525_60, true);
    mixer.deliver(&frame);

    // Exactly the 120000 payload bytes, no prefix; the cut mark is not
    // representable on a raw sink.
    let mut payload = vec![0u8; frame.size()];
    client.read_exact(&mut payload).unwrap();
    assert_eq!(&payload[..], frame.data());
}

#[test]
fn test_bad_greeting_is_dropped_without_registration() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    // A healthy sink first; it must survive its neighbour's mistake.
    let mut sink_client = connect(&server, &GREETING_SINK);
    wait_for("sink registration", || mixer.state().sinks.len() == 1);

    let mut bad_client = connect(&server, &[0x00, 0x01, 0x02, 0x03]);
    assert_eof(&mut bad_client);

    {
        let state = mixer.state();
        assert!(state.sources.is_empty());
        assert_eq!(state.sinks.len(), 1);
        assert!(state.removed_sinks.is_empty());
    }

    // The sink still works.
    let frame = output_frame(DvSystem::System625_50, false);
    mixer.deliver(&frame);
    let mut buf = vec![0u8; SINK_FRAME_HEADER_SIZE + frame.size()];
    sink_client.read_exact(&mut buf).unwrap();
}

#[test]
fn test_sink_sending_bytes_is_dropped() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_SINK);
    wait_for("sink registration", || mixer.state().sinks.len() == 1);

    client.write_all(b"?").unwrap();
    assert_eof(&mut client);
    wait_for("sink removal", || mixer.state().removed_sinks == vec![0]);
}

#[test]
fn test_sink_overflow_drops_connection_after_contiguous_prefix() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut client = connect(&server, &GREETING_SINK);
    wait_for("sink registration", || mixer.state().sinks.len() == 1);

    // Far more data than the 30-frame queue plus both socket buffers
    // can hold, delivered before the client reads a byte. Each frame is
    // stamped so the wire order is checkable.
    let template = wire_frame(DvSystem::System625_50);
    let total = 300;
    for serial in 0..total {
        let mut stamped = template.clone();
        stamped[DIF_SEQUENCE_SIZE + 100] = serial as u8;
        mixer.deliver(&Frame::new(
            Bytes::from(stamped),
            DvSystem::System625_50,
            false,
        ));
    }

    // Drain until the server notices the overflow and hangs up. The
    // received frames must be a gap-free prefix of what was queued.
    let frame_size = DvSystem::System625_50.frame_size();
    let mut received = 0usize;
    loop {
        let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
        match client.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => panic!("unexpected read error {e}"),
        }
        let mut payload = vec![0u8; frame_size];
        match client.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => panic!("unexpected read error {e}"),
        }
        assert_eq!(payload[DIF_SEQUENCE_SIZE + 100], received as u8);
        received += 1;
    }
    assert!(received < total, "overflow never triggered");

    wait_for("sink removal", || mixer.state().removed_sinks == vec![0]);
}

#[test]
fn test_shutdown_unregisters_every_connection() {
    let mixer = MockMixer::new();
    let server = Server::bind("127.0.0.1:0", mixer.clone()).unwrap();

    let mut sources: Vec<TcpStream> = (0..2).map(|_| connect(&server, &GREETING_SOURCE)).collect();
    let mut sinks: Vec<TcpStream> = Vec::new();
    sinks.push(connect(&server, &GREETING_SINK));
    sinks.push(connect(&server, &GREETING_SINK));
    sinks.push(connect(&server, &GREETING_RAW_SINK));
    wait_for("all registrations", || {
        let state = mixer.state();
        state.sources.len() == 2 && state.sinks.len() == 3
    });

    // Dropping the handle joins the serving thread, so teardown is
    // complete when this returns.
    drop(server);

    let state = mixer.state();
    assert_eq!(state.removed_sources.len(), 2);
    assert_eq!(state.removed_sinks.len(), 3);
    assert!(state.sources.is_empty());
    assert!(state.sinks.is_empty());
    drop(state);

    for client in sources.iter_mut().chain(sinks.iter_mut()) {
        assert_eof(client);
    }
}
