//! The readiness loop at the heart of the server
//!
//! One thread owns every socket. It blocks in `poll` and nowhere else;
//! everything it reacts to (new connections, socket readiness, wake
//! messages from mixer threads) arrives as poll events. Two tokens are
//! reserved (the waker and the listener); every accepted connection
//! gets a fresh token from a counter that never reuses values, so a
//! wake message naming a connection that has since been dropped simply
//! finds no entry and is ignored.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::mixer::Mixer;

use super::connection::{ConnCtx, Connection, SendStatus, Turn};

pub(crate) const WAKER: Token = Token(0);
pub(crate) const LISTENER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENTS_CAPACITY: usize = 128;

/// Messages posted to the loop by other threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopMessage {
    /// Stop serving and tear down every connection
    Quit,
    /// A sink queue went non-empty: arm writable interest on its socket
    EnableOutput(Token),
}

/// Cloneable handle for posting messages into the loop
///
/// The channel is unbounded and the waker never blocks, so producers
/// (mixer threads, the server handle) cannot stall on the loop.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    tx: Sender<LoopMessage>,
    waker: Arc<Waker>,
}

impl LoopHandle {
    pub(crate) fn new(tx: Sender<LoopMessage>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    pub(crate) fn enable_output(&self, token: Token) {
        self.post(LoopMessage::EnableOutput(token));
    }

    pub(crate) fn request_stop(&self) {
        self.post(LoopMessage::Quit);
    }

    fn post(&self, message: LoopMessage) {
        // A send failure means the loop is already gone; nothing to wake.
        if self.tx.send(message).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

pub(crate) struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    mixer: Arc<dyn Mixer>,
    handle: LoopHandle,
    rx: Receiver<LoopMessage>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        mixer: Arc<dyn Mixer>,
        handle: LoopHandle,
        rx: Receiver<LoopMessage>,
    ) -> Self {
        Self {
            poll,
            listener,
            mixer,
            handle,
            rx,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
        }
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        'serve: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
                    continue;
                }
                tracing::error!(error = %e, "poll failed, stopping server loop");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {
                        if self.drain_messages() {
                            break 'serve;
                        }
                    }
                    LISTENER => self.accept_ready(),
                    token => self.dispatch(token, event),
                }
            }
        }

        // Tear down every live connection; each peer state unregisters
        // from the mixer as it drops.
        tracing::info!(connections = self.connections.len(), "Server loop stopping");
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.remove_connection(token);
        }
    }

    /// Drain pending loop messages; returns true on a quit request.
    fn drain_messages(&mut self) -> bool {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                LoopMessage::Quit => return true,
                LoopMessage::EnableOutput(token) => {
                    let rearm_failed = match self.connections.get_mut(&token) {
                        Some(conn) if !conn.want_write => {
                            conn.want_write = true;
                            self.poll
                                .registry()
                                .reregister(
                                    conn.socket_mut(),
                                    token,
                                    Interest::READABLE | Interest::WRITABLE,
                                )
                                .is_err()
                        }
                        // Already armed, or a stale wake for a connection
                        // that is gone.
                        _ => false,
                    };
                    if rearm_failed {
                        tracing::warn!("Failed to arm writable interest, dropping connection");
                        self.remove_connection(token);
                    }
                }
            }
        }
        false
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut socket, peer_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        tracing::warn!(error = %e, "Failed to register accepted connection");
                        continue;
                    }
                    tracing::debug!(peer = %peer_addr, "New connection");
                    self.connections.insert(token, Connection::new(socket, token));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Best-effort accept; readiness will come around again.
                    tracing::warn!(error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let ctx = ConnCtx {
            mixer: &self.mixer,
            handle: &self.handle,
        };
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut drop_conn = event.is_error();
        if !drop_conn && (event.is_readable() || event.is_read_closed()) {
            drop_conn = matches!(conn.do_receive(&ctx), Turn::Drop);
        }
        // Readable and writable are handled in the same turn: with
        // edge-triggered delivery an unconsumed writable edge is not
        // reported again.
        if !drop_conn && event.is_writable() {
            match conn.do_send() {
                SendStatus::Failed => drop_conn = true,
                SendStatus::SentSome => {}
                SendStatus::SentAll => {
                    // Queue drained: mask writable interest until the
                    // producer wakes us again.
                    conn.want_write = false;
                    if self
                        .poll
                        .registry()
                        .reregister(conn.socket_mut(), token, Interest::READABLE)
                        .is_err()
                    {
                        drop_conn = true;
                    }
                }
            }
        }

        if drop_conn {
            self.remove_connection(token);
        }
    }

    fn remove_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(conn.socket_mut());
        }
    }
}
