//! The connection multiplexer
//!
//! [`Server`] is the public face: bind an address, hand over a mixer,
//! and a dedicated thread serves sources and sinks until the handle is
//! dropped. Everything socket-shaped stays on that thread; the only
//! inbound edges are the listener and the wake channel.

mod connection;
mod event_loop;
mod ring;
mod sink_queue;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::unbounded;
use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};

use crate::error::{Error, Result};
use crate::mixer::Mixer;

use event_loop::{EventLoop, LoopHandle, LISTENER, WAKER};

/// Handle to a running server
///
/// Dropping the handle requests an orderly shutdown and waits for the
/// serving thread: every live connection is destroyed (unregistering
/// from the mixer) before the drop returns.
pub struct Server {
    handle: LoopHandle,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and start serving connections for `mixer`.
    pub fn bind<A: ToSocketAddrs>(addr: A, mixer: Arc<dyn Mixer>) -> Result<Server> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::AddrResolution)?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let (tx, rx) = unbounded();
        let handle = LoopHandle::new(tx, waker);
        let event_loop = EventLoop::new(poll, listener, mixer, handle.clone(), rx);
        let thread = thread::Builder::new()
            .name("dvmix-server".into())
            .spawn(move || event_loop.run())?;

        tracing::info!(addr = %local_addr, "DV mixer server listening");
        Ok(Server {
            handle,
            local_addr,
            thread: Some(thread),
        })
    }

    /// The address the listener actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
