//! Network core for a live DV mixing service.
//!
//! A central mixer process accepts TCP connections from video/audio
//! *sources* and from *sinks*. Each peer identifies itself with a fixed
//! 4-byte greeting; sources then stream raw DV frames into the mixer,
//! and the mixer's output frame stream is fanned out to every connected
//! sink, with or without a small per-frame control header.
//!
//! ```text
//! source --DV bytes--> +--------+          +-------+ --frames--> sink
//! source --DV bytes--> | server | <-seam-> | mixer | --frames--> sink
//!                      +--------+          +-------+ --frames--> raw sink
//! ```
//!
//! This crate owns the left and right edges of that picture: the
//! single-threaded readiness loop in [`server`], the per-connection
//! protocol state machines, and the per-sink bounded queue with its
//! overflow policy. The mixer engine itself is external and is reached
//! only through the [`mixer::Mixer`] and [`mixer::Sink`] traits.
//!
//! The companion binary `dvmix-source-alsa` is a standalone source
//! process that captures PCM audio from an ALSA device and feeds
//! black-video DV frames carrying that audio into a running mixer.

pub mod config;
pub mod dif;
pub mod error;
pub mod mixer;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
pub use mixer::{Frame, FrameBuf, Mixer, Sink, SinkId, SourceId};
pub use server::Server;
