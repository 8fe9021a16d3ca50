//! pathgauge network path meter
// (c) 2024 Ross Younger
//!
//! pathgauge measures the quality of the network path between two hosts:
//! round-trip latency, jitter, packet loss, and throughput in each direction.
//!
//! One end runs `pathgauge --server`; the other runs `pathgauge ws://server:3001`.
//! The server does the measuring; see [`protocol`] for how the two ends talk.
//!
//! The measurement engine ([`measure`]) is independent of the transport.
//! It talks to a [`channel::Channel`], which the server builds on top of a WebSocket.

pub mod channel;
mod cli;
pub use cli::{cli, TestKind};
pub mod client;
pub mod config;
pub mod measure;
pub mod protocol;
pub mod server;
pub mod util;
