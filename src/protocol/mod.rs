// (c) 2024 Ross Younger

//! Protocol definitions
//!
#![allow(clippy::doc_markdown)]
//! # The pathgauge protocol
//!
//! pathgauge measures the network path between a _server_ and a _peer_.
//! The peer is usually a second `pathgauge` process on the far side of the path.
//!
//! Every test runs over its own [WebSocket] connection. The peer chooses the test by the
//! request path it connects to:
//!
//! | Path | Test |
//! |---|---|
//! | `/ws/ping` | latency, jitter and packet loss |
//! | `/ws/download` | throughput, server ➡️ peer |
//! | `/ws/upload` | throughput, peer ➡️ server |
//!
//! Any other path is refused during the handshake with HTTP 404.
//! If the server is already running as many sessions as it is allowed, the handshake
//! is refused with HTTP 503.
//!
//! Two kinds of message travel over the connection:
//!
//! * [control] messages are small JSON objects in text frames;
//! * payload _chunks_ are binary frames full of random bytes. Random bytes cannot be
//!   compressed or cached by anything in the middle of the path.
//!
//! ## Ping
//!
//! 1. The server sends 20 `ping` messages, one at a time, waiting up to 5 seconds for each `pong`.
//! 1. The peer echoes each `ping` back as a `pong` with the same `timestamp` and `sequence`.
//! 1. The server reports the result.
//!
//! ## Download
//!
//! 1. The peer may send a `start` message carrying its preferred chunk size.
//! 1. The server sends binary chunks for up to 10 seconds, growing and shrinking the chunk size
//!    and the number of parallel streams as it learns what the path can carry.
//!    It stops early once the measured throughput has been stable for a while.
//! 1. The server reports the result.
//!
//! ## Upload
//!
//! 1. The server sends `start` with the initial chunk size.
//! 1. The peer sends binary chunks of that size.
//!    The server may send `chunkSize` at any time; the peer should use the new size from then on.
//! 1. The session ends when the server has measured enough, or when the peer sends `complete`.
//! 1. The server reports the result.
//!
//! ## Results
//!
//! Every test finishes with a single JSON text frame whose `type` is `result`
//! (see [`crate::measure::result`]), after which the server closes the connection.
//!
//! ## Health check
//!
//! `GET /health` over plain HTTP returns status 200 with a small JSON document
//! (`{"status":"ok",...}`). It is answered even when the server is full.
//!
//! [WebSocket]: <https://www.rfc-editor.org/rfc/rfc6455.html>

pub mod control;

/// Request path of the latency test
pub const PING_PATH: &str = "/ws/ping";
/// Request path of the download test
pub const DOWNLOAD_PATH: &str = "/ws/download";
/// Request path of the upload test
pub const UPLOAD_PATH: &str = "/ws/upload";
/// Request path of the health check. This is plain HTTP, not a WebSocket.
pub const HEALTH_PATH: &str = "/health";
