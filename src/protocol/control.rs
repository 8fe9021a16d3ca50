//! Control message definitions
// (c) 2024 Ross Younger
//!
//! Control messages are JSON objects sent as WebSocket text frames, distinguished by their
//! `type` field. Payload chunks are never control messages; they travel as binary frames.
//!
//! | `type` | Direction | Fields |
//! |---|---|---|
//! | `ping` | server ➡️ peer | `timestamp` (ns, informational), `sequence` |
//! | `pong` | peer ➡️ server | as received |
//! | `start` | either | `chunkSize`, `sequence` (always 0) |
//! | `chunkSize` | server ➡️ peer (upload) | `chunkSize`, `sequence` |
//! | `complete` | peer ➡️ server (upload) | |
//! | `error` | server ➡️ peer | `message` |
//!
//! Results (`type: "result"`) are described in [`crate::measure::result`].

use serde::{Deserialize, Serialize};

/// A structured message on the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Latency probe request
    Ping {
        /// Sender's clock when the probe was sent, in nanoseconds since the Unix epoch.
        /// Echoed verbatim; not used for the round-trip computation.
        timestamp: i64,
        /// Probe sequence number
        sequence: u64,
    },
    /// Latency probe reply
    Pong {
        /// Echo of the probe's timestamp
        timestamp: i64,
        /// Echo of the probe's sequence number
        sequence: u64,
    },
    /// Start of a transfer, advertising the chunk size to use
    #[serde(rename_all = "camelCase")]
    Start {
        /// Chunk size in bytes
        chunk_size: u64,
        /// Always 0
        #[serde(default)]
        sequence: u64,
    },
    /// The receiving end asks the sender to change chunk size
    #[serde(rename_all = "camelCase")]
    ChunkSize {
        /// New chunk size in bytes
        chunk_size: u64,
        /// Number of chunks received so far
        #[serde(default)]
        sequence: u64,
    },
    /// The sender has nothing more to send
    Complete,
    /// The server could not run the requested test
    Error {
        /// Human-readable description
        message: String,
    },
}

impl ControlMessage {
    /// Serializes to the JSON wire form
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing a plain enum of integers and strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses the JSON wire form
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
