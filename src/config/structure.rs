//! Configuration structure
// (c) 2024 Ross Younger

use std::time::Duration;

use human_repr::{HumanCount as _, HumanDuration as _};
use serde::{Deserialize, Serialize};
use struct_field_names_as_array::FieldNamesAsSlice;

use crate::util::humanu64::HumanU64;

/// The set of configurable options supported by pathgauge.
///
/// **Note:** The implementation of `default()` for this struct returns pathgauge's hard-wired
/// configuration defaults.
///
/// Measurement policy (test durations, trial counts, stability thresholds, chunk size limits)
/// is fixed and deliberately absent from here.
///
// Maintainer note: None of the members of this struct should be Option<anything>.
// An empty string or zero means "not set" where that makes sense.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, FieldNamesAsSlice)]
pub struct Configuration {
    /// Address and port the server listens on
    pub listen: String,

    /// Maximum number of concurrent test sessions the server will run.
    /// Connections beyond this are refused with HTTP 503.
    pub max_connections: u32,

    /// Chunk size that throughput tests start with, in bytes.
    /// Accepts engineering suffixes, e.g. `256k`.
    /// Whatever is set here is clamped to between 64KiB and 10MiB.
    pub initial_chunk_size: HumanU64,

    /// How long the peer keeps uploading before it sends `complete`, in seconds
    pub upload_duration: u16,

    /// Log to this file as well as the console. Empty means no log file.
    pub log_file: String,
}

impl Configuration {
    /// Accessor for `initial_chunk_size`
    #[must_use]
    pub fn initial_chunk_size(&self) -> u64 {
        *self.initial_chunk_size
    }

    /// Accessor for `upload_duration`, as a Duration
    #[must_use]
    pub fn upload_duration(&self) -> Duration {
        Duration::from_secs(self.upload_duration.into())
    }

    /// Accessor for `log_file`
    #[must_use]
    pub fn log_file(&self) -> Option<&str> {
        match self.log_file.as_str() {
            "" => None,
            f => Some(f),
        }
    }

    /// Formats the server-related options for display
    #[must_use]
    pub fn format_server_config(&self) -> String {
        format!(
            "listening on {listen}, at most {max} sessions, initial chunk size {chunk}",
            listen = self.listen,
            max = self.max_connections,
            chunk = self.initial_chunk_size().human_count_bytes(),
        )
    }

    /// Formats the peer-related options for display
    #[must_use]
    pub fn format_peer_config(&self) -> String {
        format!(
            "initial chunk size {chunk}, uploading for {duration}",
            chunk = self.initial_chunk_size().human_count_bytes(),
            duration = self.upload_duration().human_duration(),
        )
    }
}

impl Default for Configuration {
    /// **(Unusual!)**
    /// Returns pathgauge's hard-wired configuration defaults.
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3001".into(),
            max_connections: 1000,
            initial_chunk_size: 262_144.into(),
            upload_duration: 10,
            log_file: String::new(),
        }
    }
}
