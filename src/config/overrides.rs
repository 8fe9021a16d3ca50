//! Command-line configuration overrides
// (c) 2024 Ross Younger

use clap::Args;
use figment::{
    value::{Dict, Map},
    Metadata, Profile, Provider,
};

use crate::util::{humanu64::HumanU64, insert_if_some};

/// Configuration options that may be set on the command line.
///
/// Every field is optional; anything not given here falls through to the
/// configuration files, environment and defaults. Field names match [`super::Configuration`].
#[derive(Debug, Clone, Default, Args, PartialEq, Eq)]
pub struct Overrides {
    /// Address and port the server listens on
    #[arg(long, value_name = "ADDR:PORT", help_heading("Configuration"))]
    pub listen: Option<String>,

    /// Maximum number of concurrent test sessions (server mode)
    #[arg(long, value_name = "N", help_heading("Configuration"))]
    pub max_connections: Option<u32>,

    /// Initial chunk size for throughput tests, in bytes. Engineering suffixes are accepted.
    #[arg(long, value_name = "bytes", help_heading("Configuration"))]
    pub initial_chunk_size: Option<HumanU64>,

    /// How long the client keeps uploading before it sends `complete`, in seconds
    #[arg(long, value_name = "sec", help_heading("Configuration"))]
    pub upload_duration: Option<u16>,

    /// Log to a file.
    ///
    /// By default the log receives everything printed to stderr.
    /// To override this behaviour, set the environment variable `RUST_LOG_FILE_DETAIL` (same semantics as `RUST_LOG`).
    #[arg(short = 'l', long, value_name = "FILE", help_heading("Configuration"))]
    pub log_file: Option<String>,
}

impl Overrides {
    const META_NAME: &str = "command-line";
}

impl Provider for Overrides {
    fn metadata(&self) -> Metadata {
        Metadata::named(Self::META_NAME)
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut dict = Dict::new();
        insert_if_some(&mut dict, "listen", self.listen.clone())?;
        insert_if_some(&mut dict, "max_connections", self.max_connections)?;
        insert_if_some(&mut dict, "initial_chunk_size", self.initial_chunk_size)?;
        insert_if_some(&mut dict, "upload_duration", self.upload_duration)?;
        insert_if_some(&mut dict, "log_file", self.log_file.clone())?;
        Ok(Profile::Default.collect(dict))
    }
}
