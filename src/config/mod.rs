// (c) 2024 Ross Younger
//! # Configuration management
//!
//! pathgauge obtains run-time configuration from the following sources, in order:
//! 1. Command-line options
//! 2. Environment variables prefixed `PATHGAUGE_` (for example `PATHGAUGE_MAX_CONNECTIONS=50`)
//! 3. The user's configuration file (typically `~/.pathgauge.toml`)
//! 4. The system-wide configuration file (typically `/etc/pathgauge.toml`)
//! 5. Hard-wired defaults
//!
//! Each option may appear in multiple places, but only the first match is used.
//!
//! ## File format
//!
//! Configuration files are TOML, with one key per setting.
//!
//! ### Example
//!
//! ```toml
//! listen = "[::]:3001"
//! max_connections = 200
//! # Engineering suffixes are accepted
//! initial_chunk_size = "512k"
//! ```
//!
//! ## Configurable options
//!
//! The full list of supported fields is defined by [Configuration].
//!
//! On the command line:
//! * `pathgauge --show-config` outputs a list of supported fields, their current values, and where each value came from.
//! * `pathgauge --config-files` outputs the list of configuration files for the current user.
//!
//! The measurement policy itself (trial counts, timeouts, stability thresholds) is not configurable.

mod structure;
pub use structure::Configuration;

mod overrides;
pub use overrides::Overrides;

mod manager;
pub use manager::Manager;

pub(crate) const BASE_CONFIG_FILENAME: &str = "pathgauge.toml";
pub(crate) const ENV_PREFIX: &str = "PATHGAUGE_";
