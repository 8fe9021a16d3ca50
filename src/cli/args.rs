// pathgauge top-level command-line arguments
// (c) 2024 Ross Younger

use clap::{Parser, ValueEnum};

use crate::config::Overrides;

/// Options that switch us into another mode i.e. which don't require a URL argument
pub(crate) const MODE_OPTIONS: &[&str] = &["server", "show_config", "config_files"];

/// The tests a client run can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TestKind {
    /// Round-trip latency, jitter and packet loss
    Ping,
    /// Server-to-client throughput
    Download,
    /// Client-to-server throughput
    Upload,
}

#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version(env!("PATHGAUGE_VERSION_STRING")),
    about,
    before_help = "e.g.   pathgauge --server\n       pathgauge ws://my-server:3001",
    infer_long_args(true)
)]
#[command(help_template(
    "\
{name} version {version}
{about-with-newline}
{usage-heading} {usage}
{before-help}
{all-args}{after-help}
"
))]
#[command(styles=super::styles::CLAP_STYLES)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct CliArgs {
    // MODE SELECTION ======================================================================
    /// Operates in server mode, accepting measurement sessions from clients.
    #[arg(
        long, help_heading("Modes"),
        conflicts_with_all(["quiet", "json", "tests", "show_config", "config_files", "url"])
    )]
    pub server: bool,

    /// Outputs the configuration, then exits
    #[arg(long, help_heading("Configuration"), conflicts_with("config_files"))]
    pub show_config: bool,

    /// Outputs the paths to configuration file(s), then exits
    #[arg(long, help_heading("Configuration"))]
    pub config_files: bool,

    // CLIENT-ONLY OPTIONS =================================================================
    /// Quiet mode
    ///
    /// Switches off progress display; reports only errors and the final results
    #[arg(short, long, action, conflicts_with("debug"))]
    pub quiet: bool,

    /// Prints the results as a single JSON document
    #[arg(long, action)]
    pub json: bool,

    /// Which tests to run, comma separated
    #[arg(
        short = 't',
        long = "test",
        value_delimiter = ',',
        value_name = "TEST",
        default_values_t = [TestKind::Ping, TestKind::Download, TestKind::Upload],
    )]
    pub tests: Vec<TestKind>,

    // DEBUG ----------------------------
    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=pathgauge=debug` in the environment.
    /// If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, help_heading("Debug"))]
    pub debug: bool,

    // CONFIGURATION ======================================================================
    #[command(flatten)]
    pub config: Overrides,

    // POSITIONAL ARGUMENTS ================================================================
    /// The server to measure against, e.g. `ws://my-server:3001`
    #[arg(
        conflicts_with_all(MODE_OPTIONS),
        required_unless_present_any(MODE_OPTIONS),
        value_name = "URL"
    )]
    pub url: Option<String>,
}
