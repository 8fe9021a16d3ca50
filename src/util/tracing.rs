//! Tracing helpers
// (c) 2024 Ross Younger

use std::{
    fs::File,
    io::Write,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use indicatif::MultiProgress;
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, prelude::*, EnvFilter, Layer};

const STANDARD_ENV_VAR: &str = "RUST_LOG";
const LOG_FILE_DETAIL_ENV_VAR: &str = "RUST_LOG_FILE_DETAIL";

/// Reads a filter from the environment variable `key`; if unset, logs only pathgauge events at `level`.
///
/// The flag is true if the environment was used, in which case other crates' events may appear
/// and log targets are worth showing.
fn filter_for(level: &str, key: &str) -> anyhow::Result<(EnvFilter, bool)> {
    match std::env::var(key) {
        Ok(directives) => EnvFilter::try_new(directives)
            .map(|f| (f, true))
            .with_context(|| format!("{key} (set in environment) was invalid")),
        Err(_) => Ok((EnvFilter::new(format!("pathgauge={level}")), false)),
    }
}

/// Sets up tracing to the console and, optionally, to a file.
///
/// Console output goes via `display` when it is visible, so log lines don't tear the progress spinners.
/// By default only our own events are logged, at `level`; `RUST_LOG` overrides this.
/// The file log follows `RUST_LOG_FILE_DETAIL` if set, otherwise the same rules as the console.
///
/// For filter syntax, see <https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html>
///
/// **CAUTION:** If this function fails, tracing won't be set up; callers must take extra care to report the error.
pub fn setup(
    level: &str,
    display: Option<&MultiProgress>,
    filename: Option<&str>,
) -> anyhow::Result<()> {
    let (filter, from_env) = filter_for(level, STANDARD_ENV_VAR)?;
    let writer = match display {
        Some(mp) if !mp.is_hidden() => BoxMakeWriter::new(Mutex::new(ProgressWriter(mp.clone()))),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let mut layers = vec![fmt::layer()
        .compact()
        .with_target(from_env)
        .with_writer(writer)
        .with_filter(filter)
        .boxed()];

    if let Some(filename) = filename {
        let file = File::create(filename)
            .with_context(|| format!("failed to open log file {filename}"))?;
        let key = if std::env::var_os(LOG_FILE_DETAIL_ENV_VAR).is_some() {
            LOG_FILE_DETAIL_ENV_VAR
        } else {
            STANDARD_ENV_VAR
        };
        let (filter, from_env) = filter_for(level, key)?;
        layers.push(
            fmt::layer()
                .compact()
                .with_ansi(false)
                .with_target(from_env)
                .with_writer(Arc::new(file))
                .with_filter(filter)
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
    Ok(())
}

/// Routes log lines through a `MultiProgress`
struct ProgressWriter(MultiProgress);

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = std::str::from_utf8(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.0.println(msg.trim_end_matches('\n'))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Best-effort tracing for unit tests; only the first call in a process has any effect
#[cfg(test)]
pub(crate) fn setup_tracing_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
