// pathgauge client event loop
// (c) 2024 Ross Younger

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{websocket, Channel};
use crate::cli::{CliArgs, TestKind};
use crate::config::Configuration;
use crate::measure::result::{DownloadResult, PingResult, UploadResult};
use crate::protocol::{DOWNLOAD_PATH, PING_PATH, UPLOAD_PATH};

use super::meter::InstaMeterRunner;
use super::peer::{answer_pings, sink_download, source_upload};
use super::report::Report;

use anyhow::Context as _;
use indicatif::{MultiProgress, ProgressBar};
use tracing::{debug, error, info, trace_span, Instrument as _};

/// How long to wait for the server to accept a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a connection to one of the server's test endpoints
pub async fn connect(base: &str, path: &str) -> anyhow::Result<Channel> {
    let url = format!("{}{path}", base.trim_end_matches('/'));
    debug!("connecting to {url}");
    let (ws, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url))
            .await
            .with_context(|| format!("timed out connecting to {url}"))?
            .with_context(|| format!("failed to connect to {url}"))?;
    Ok(websocket::attach(ws))
}

/// Runs the latency test against the server at `base` (e.g. `ws://host:3001`)
pub async fn ping(base: &str) -> anyhow::Result<PingResult> {
    let channel = connect(base, PING_PATH).await?;
    let result = answer_pings(&channel).await;
    channel.close().await;
    result
}

/// Runs the download test against the server at `base`, counting bytes into `counter` as they arrive
pub async fn download(
    base: &str,
    chunk_size: u64,
    counter: &AtomicU64,
) -> anyhow::Result<DownloadResult> {
    let channel = connect(base, DOWNLOAD_PATH).await?;
    let result = sink_download(&channel, chunk_size, counter).await;
    channel.close().await;
    result
}

/// Runs the upload test against the server at `base`, counting bytes into `counter` as they are sent
pub async fn upload(
    base: &str,
    duration: Duration,
    counter: &AtomicU64,
) -> anyhow::Result<UploadResult> {
    let channel = connect(base, UPLOAD_PATH).await?;
    let result = source_upload(&channel, duration, counter).await;
    channel.close().await;
    result
}

fn spinner(display: &MultiProgress, quiet: bool) -> ProgressBar {
    if quiet {
        ProgressBar::hidden()
    } else {
        let bar = display.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(150));
        bar
    }
}

/// Runs a throughput test with a live rate read-out
async fn metered<F, Fut, T>(
    display: &MultiProgress,
    quiet: bool,
    label: &str,
    test: F,
) -> anyhow::Result<T>
where
    F: FnOnce(Arc<AtomicU64>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let bar = spinner(display, quiet);
    bar.set_message(label.to_owned());
    let counter = Arc::new(AtomicU64::new(0));
    let mut meter = InstaMeterRunner::new(label, counter.clone(), bar.clone());
    meter.start();
    let result = test(counter).await;
    meter.stop().await;
    bar.finish_and_clear();
    display.remove(&bar);
    result
}

/// Main client entrypoint.
///
/// Runs the requested tests one after another, then prints the report.
/// Returns `Ok(false)` if any test failed; the others still run.
// Caution: As we are using ProgressBar, anything to be printed to console should use progress.println() !
pub(crate) async fn client_main(
    args: &CliArgs,
    config: &Configuration,
    display: &MultiProgress,
) -> anyhow::Result<bool> {
    let base = args.url.as_deref().context("no server URL given")?;
    let quiet = args.quiet || args.json;
    let mut tests = Vec::<TestKind>::new();
    for t in &args.tests {
        if !tests.contains(t) {
            tests.push(*t);
        }
    }

    let mut report = Report::default();
    let mut success = true;
    for test in tests {
        let span = trace_span!("test", %test);
        let outcome = match test {
            TestKind::Ping => {
                let bar = spinner(display, quiet);
                bar.set_message("Measuring latency");
                let result = ping(base).instrument(span).await;
                bar.finish_and_clear();
                display.remove(&bar);
                result.map(|r| report.ping = Some(r))
            }
            TestKind::Download => metered(display, quiet, "Downloading", |counter| async move {
                download(base, config.initial_chunk_size(), &counter).await
            })
            .instrument(span)
            .await
            .map(|r| report.download = Some(r)),
            TestKind::Upload => metered(display, quiet, "Uploading", |counter| async move {
                upload(base, config.upload_duration(), &counter).await
            })
            .instrument(span)
            .await
            .map(|r| report.upload = Some(r)),
        };
        if let Err(e) = outcome {
            error!("{test} test failed: {e:#}");
            success = false;
        } else {
            info!("{test} test complete");
        }
    }

    report.assess();
    if args.json {
        println!("{}", report.to_json());
    } else {
        display.suspend(|| println!("{report}"));
    }
    Ok(success)
}
