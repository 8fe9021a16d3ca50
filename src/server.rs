//! pathgauge server event loop
// (c) 2024 Ross Younger

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{websocket, Channel};
use crate::config::Configuration;
use crate::measure::latency::LatencyProbe;
use crate::measure::result::ThroughputResult;
use crate::measure::session::{run_download, run_upload};
use crate::protocol::control::ControlMessage;
use crate::protocol::{DOWNLOAD_PATH, HEALTH_PATH, PING_PATH, UPLOAD_PATH};

use anyhow::Context as _;
use human_repr::{HumanCount as _, HumanDuration as _, HumanThroughput as _};
use serde::Serialize;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{
    write_response, ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument as _};

/// How long a download waits for the peer's optional `start`
const START_WAIT: Duration = Duration::from_secs(2);
/// Upper bound on queueing and writing any single outbound message
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a new connection gets to show whether it is a health check, and then to be answered
const HEALTH_CHECK_WAIT: Duration = Duration::from_secs(5);
/// Spacing of looks at a request line that has only partly arrived
const PEEK_RETRY: Duration = Duration::from_millis(10);
/// Longest health check request head we will read
const MAX_REQUEST_HEAD: usize = 8192;

/// The test a connection asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Route {
    Ping,
    Download,
    Upload,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            PING_PATH => Some(Self::Ping),
            DOWNLOAD_PATH => Some(Self::Download),
            UPLOAD_PATH => Some(Self::Upload),
            _ => None,
        }
    }
}

/// Server main loop.
///
/// Binds to the configured address and serves until interrupted (Ctrl-C).
/// Sessions already in progress are allowed to finish.
#[allow(clippy::module_name_repetitions)]
pub async fn server_main(config: &Configuration) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    info!(
        "pathgauge {} {}",
        env!("CARGO_PKG_VERSION"),
        config.format_server_config()
    );
    debug!("local address is {}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let _ = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupted; finishing sessions in progress"),
            Err(e) => warn!("unable to listen for Ctrl-C: {e}"),
        }
        trigger.cancel();
    });

    serve(listener, config.clone(), shutdown).await
}

/// Accepts connections on `listener` until `shutdown` is cancelled, then waits for
/// in-flight sessions to finish.
pub async fn serve(
    listener: TcpListener,
    config: Configuration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let permits = Arc::new(Semaphore::new(
        usize::try_from(config.max_connections).unwrap_or(usize::MAX),
    ));
    let config = Arc::new(config);
    let mut tasks = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            },
        };
        // reap sessions that have finished
        while tasks.try_join_next().is_some() {}

        let permit = Arc::clone(&permits).try_acquire_owned().ok();
        let config = Arc::clone(&config);
        let span = info_span!("conn", %peer);
        let _ = tasks.spawn(handle_connection(stream, permit, config).instrument(span));
    }

    if !tasks.is_empty() {
        info!("waiting for {} session(s) to finish", tasks.len());
    }
    while tasks.join_next().await.is_some() {}
    trace!("finished");
    Ok(())
}

/// What the first bytes of a request say about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Health,
    Other,
    /// Too few bytes to tell
    Undecided,
}

fn sniff(start: &[u8]) -> Sniff {
    let wanted = ["GET ", HEALTH_PATH].concat();
    let wanted = wanted.as_bytes();
    if start.len() <= wanted.len() {
        return if wanted.starts_with(start) {
            Sniff::Undecided
        } else {
            Sniff::Other
        };
    }
    match start.strip_prefix(wanted) {
        Some([b' ' | b'?', ..]) => Sniff::Health,
        _ => Sniff::Other,
    }
}

/// Looks at the request line without consuming it
async fn is_health_check(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 16];
    let deadline = Instant::now() + HEALTH_CHECK_WAIT;
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => return false,
        };
        match sniff(&buf[..n]) {
            Sniff::Health => return true,
            Sniff::Other => return false,
            Sniff::Undecided => tokio::time::sleep(PEEK_RETRY).await,
        }
    }
}

/// Answers a health check over plain HTTP, then hangs up
async fn answer_health_check(mut stream: TcpStream) -> anyhow::Result<()> {
    // the request head carries nothing we need
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        anyhow::ensure!(head.len() <= MAX_REQUEST_HEAD, "health check request too long");
    }

    let body = serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    })
    .to_string();
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_LENGTH, body.len())
        .header(CONNECTION, "close")
        .body(())?;
    let mut output = Vec::new();
    write_response(&mut output, &response)?;
    output.extend_from_slice(body.as_bytes());
    stream.write_all(&output).await?;
    stream.shutdown().await?;
    Ok(())
}

fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    permit: Option<OwnedSemaphorePermit>,
    config: Arc<Configuration>,
) {
    // health checks are answered whether or not there is room for a session
    if is_health_check(&stream).await {
        match tokio::time::timeout(HEALTH_CHECK_WAIT, answer_health_check(stream)).await {
            Ok(Ok(())) => trace!("answered health check"),
            Ok(Err(e)) => debug!("health check failed: {e}"),
            Err(_) => debug!("health check timed out"),
        }
        return;
    }
    let mut route = None;
    let admitted = permit.is_some();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let Some(r) = Route::from_path(path) else {
            debug!("refusing unknown path {path}");
            return Err(refusal(StatusCode::NOT_FOUND, "no such test"));
        };
        if !admitted {
            warn!("refusing {r} session: too many concurrent sessions");
            return Err(refusal(StatusCode::SERVICE_UNAVAILABLE, "server busy"));
        }
        route = Some(r);
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("handshake failed: {e}");
            return;
        }
    };
    let Some(route) = route else {
        return;
    };
    let channel = websocket::attach(ws).with_send_timeout(SEND_TIMEOUT);

    let span = info_span!("session", %route);
    async {
        let started = Instant::now();
        match route {
            Route::Ping => {
                let result = LatencyProbe::new(&channel).run().await;
                report(&channel, &result).await;
            }
            Route::Download => {
                let chunk_size = requested_chunk_size(&channel, config.initial_chunk_size()).await;
                let result = run_download(&channel, chunk_size).await;
                log_traffic(&result, "sent", started.elapsed());
                report(&channel, &result).await;
            }
            Route::Upload => {
                let result = run_upload(&channel, config.initial_chunk_size()).await;
                log_traffic(&result, "received", started.elapsed());
                report(&channel, &result).await;
            }
        }
        channel.close().await;
    }
    .instrument(span)
    .await;
    drop(permit);
}

/// The chunk size the downloading peer asked for, if it asked in time
async fn requested_chunk_size(channel: &Channel, default: u64) -> u64 {
    let deadline = Instant::now() + START_WAIT;
    loop {
        match channel.receiver().recv_until(deadline).await {
            Ok(msg) => match msg.as_control() {
                Some(ControlMessage::Start { chunk_size, .. }) if chunk_size > 0 => {
                    debug!("peer asked for chunk size {chunk_size}");
                    return chunk_size;
                }
                Some(ControlMessage::Start { .. }) => return default,
                _ => trace!("ignoring message while waiting for start"),
            },
            Err(e) => {
                trace!("no start from peer: {e}");
                return default;
            }
        }
    }
}

async fn report<T: Serialize>(channel: &Channel, result: &T) {
    if let Err(e) = channel.send_json(result).await {
        warn!("failed to send result: {e}");
    }
}

#[allow(clippy::cast_precision_loss)]
fn log_traffic(result: &ThroughputResult, verb: &str, elapsed: Duration) {
    let rate = if elapsed.is_zero() {
        0.
    } else {
        result.bytes as f64 / elapsed.as_secs_f64()
    };
    info!(
        bytes = result.bytes,
        stop_reason = %result.stop_reason,
        "{verb} {} in {} ({})",
        result.bytes.human_count_bytes(),
        elapsed.human_duration(),
        rate.human_throughput_bytes(),
    );
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::{http::StatusCode, Error};
    use tokio_util::sync::CancellationToken;

    use super::{serve, sniff, Route, Sniff};
    use crate::config::Configuration;
    use crate::util::setup_tracing_for_tests;

    #[test]
    fn routes() {
        assert_eq!(Route::from_path("/ws/ping"), Some(Route::Ping));
        assert_eq!(Route::from_path("/ws/download"), Some(Route::Download));
        assert_eq!(Route::from_path("/ws/upload"), Some(Route::Upload));
        assert_eq!(Route::from_path("/ws/pings"), None);
        assert_eq!(Route::from_path("/"), None);
    }

    #[test]
    fn health_checks_are_recognised() {
        assert_eq!(sniff(b"GET /health HTTP/1.1\r\n"), Sniff::Health);
        assert_eq!(sniff(b"GET /health?verbose HTTP/1.1"), Sniff::Health);
        assert_eq!(sniff(b"GET /healthy HTTP/1.1"), Sniff::Other);
        assert_eq!(sniff(b"GET /ws/ping HTTP/1.1"), Sniff::Other);
        assert_eq!(sniff(b"POST /health HTTP/1.1"), Sniff::Other);
        assert_eq!(sniff(b"GET /hea"), Sniff::Undecided);
        assert_eq!(sniff(b"GET /health"), Sniff::Undecided);
        assert_eq!(sniff(b""), Sniff::Undecided);
    }

    async fn start(config: Configuration) -> (String, CancellationToken, tokio::task::JoinHandle<()>) {
        setup_tracing_for_tests();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            serve(listener, config, token).await.unwrap();
        });
        (url, shutdown, task)
    }

    fn refused_with(result: Result<impl std::fmt::Debug, Error>) -> StatusCode {
        match result {
            Err(Error::Http(response)) => response.status(),
            other => panic!("expected an HTTP refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (url, shutdown, task) = start(Configuration::default()).await;
        let result = tokio_tungstenite::connect_async(format!("{url}/ws/nope")).await;
        assert_eq!(refused_with(result), StatusCode::NOT_FOUND);
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn health_check_is_ok() {
        // no room for sessions, but health checks still get through
        let config = Configuration {
            max_connections: 0,
            ..Default::default()
        };
        let (url, shutdown, task) = start(config).await;
        let addr = url.trim_start_matches("ws://");

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        let _ = stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("content-type: application/json"), "{reply}");
        let (_, body) = reply.split_once("\r\n\r\n").unwrap();
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "pathgauge");

        // a WebSocket client asking for it gets the same answer
        let result = tokio_tungstenite::connect_async(format!("{url}/health")).await;
        assert_eq!(refused_with(result), StatusCode::OK);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn full_server_is_unavailable() {
        let config = Configuration {
            max_connections: 0,
            ..Default::default()
        };
        let (url, shutdown, task) = start(config).await;
        let result = tokio_tungstenite::connect_async(format!("{url}/ws/ping")).await;
        assert_eq!(refused_with(result), StatusCode::SERVICE_UNAVAILABLE);
        shutdown.cancel();
        task.await.unwrap();
    }
}
