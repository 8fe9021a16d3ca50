//! The peer's side of each test
// (c) 2024 Ross Younger

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use bytes::Bytes;
use rand::RngCore as _;
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelError, Message};
use crate::measure::rate::clamp_chunk_size;
use crate::measure::result::{DownloadResult, PingResult, UploadResult};
use crate::protocol::control::ControlMessage;

/// Longest we will wait for the server to say anything at all
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a message from the server turned out to be
enum Incoming<R> {
    Control(ControlMessage),
    Result(R),
    Payload(Bytes),
    Unrecognised,
}

fn classify<R: DeserializeOwned>(msg: Message) -> Incoming<R> {
    match msg {
        Message::Binary(data) => Incoming::Payload(data),
        Message::Text(text) => {
            if let Ok(ctrl) = ControlMessage::from_json(&text) {
                Incoming::Control(ctrl)
            } else if let Ok(result) = serde_json::from_str(&text) {
                Incoming::Result(result)
            } else {
                trace!("unrecognised text message: {text}");
                Incoming::Unrecognised
            }
        }
    }
}

async fn next<R: DeserializeOwned>(channel: &Channel) -> anyhow::Result<Incoming<R>> {
    match channel.recv_timeout(IDLE_TIMEOUT).await {
        Ok(msg) => Ok(classify(msg)),
        Err(ChannelError::Timeout) => Err(anyhow!("server went quiet")),
        Err(ChannelError::Closed) => Err(anyhow!("connection closed before the result arrived")),
        Err(e) => Err(e.into()),
    }
}

/// Answers the server's latency probes until it reports the result
pub async fn answer_pings(channel: &Channel) -> anyhow::Result<PingResult> {
    loop {
        match next::<PingResult>(channel).await? {
            Incoming::Control(ControlMessage::Ping {
                timestamp,
                sequence,
            }) => {
                trace!("pong {sequence}");
                channel
                    .send_control(&ControlMessage::Pong {
                        timestamp,
                        sequence,
                    })
                    .await
                    .context("failed to answer ping")?;
            }
            Incoming::Result(result) => return Ok(result),
            Incoming::Control(ControlMessage::Error { message }) => bail!("server error: {message}"),
            _ => (),
        }
    }
}

/// Asks for a download, then counts the bytes that arrive until the server reports the result
pub async fn sink_download(
    channel: &Channel,
    chunk_size: u64,
    counter: &AtomicU64,
) -> anyhow::Result<DownloadResult> {
    channel
        .send_control(&ControlMessage::Start {
            chunk_size,
            sequence: 0,
        })
        .await
        .context("failed to start download")?;
    loop {
        match next::<DownloadResult>(channel).await? {
            Incoming::Payload(data) => {
                let _ = counter.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Incoming::Result(result) => return Ok(result),
            Incoming::Control(ControlMessage::Error { message }) => bail!("server error: {message}"),
            _ => (),
        }
    }
}

/// Fresh random bytes for every chunk, so nothing on the path can compress or deduplicate them
fn random_chunk(size: usize) -> Bytes {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    data.into()
}

/// Uploads random data in the chunk size the server asks for.
///
/// After `duration` we send `complete`, then wait for the server to report the result.
/// The server may well finish first.
pub async fn source_upload(
    channel: &Channel,
    duration: Duration,
    counter: &AtomicU64,
) -> anyhow::Result<UploadResult> {
    let mut chunk_size = loop {
        match next::<UploadResult>(channel).await? {
            Incoming::Control(ControlMessage::Start { chunk_size, .. }) => {
                debug!("server asked for chunk size {chunk_size}");
                break clamp_chunk_size(chunk_size);
            }
            Incoming::Result(result) => return Ok(result),
            Incoming::Control(ControlMessage::Error { message }) => bail!("server error: {message}"),
            _ => (),
        }
    };

    let deadline = Instant::now() + duration;
    let timer = sleep_until(deadline);
    tokio::pin!(timer);
    let sender = channel.sender();
    let mut sending = true;

    loop {
        tokio::select! {
            biased;
            msg = channel.recv_timeout(IDLE_TIMEOUT) => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(ChannelError::Closed) => bail!("connection closed before the result arrived"),
                    Err(ChannelError::Timeout) => bail!("server went quiet"),
                    Err(e) => return Err(e.into()),
                };
                match classify::<UploadResult>(msg) {
                    Incoming::Control(ControlMessage::ChunkSize { chunk_size: requested, .. }) => {
                        let size = clamp_chunk_size(requested);
                        debug!("chunk size {chunk_size} -> {size}");
                        chunk_size = size;
                    }
                    Incoming::Result(result) => return Ok(result),
                    Incoming::Control(ControlMessage::Error { message }) => {
                        bail!("server error: {message}");
                    }
                    _ => (),
                }
            }
            () = &mut timer, if sending => {
                sending = false;
                debug!("upload time is up");
                if let Err(e) = sender.send_control(&ControlMessage::Complete).await {
                    debug!("failed to send complete: {e}");
                }
            }
            sent = sender.send(Message::Binary(random_chunk(chunk_size))), if sending => {
                match sent {
                    Ok(()) => {
                        let _ = counter.fetch_add(chunk_size as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // The result may still be on its way
                        debug!("upload stopped: {e}");
                        sending = false;
                    }
                }
            }
        }
    }
}
