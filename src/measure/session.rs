//! Throughput session
// (c) 2024 Ross Younger
//!
//! A session runs one directional throughput test over a [`Channel`]:
//!
//! * up to [`MAX_STREAMS`] worker tasks move chunks, each counting what it moved into a
//!   shared [`SessionState`];
//! * a control tick adapts chunk size and stream count to the observed throughput, and
//!   stops the session early once throughput has stabilised;
//! * the deadline, the stability stop and (for uploads) the peer's `complete` message all
//!   feed a single cancellation token.
//!
//! Workers check the token between chunks; the session waits for every worker it started to
//! finish its chunk before computing the result.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore as _;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::rate::{
    clamp_chunk_size, final_throughput, optimal_stream_count, progressive_chunk_size,
    speed_change_ratio, throughput_mbps, FinalThroughput, MAX_CHUNK_SIZE, MAX_STREAMS,
    MIN_CHUNK_SIZE,
};
use super::result::{unix_timestamp, DownloadResult, StopReason, ThroughputResult, UploadResult};
use super::stats::{is_stable, variance};
use crate::channel::{Channel, ChannelError, ChannelReceiver, ChannelSender, Message};
use crate::protocol::control::ControlMessage;

/// Hard time limit of a session
pub const TEST_DURATION: Duration = Duration::from_secs(10);
/// Early stop is not considered before this much time has passed
pub const MIN_DURATION_BEFORE_EARLY_STOP: Duration = Duration::from_secs(3);
/// Period of the control tick
pub const CONTROL_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum spacing of throughput samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Number of recent samples considered by the stability test
pub const RECENT_WINDOW: usize = 5;
/// Coefficient of variation at or below which throughput is considered stable
pub const MAX_VARIATION: f64 = 0.10;

/// Limit on sending a control message mid-session
const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(2);
/// How long workers get to finish their last chunk once the session has stopped
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Which way the payload flows, from the server's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Server sends, peer receives
    Download,
    /// Peer sends, server receives
    Upload,
}

/// One throughput reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Megabits per second, averaged since the start of the session
    pub mbps: f64,
    /// Order in which the sample was taken
    pub sequence: u64,
}

/// The part of the session state that lives behind the lock
#[derive(Debug)]
struct Shared {
    chunk_size: usize,
    stream_count: usize,
    current_mbps: f64,
    previous_mbps: f64,
    recent: VecDeque<Sample>,
    all: Vec<Sample>,
    last_sample_at: Option<Instant>,
    next_sequence: u64,
    stop_reason: Option<StopReason>,
}

/// What the control tick decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Throughput has stabilised; stop now
    Stable,
    /// Carry on, with a new chunk size if it changed
    Continue { new_chunk_size: Option<usize> },
}

/// State shared between the workers and the control tick of one session
#[derive(Debug)]
pub struct SessionState {
    started: Instant,
    total_bytes: AtomicU64,
    chunks: AtomicU64,
    first_byte: OnceLock<Instant>,
    shared: Mutex<Shared>,
}

impl SessionState {
    /// Creates the state for a session starting now, with one stream
    #[must_use]
    pub fn new(initial_chunk_size: u64) -> Self {
        Self {
            started: Instant::now(),
            total_bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            first_byte: OnceLock::new(),
            shared: Mutex::new(Shared {
                chunk_size: clamp_chunk_size(initial_chunk_size),
                stream_count: 1,
                current_mbps: 0.,
                previous_mbps: 0.,
                recent: VecDeque::with_capacity(RECENT_WINDOW + 1),
                all: Vec::new(),
                last_sample_at: None,
                next_sequence: 0,
                stop_reason: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panicking worker must not wedge the rest of the session
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payload bytes moved so far
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Current chunk size
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.lock().chunk_size
    }

    /// Current target stream count
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.lock().stream_count
    }

    /// Accounts for a chunk moved by a worker, and takes a throughput sample if one is due
    pub fn record_transfer(&self, len: usize) {
        if len == 0 {
            return;
        }
        let now = Instant::now();
        let _ = self.first_byte.get_or_init(|| now);
        let len = len as u64;
        let total = self.total_bytes.fetch_add(len, Ordering::Relaxed) + len;
        let _ = self.chunks.fetch_add(1, Ordering::Relaxed);

        let elapsed = now - self.started;
        if elapsed.is_zero() {
            return;
        }
        let mbps = throughput_mbps(total, elapsed);
        let mut shared = self.lock();
        shared.current_mbps = mbps;
        let due = shared
            .last_sample_at
            .map_or(true, |last| now - last >= SAMPLE_INTERVAL);
        if due {
            let sample = Sample {
                mbps,
                sequence: shared.next_sequence,
            };
            shared.next_sequence += 1;
            shared.last_sample_at = Some(now);
            shared.all.push(sample);
            shared.recent.push_back(sample);
            while shared.recent.len() > RECENT_WINDOW {
                let _ = shared.recent.pop_front();
            }
        }
    }

    /// Records why the session is stopping. The first reason given wins.
    fn stop(&self, reason: StopReason) {
        let _ = self.lock().stop_reason.get_or_insert(reason);
    }

    /// One run of the control algorithm.
    ///
    /// Chunk size and stream count are read and written together under the lock.
    fn control_tick(&self, elapsed: Duration) -> Tick {
        let mut shared = self.lock();
        if elapsed >= MIN_DURATION_BEFORE_EARLY_STOP {
            let window: Vec<f64> = shared.recent.iter().map(|s| s.mbps).collect();
            if is_stable(&window, RECENT_WINDOW, MAX_VARIATION) {
                info!(
                    throughput = shared.current_mbps,
                    elapsed = ?elapsed,
                    "throughput stabilised, stopping early"
                );
                return Tick::Stable;
            }
        }

        let change = speed_change_ratio(shared.current_mbps, shared.previous_mbps);
        let chunk_size =
            progressive_chunk_size(MIN_CHUNK_SIZE, shared.chunk_size, MAX_CHUNK_SIZE, change);
        let stream_count = optimal_stream_count(shared.current_mbps).min(MAX_STREAMS);
        let mut new_chunk_size = None;
        if chunk_size != shared.chunk_size || stream_count != shared.stream_count {
            info!(
                old_chunk_size = shared.chunk_size,
                new_chunk_size = chunk_size,
                old_streams = shared.stream_count,
                new_streams = stream_count,
                throughput = shared.current_mbps,
                speed_change = change,
                "adapting"
            );
            if chunk_size != shared.chunk_size {
                new_chunk_size = Some(chunk_size);
            }
            shared.chunk_size = chunk_size;
            shared.stream_count = stream_count;
        }
        shared.previous_mbps = shared.current_mbps;
        Tick::Continue { new_chunk_size }
    }

    /// Computes the final result
    fn finish(&self, direction: Direction) -> ThroughputResult {
        let bytes = self.total_bytes();
        let FinalThroughput {
            mbps,
            duration,
            clamped,
        } = final_throughput(bytes, self.started.elapsed());
        if clamped {
            warn!("{direction} throughput exceeded the plausible maximum and was clamped; are both ends on the same host?");
        }
        let ttfb = self
            .first_byte
            .get()
            .map_or(0., |t| (*t - self.started).as_secs_f64() * 1000.);
        let shared = self.lock();
        let samples: Vec<f64> = shared.all.iter().map(|s| s.mbps).collect();
        ThroughputResult {
            throughput: mbps,
            bytes,
            duration,
            ttfb: (direction == Direction::Download).then_some(ttfb),
            speed_variance: variance(&samples),
            speed_samples: samples,
            timestamp: unix_timestamp(),
            clamped,
            stop_reason: shared.stop_reason.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Why a worker returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    /// The session stopped or the deadline passed
    Stopped,
    /// The stream count dropped below this worker's slot
    Retired,
    /// The channel failed
    Failed,
    /// The peer said it had finished
    PeerComplete,
}

/// Generates a chunk of random bytes, so nothing on the path can compress or cache it
fn random_chunk(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

async fn send_chunks(
    slot: usize,
    state: Arc<SessionState>,
    sender: ChannelSender,
    token: CancellationToken,
    deadline: Instant,
) -> WorkerExit {
    loop {
        if token.is_cancelled() || Instant::now() >= deadline {
            return WorkerExit::Stopped;
        }
        let (chunk_size, stream_count) = {
            let shared = state.lock();
            (shared.chunk_size, shared.stream_count)
        };
        if slot >= stream_count {
            return WorkerExit::Retired;
        }
        if let Err(e) = sender.send(Message::Binary(random_chunk(chunk_size))).await {
            debug!("stream {slot}: send failed: {e}");
            return WorkerExit::Failed;
        }
        state.record_transfer(chunk_size);
    }
}

async fn receive_chunks(
    slot: usize,
    state: Arc<SessionState>,
    receiver: ChannelReceiver,
    token: CancellationToken,
    deadline: Instant,
) -> WorkerExit {
    loop {
        if slot >= state.stream_count() {
            return WorkerExit::Retired;
        }
        let msg = tokio::select! {
            () = token.cancelled() => return WorkerExit::Stopped,
            msg = receiver.recv_until(deadline) => msg,
        };
        match msg {
            Ok(Message::Binary(data)) => state.record_transfer(data.len()),
            Ok(msg) => match msg.as_control() {
                Some(ControlMessage::Complete) => {
                    debug!("stream {slot}: peer completed");
                    state.stop(StopReason::PeerComplete);
                    token.cancel();
                    return WorkerExit::PeerComplete;
                }
                other => trace!("stream {slot}: ignoring {other:?}"),
            },
            Err(ChannelError::Timeout) => return WorkerExit::Stopped,
            Err(e) => {
                debug!("stream {slot}: receive failed: {e}");
                return WorkerExit::Failed;
            }
        }
    }
}

/// Tracks exactly the workers one session started
#[derive(Debug)]
struct WorkerPool {
    tasks: JoinSet<(usize, WorkerExit)>,
    active: [bool; MAX_STREAMS],
    failed: bool,
}

impl WorkerPool {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            active: [false; MAX_STREAMS],
            failed: false,
        }
    }

    /// Starts workers for any vacant slot below `target`.
    /// Workers above the target retire by themselves.
    /// Nothing new is started once any worker has failed.
    fn reconcile<F, Fut>(&mut self, target: usize, mut spawn: F)
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = WorkerExit> + Send + 'static,
    {
        if self.failed {
            return;
        }
        for slot in 0..target.min(MAX_STREAMS) {
            if !self.active[slot] {
                self.active[slot] = true;
                let worker = spawn(slot);
                let _ = self.tasks.spawn(async move { (slot, worker.await) });
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Books a finished worker
    fn finished(&mut self, joined: Result<(usize, WorkerExit), tokio::task::JoinError>) {
        match joined {
            Ok((slot, exit)) => {
                trace!("stream {slot} exited: {exit:?}");
                self.active[slot] = false;
                if exit == WorkerExit::Failed {
                    self.failed = true;
                }
            }
            Err(e) => {
                warn!("stream task failed: {e}");
                self.failed = true;
            }
        }
    }

    /// Waits for every worker to finish its current chunk
    async fn drain(&mut self) {
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(joined) = self.tasks.join_next().await {
                self.finished(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!("abandoning {} stuck streams", self.tasks.len());
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

/// One directional throughput test
#[derive(Debug)]
pub struct ThroughputSession {
    direction: Direction,
    initial_chunk_size: u64,
}

impl ThroughputSession {
    /// Constructor. The chunk size is clamped into the supported range when the session starts.
    #[must_use]
    pub fn new(direction: Direction, initial_chunk_size: u64) -> Self {
        Self {
            direction,
            initial_chunk_size,
        }
    }

    /// Runs the session to completion.
    ///
    /// Never fails. If the opening handshake of an upload cannot be sent, the result is all zero.
    pub async fn run(&self, channel: &Channel) -> ThroughputResult {
        let state = Arc::new(SessionState::new(self.initial_chunk_size));
        let token = CancellationToken::new();
        let deadline = state.started + TEST_DURATION;
        let direction = self.direction;
        let sender = channel.sender();
        let receiver = channel.receiver();

        if direction == Direction::Upload {
            let start = ControlMessage::Start {
                chunk_size: state.chunk_size() as u64,
                sequence: 0,
            };
            if let Err(e) = sender.send_control(&start).await {
                warn!("failed to start upload: {e}");
                return ThroughputResult::zero();
            }
        }
        debug!(
            "{direction} session starting with chunk size {}",
            state.chunk_size()
        );

        let spawn = |slot: usize| {
            let state = state.clone();
            let token = token.clone();
            let sender = sender.clone();
            let receiver = receiver.clone();
            async move {
                match direction {
                    Direction::Download => send_chunks(slot, state, sender, token, deadline).await,
                    Direction::Upload => {
                        receive_chunks(slot, state, receiver, token, deadline).await
                    }
                }
            }
        };

        let mut pool = WorkerPool::new();
        pool.reconcile(state.stream_count(), spawn);

        let mut ticker = interval_at(state.started + CONTROL_INTERVAL, CONTROL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = &mut timer => {
                    state.stop(StopReason::Deadline);
                    break;
                }
                _ = ticker.tick() => {
                    match state.control_tick(state.started.elapsed()) {
                        Tick::Stable => {
                            state.stop(StopReason::Stable);
                            break;
                        }
                        Tick::Continue { new_chunk_size } => {
                            if direction == Direction::Upload {
                                if let Some(size) = new_chunk_size {
                                    request_chunk_size(&sender, size, &state).await;
                                }
                            }
                            pool.reconcile(state.stream_count(), spawn);
                        }
                    }
                }
                Some(joined) = pool.tasks.join_next() => {
                    pool.finished(joined);
                    if pool.is_empty() && pool.failed {
                        warn!("all {direction} streams failed");
                        state.stop(StopReason::TransportFailure);
                        break;
                    }
                }
            }
        }
        token.cancel();
        pool.drain().await;

        let result = state.finish(direction);
        info!(
            throughput = result.throughput,
            bytes = result.bytes,
            duration = result.duration,
            stop_reason = %result.stop_reason,
            "{direction} test completed"
        );
        result
    }
}

/// Asks the uploading peer to change chunk size
async fn request_chunk_size(sender: &ChannelSender, size: usize, state: &SessionState) {
    let msg = ControlMessage::ChunkSize {
        chunk_size: size as u64,
        sequence: state.chunks.load(Ordering::Relaxed),
    };
    match tokio::time::timeout(CONTROL_SEND_TIMEOUT, sender.send_control(&msg)).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => warn!("failed to send chunk size update: {e}"),
        Err(_) => warn!("timed out sending chunk size update"),
    }
}

/// Runs a download session: we send, the peer receives
pub async fn run_download(channel: &Channel, initial_chunk_size: u64) -> DownloadResult {
    ThroughputSession::new(Direction::Download, initial_chunk_size)
        .run(channel)
        .await
}

/// Runs an upload session: the peer sends, we receive
pub async fn run_upload(channel: &Channel, initial_chunk_size: u64) -> UploadResult {
    ThroughputSession::new(Direction::Upload, initial_chunk_size)
        .run(channel)
        .await
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assertables::assert_in_delta;
    use tokio::task::JoinHandle;
    use tokio::time::{advance, Instant};

    use super::{run_download, run_upload, SessionState, Tick, RECENT_WINDOW};
    use crate::channel::{Channel, Message};
    use crate::measure::rate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
    use crate::measure::result::StopReason;
    use crate::protocol::control::ControlMessage;

    const CHUNK: u64 = 256 * 1024;

    #[allow(clippy::cast_precision_loss)]
    fn transfer_time(len: usize, mbps: f64) -> Duration {
        Duration::from_secs_f64(len as f64 * 8. / (mbps * 1e6))
    }

    /// Consumes binary messages at `rate(elapsed)` megabits per second until the channel closes
    fn paced_sink<R>(peer: Channel, rate: R) -> JoinHandle<u64>
    where
        R: Fn(Duration) -> f64 + Send + 'static,
    {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut total = 0;
            while let Ok(msg) = peer.recv().await {
                if let Message::Binary(data) = msg {
                    total += data.len() as u64;
                    tokio::time::sleep(transfer_time(data.len(), rate(started.elapsed()))).await;
                }
            }
            total
        })
    }

    /// A link that carries `peak_mbps` for `burst` in every `period`, starting `offset` in,
    /// and nothing the rest of the time
    #[derive(Debug, Clone, Copy)]
    struct BurstyLink {
        offset: Duration,
        burst: Duration,
        period: Duration,
        peak_mbps: f64,
    }

    impl BurstyLink {
        /// When `len` bytes offered at `at` (seconds since the start) have crossed the link
        #[allow(clippy::cast_precision_loss)]
        fn finish(&self, at: f64, len: usize) -> f64 {
            let (offset, burst, period) = (
                self.offset.as_secs_f64(),
                self.burst.as_secs_f64(),
                self.period.as_secs_f64(),
            );
            let bits_per_sec = self.peak_mbps * 1e6;
            let mut bits = len as f64 * 8.;
            let mut cycle = ((at - offset) / period).floor();
            loop {
                let start = offset + cycle * period;
                let end = start + burst;
                if at < end {
                    let from = at.max(start);
                    let room = (end - from) * bits_per_sec;
                    if bits <= room {
                        return from + bits / bits_per_sec;
                    }
                    bits -= room;
                }
                cycle += 1.;
            }
        }
    }

    /// Consumes binary messages as fast as `link` allows until the channel closes
    fn bursty_sink(peer: Channel, link: BurstyLink) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut total = 0;
            while let Ok(msg) = peer.recv().await {
                if let Message::Binary(data) = msg {
                    total += data.len() as u64;
                    let done = link.finish(started.elapsed().as_secs_f64(), data.len());
                    tokio::time::sleep_until(started + Duration::from_secs_f64(done)).await;
                }
            }
            total
        })
    }

    /// Uploads at a steady `mbps`, honouring chunk size requests,
    /// and sends `complete` after `complete_after` if given
    fn paced_source(
        peer: Channel,
        mbps: f64,
        complete_after: Option<Duration>,
    ) -> JoinHandle<Vec<u64>> {
        tokio::spawn(async move {
            let mut requested = Vec::new();
            let Ok(msg) = peer.recv().await else {
                return requested;
            };
            let Some(ControlMessage::Start { chunk_size, .. }) = msg.as_control() else {
                panic!("expected start, got {msg:?}");
            };
            let mut chunk_size = chunk_size;
            let started = Instant::now();
            loop {
                if complete_after.is_some_and(|d| started.elapsed() >= d) {
                    let _ = peer.send_control(&ControlMessage::Complete).await;
                    break;
                }
                while let Ok(Ok(msg)) = tokio::time::timeout(Duration::ZERO, peer.recv()).await {
                    if let Some(ControlMessage::ChunkSize { chunk_size: n, .. }) = msg.as_control()
                    {
                        requested.push(n);
                        chunk_size = n;
                    }
                }
                let len = usize::try_from(chunk_size).unwrap();
                if peer
                    .send(Message::Binary(vec![0u8; len].into()))
                    .await
                    .is_err()
                {
                    return requested;
                }
                tokio::time::sleep(transfer_time(len, mbps)).await;
            }
            // stay connected until the session hangs up
            while peer.recv().await.is_ok() {}
            requested
        })
    }

    #[tokio::test(start_paused = true)]
    async fn steady_download_stops_early() {
        let (ours, theirs) = Channel::pair(1);
        let sink = paced_sink(theirs, |_| 50.);
        let result = run_download(&ours, CHUNK).await;
        drop(ours);
        let received = sink.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Stable);
        assert_in_delta!(result.duration, 3., 0.5);
        assert_in_delta!(result.throughput, 50., 5.);
        #[allow(clippy::cast_precision_loss)]
        let bytes = result.bytes as f64;
        assert_in_delta!(bytes, result.throughput * result.duration * 1e6 / 8., 1.);
        assert_eq!(received, result.bytes);
        assert!(result.speed_samples.len() >= RECENT_WINDOW);
        assert!(result.ttfb.is_some_and(|t| t < 100.));
        assert!(!result.clamped);
    }

    #[tokio::test(start_paused = true)]
    async fn accelerating_download_runs_to_deadline() {
        let (ours, theirs) = Channel::pair(1);
        // 0.5 Mbps, doubling every second
        let sink = paced_sink(theirs, |t| 0.5 * 2f64.powf(t.as_secs_f64().floor()));
        let result = run_download(&ours, MIN_CHUNK_SIZE as u64).await;
        drop(ours);
        let _ = sink.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Deadline);
        assert!(result.duration >= 10., "{}", result.duration);
        assert!(result.duration < 12., "{}", result.duration);
        assert!(result.throughput > 10., "{}", result.throughput);
        assert!(result.speed_variance > 0.);
    }

    #[tokio::test(start_paused = true)]
    async fn bursty_download_runs_to_deadline() {
        let (ours, theirs) = Channel::pair(1);
        // 250 Mbps for one second in every four, from 2s: 50 Mbps on average, never steady
        let link = BurstyLink {
            offset: Duration::from_secs(2),
            burst: Duration::from_secs(1),
            period: Duration::from_secs(4),
            peak_mbps: 250.,
        };
        let sink = bursty_sink(theirs, link);
        let result = run_download(&ours, CHUNK).await;
        drop(ours);
        let received = sink.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Deadline);
        assert_in_delta!(result.duration, 10., 0.1);
        assert_in_delta!(result.throughput, 50., 5.);
        #[allow(clippy::cast_precision_loss)]
        let bytes = result.bytes as f64;
        assert_in_delta!(bytes, result.throughput * result.duration * 1e6 / 8., 1.);
        assert_eq!(received, result.bytes);
        assert!(result.speed_variance > 0.);
    }

    #[tokio::test(start_paused = true)]
    async fn download_to_vanished_peer() {
        let (ours, theirs) = Channel::pair(1);
        drop(theirs);
        let result = run_download(&ours, CHUNK).await;
        assert_eq!(result.stop_reason, StopReason::TransportFailure);
        assert_eq!(result.bytes, 0);
        assert_eq!(result.throughput, 0.);
        assert_eq!(result.ttfb, Some(0.));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_ends_on_complete() {
        let (ours, theirs) = Channel::pair(4);
        let source = paced_source(theirs, 20., Some(Duration::from_secs(2)));
        let result = run_upload(&ours, CHUNK).await;
        drop(ours);
        let _ = source.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::PeerComplete);
        assert!(result.duration >= 2., "{}", result.duration);
        assert!(result.duration < 2.5, "{}", result.duration);
        assert_in_delta!(result.throughput, 20., 4.);
        assert_eq!(result.ttfb, None);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_upload_stops_early() {
        let (ours, theirs) = Channel::pair(4);
        let source = paced_source(theirs, 50., None);
        let result = run_upload(&ours, CHUNK).await;
        drop(ours);
        let _ = source.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Stable);
        assert_in_delta!(result.duration, 3., 0.5);
        assert_in_delta!(result.throughput, 50., 5.);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_requests_chunk_size_changes() {
        let (ours, theirs) = Channel::pair(4);
        // The source speeds up sharply after a second, so the tick asks for bigger chunks
        let source = tokio::spawn(async move {
            let mut requested = Vec::new();
            let _start = theirs.recv().await.unwrap();
            let started = Instant::now();
            let mut chunk_size = usize::try_from(CHUNK).unwrap();
            loop {
                if started.elapsed() >= Duration::from_secs(4) {
                    let _ = theirs.send_control(&ControlMessage::Complete).await;
                    break;
                }
                while let Ok(Ok(msg)) = tokio::time::timeout(Duration::ZERO, theirs.recv()).await {
                    if let Some(ControlMessage::ChunkSize { chunk_size: n, .. }) = msg.as_control()
                    {
                        requested.push(n);
                        chunk_size = usize::try_from(n).unwrap();
                    }
                }
                if theirs
                    .send(Message::Binary(vec![0u8; chunk_size].into()))
                    .await
                    .is_err()
                {
                    break;
                }
                let mbps = if started.elapsed() < Duration::from_secs(1) {
                    5.
                } else {
                    200.
                };
                tokio::time::sleep(transfer_time(chunk_size, mbps)).await;
            }
            while theirs.recv().await.is_ok() {}
            requested
        });
        let result = run_upload(&ours, CHUNK).await;
        drop(ours);
        let requested = source.await.unwrap();

        assert_eq!(result.stop_reason, StopReason::PeerComplete);
        assert!(!requested.is_empty());
        assert!(requested[0] > CHUNK, "{requested:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn upload_to_vanished_peer() {
        let (ours, theirs) = Channel::pair(1);
        drop(theirs);
        let result = run_upload(&ours, CHUNK).await;
        assert_eq!(result.stop_reason, StopReason::TransportFailure);
        assert_eq!(result.bytes, 0);
        assert_eq!(result.duration, 0.);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_is_throttled_and_bounded() {
        let state = SessionState::new(CHUNK);
        for _ in 0..100 {
            advance(Duration::from_millis(100)).await;
            state.record_transfer(1000);
        }
        assert_eq!(state.total_bytes(), 100_000);
        let shared = state.lock();
        assert_eq!(shared.recent.len(), RECENT_WINDOW);
        // one sample per 500ms over 10s
        assert_eq!(shared.all.len(), 20);
        let sequences: Vec<u64> = shared.all.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn first_byte_is_recorded_once() {
        let state = SessionState::new(CHUNK);
        state.record_transfer(0);
        assert!(state.first_byte.get().is_none());
        advance(Duration::from_millis(20)).await;
        state.record_transfer(10);
        advance(Duration::from_millis(20)).await;
        state.record_transfer(10);
        let first = *state.first_byte.get().unwrap();
        assert_eq!(first - state.started, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_chunk_size_is_clamped() {
        assert_eq!(SessionState::new(1).chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(SessionState::new(u64::MAX).chunk_size(), MAX_CHUNK_SIZE);
        assert_eq!(SessionState::new(1).stream_count(), 1);
    }

    fn with_window(state: &SessionState, values: &[f64]) {
        let mut shared = state.lock();
        for (i, &mbps) in values.iter().enumerate() {
            shared.recent.push_back(super::Sample {
                mbps,
                sequence: i as u64,
            });
        }
        shared.current_mbps = values.last().copied().unwrap_or(0.);
    }

    #[tokio::test(start_paused = true)]
    async fn no_early_stop_before_minimum_duration() {
        let state = SessionState::new(CHUNK);
        with_window(&state, &[100.; 5]);
        assert_ne!(state.control_tick(Duration::from_secs(2)), Tick::Stable);
        assert_eq!(state.control_tick(Duration::from_secs(3)), Tick::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_scales_up_together() {
        let state = SessionState::new(CHUNK);
        with_window(&state, &[100., 300., 600.]);
        state.lock().previous_mbps = 400.;
        let tick = state.control_tick(Duration::from_secs(4));
        assert_eq!(
            tick,
            Tick::Continue {
                new_chunk_size: Some(393_216)
            }
        );
        assert_eq!(state.stream_count(), 4);
        assert_eq!(state.chunk_size(), 393_216);

        // same speed again: nothing changes
        let tick = state.control_tick(Duration::from_secs(5));
        assert_eq!(
            tick,
            Tick::Continue {
                new_chunk_size: None
            }
        );
        assert_eq!(state.stream_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_scales_down() {
        let state = SessionState::new(CHUNK);
        {
            let mut shared = state.lock();
            shared.stream_count = 8;
            shared.previous_mbps = 1200.;
            shared.current_mbps = 90.;
        }
        let tick = state.control_tick(Duration::from_secs(1));
        assert_eq!(
            tick,
            Tick::Continue {
                new_chunk_size: Some(196_608)
            }
        );
        assert_eq!(state.stream_count(), 1);
    }
}
