// Instant rate read-out
// (c) 2024 Ross Younger

//! # Rationale
//! The server reports the authoritative figures at the end of each test.
//! While a test is running, this shows the near-instant rate over the last second
//! on a spinner, so the user can see the path's behaviour as it happens (spikes and all).

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use human_repr::HumanThroughput as _;
use indicatif::ProgressBar;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{trace, warn};

/// Convenience wrapper for `InstaMeter` that takes care of starting & stopping
#[derive(Debug)]
pub(crate) struct InstaMeterRunner {
    inner: Option<InstaMeter>,
    task: Option<JoinHandle<()>>,
    stopper: Option<oneshot::Sender<()>>,
}

impl InstaMeterRunner {
    pub(crate) fn new(label: &str, source: Arc<AtomicU64>, destination: ProgressBar) -> Self {
        Self {
            inner: Some(InstaMeter::new(label, source, destination)),
            task: None,
            stopper: None,
        }
    }

    pub(crate) fn start(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return; // already started
        };
        let (tx, mut rx) = oneshot::channel();
        self.stopper = Some(tx);
        self.task = Some(tokio::spawn(async move {
            let interval = Duration::from_secs(1);
            let mut earlier = Instant::now();
            loop {
                let sleep = tokio::time::sleep(interval);
                tokio::pin!(sleep);
                tokio::select! {
                    () = &mut sleep => (), // we woke up, continue
                    _ = &mut rx => break, // we've been signalled to stop
                }

                let now = Instant::now();
                let msg = inner.update(now - earlier);
                trace!("{msg}");
                earlier = now;
            }
        }));
    }

    pub(crate) async fn stop(&mut self) {
        let Some(tx) = self.stopper.take() else {
            return; // nothing to do
        };
        if tx.send(()).is_err() {
            warn!("failed to notify meter to stop");
            return;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await.inspect_err(|e| warn!("meter task panicked: {e}"));
        }
    }
}

impl Drop for InstaMeterRunner {
    fn drop(&mut self) {
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

/// Near-instant rate meter.
/// Reads a byte counter that someone else is advancing, and writes the rate to a `ProgressBar`.
#[derive(Debug)]
struct InstaMeter {
    label: String,
    previous: u64,
    source: Arc<AtomicU64>,
    destination: ProgressBar,
}

impl InstaMeter {
    fn new(label: &str, source: Arc<AtomicU64>, destination: ProgressBar) -> Self {
        Self {
            label: label.to_owned(),
            previous: 0,
            source,
            destination,
        }
    }

    #[must_use]
    fn update(&mut self, elapsed: Duration) -> String {
        let current = self.source.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let bits = current.saturating_sub(self.previous) as f64 * 8.;
        self.previous = current;
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0. { bits / secs } else { 0. };
        let msg = format!("{}, instant rate: {}", self.label, rate.human_throughput("b"));
        self.destination.set_message(msg.clone());
        msg
    }
}
