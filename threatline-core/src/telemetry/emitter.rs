use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TelemetryEvent, TelemetrySink};

/// Non-blocking handle onto the telemetry channel. Cloning is cheap; every
/// clone feeds the same background drain task.
#[derive(Clone)]
pub struct TelemetryEmitter {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<TelemetryEvent>,
    closing: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    failures: Arc<Failures>,
}

/// Drop/failure accounting shared by the handle and the drain task. The first
/// failure is logged at warn; later ones only at debug.
#[derive(Default)]
struct Failures {
    dropped: AtomicU64,
    warned: AtomicBool,
}

impl Failures {
    fn record(&self, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                target: "threatline::telemetry",
                reason,
                "dropping telemetry event; further drops are logged at debug"
            );
        } else {
            debug!(target: "threatline::telemetry", reason, "dropping telemetry event");
        }
    }
}

impl fmt::Debug for TelemetryEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryEmitter")
            .field("capacity", &self.inner.capacity)
            .field("queued", &(self.inner.capacity - self.inner.tx.capacity()))
            .field("dropped", &self.dropped())
            .field("closing", &self.inner.closing.is_cancelled())
            .finish()
    }
}

impl TelemetryEmitter {
    /// Starts the drain task on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn TelemetrySink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let closing = CancellationToken::new();
        let failures = Arc::new(Failures::default());

        let handle = tokio::spawn(drain(rx, sink, closing.clone(), Arc::clone(&failures)));

        Self {
            inner: Arc::new(Inner {
                tx,
                closing,
                worker: Mutex::new(Some(handle)),
                capacity,
                failures,
            }),
        }
    }

    /// Queues `event` for the sink. Never blocks and never fails; a full or
    /// closed channel drops the event.
    pub fn emit(&self, event: TelemetryEvent) {
        match self.inner.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.inner.failures.record("channel full"),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.failures.record("channel closed")
            }
        }
    }

    /// Events dropped because the channel was full or closed, or because the
    /// sink rejected them.
    pub fn dropped(&self) -> u64 {
        self.inner.failures.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting events, delivers what is already queued, and waits for
    /// the drain task to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.closing.cancel();
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(target: "threatline::telemetry", error = %err, "telemetry drain task failed");
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    sink: Arc<dyn TelemetrySink>,
    closing: CancellationToken,
    failures: Arc<Failures>,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(event) => deliver(sink.as_ref(), event, &failures).await,
                None => break,
            },
            _ = closing.cancelled() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    deliver(sink.as_ref(), event, &failures).await;
                }
                break;
            }
        }
    }
}

async fn deliver(sink: &dyn TelemetrySink, event: TelemetryEvent, failures: &Failures) {
    if let Err(err) = sink.accept(event).await {
        failures.record(&err.to_string());
    }
}
