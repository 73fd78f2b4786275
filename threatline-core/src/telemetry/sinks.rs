use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use super::{TelemetryError, TelemetryEvent, TelemetryKind, TelemetrySink};

/// Emits each event as a structured `tracing` event under
/// `threatline::telemetry`. Failure kinds are logged at warn.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let record_id = event.record_id.as_ref().map(|id| id.as_str()).unwrap_or("-");
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            TelemetryKind::ValidationFailed
            | TelemetryKind::WriteFailed
            | TelemetryKind::InferenceFailed => warn!(
                target: "threatline::telemetry",
                run_id = %event.run_id,
                kind = event.kind.as_str(),
                stage = event.stage.as_str(),
                record_id,
                offset = event.offset,
                attempt = event.attempt,
                detail,
                "{}", event.kind
            ),
            _ => info!(
                target: "threatline::telemetry",
                run_id = %event.run_id,
                kind = event.kind.as_str(),
                stage = event.stage.as_str(),
                record_id,
                offset = event.offset,
                attempt = event.attempt,
                detail,
                "{}", event.kind
            ),
        }
        Ok(())
    }
}

/// In-process fan-out to any number of subscribers. Events are dropped when
/// nobody is listening; lagging subscribers lose the oldest events.
pub struct BroadcastSink {
    sender: broadcast::Sender<TelemetryEvent>,
    capacity: usize,
}

impl fmt::Debug for BroadcastSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSink")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl BroadcastSink {
    /// Sink whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// New receiver that sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl TelemetrySink for BroadcastSink {
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Append-only JSON Lines file, one event per line, for downstream
/// collectors that tail the file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink").field("path", &self.path).finish()
    }
}

impl JsonlSink {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// File the sink appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for JsonlSink {
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Delivers every event to each inner sink. One sink failing does not stop
/// delivery to the rest; the first error is reported.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutSink {
    /// Fan-out over `sinks`, delivered in order.
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    /// Adds another destination.
    pub fn push(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl TelemetrySink for FanoutSink {
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.accept(event.clone()).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
