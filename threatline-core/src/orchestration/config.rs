//! Pipeline configuration and its guard rails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::features::FeatureSpec;
use crate::validation::RecordSchema;

/// Knobs for one ingestion run.
///
/// All fields carry defaults so a partial configuration payload is enough;
/// [`PipelineConfig::validate`] rejects nonsensical combinations before any
/// I/O happens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input items per batch. Batches run one after another.
    pub batch_size: usize,
    /// Records of one batch processed at the same time.
    pub max_concurrency: usize,
    /// Retry/backoff policy shared by store writes and inference calls.
    pub retry: RetryConfig,
    /// Upper bound for every individual adapter call (ms).
    pub call_timeout_ms: u64,
    /// Telemetry channel sizing.
    pub telemetry: TelemetryConfig,
    /// Accepted field names and aliases.
    pub schema: RecordSchema,
    /// Attributes fed to the model, in order.
    pub features: FeatureSpec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrency: 8,
            retry: RetryConfig::default(),
            call_timeout_ms: 5_000,
            telemetry: TelemetryConfig::default(),
            schema: RecordSchema::default(),
            features: FeatureSpec::default(),
        }
    }
}

impl PipelineConfig {
    /// [`call_timeout_ms`](Self::call_timeout_ms) as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Rejects zero sizes, zero timeouts, an inverted backoff range, and
    /// empty schema or feature lists.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::configuration("batch_size must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(PipelineError::configuration(
                "max_concurrency must be positive",
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(PipelineError::configuration(
                "call_timeout_ms must be positive",
            ));
        }
        if self.telemetry.channel_capacity == 0 {
            return Err(PipelineError::configuration(
                "telemetry.channel_capacity must be positive",
            ));
        }
        self.retry.validate()?;
        self.schema.validate().map_err(PipelineError::Configuration)?;
        self.features
            .validate()
            .map_err(PipelineError::Configuration)?;
        Ok(())
    }
}

/// Retry budget and backoff bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry, before jitter (ms).
    pub backoff_base_ms: u64,
    /// Upper bound on the un-jittered delay (ms).
    pub backoff_cap_ms: u64,
}

impl RetryConfig {
    /// Base delay as a `Duration`.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Delay cap as a `Duration`.
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Base must be positive and no larger than the cap.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.backoff_base_ms == 0 {
            return Err(PipelineError::configuration(
                "retry.backoff_base_ms must be positive",
            ));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(PipelineError::configuration(format!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_cap_ms: 10_000,
        }
    }
}

/// Telemetry channel settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Events buffered between the pipeline and the sink before new events
    /// are dropped.
    pub channel_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4_096,
        }
    }
}
