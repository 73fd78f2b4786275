//! JSON-over-HTTP inference adapter.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::AdapterError;
use crate::features::FeatureVector;
use crate::ports::InferenceAdapter;

/// Connection settings for a model endpoint that speaks
/// `{"instances": [[f32, ..]]}` -> `{"predictions": [score]}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpInferenceConfig {
    /// Prediction URL; receives one POST per record.
    pub endpoint: Url,
    /// Recorded with every score from this endpoint.
    pub model_version: String,
    /// TCP connect timeout (ms). The per-call deadline comes from the
    /// pipeline's `call_timeout_ms`.
    #[serde(default = "HttpInferenceConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl HttpInferenceConfig {
    const fn default_connect_timeout_ms() -> u64 {
        2_000
    }

    /// Config with the default connect timeout.
    pub fn new(endpoint: Url, model_version: impl Into<String>) -> Self {
        Self {
            endpoint,
            model_version: model_version.into(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
        }
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: [&'a [f32]; 1],
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Value>,
}

/// [`InferenceAdapter`] over a reqwest client. 5xx, 429, 408, timeouts, and
/// connection errors are transient; other failures are permanent.
pub struct HttpInferenceAdapter {
    client: reqwest::Client,
    config: HttpInferenceConfig,
}

impl fmt::Debug for HttpInferenceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpInferenceAdapter")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("model_version", &self.config.model_version)
            .finish()
    }
}

impl HttpInferenceAdapter {
    /// Builds the HTTP client; fails only if the TLS backend cannot start.
    pub fn new(config: HttpInferenceConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| AdapterError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Prediction URL.
    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }
}

#[async_trait]
impl InferenceAdapter for HttpInferenceAdapter {
    fn model_version(&self) -> &str {
        &self.config.model_version
    }

    async fn predict(
        &self,
        features: &FeatureVector,
        timeout: Duration,
    ) -> Result<f64, AdapterError> {
        let body = PredictRequest {
            instances: [features.as_slice()],
        };
        let response = self
            .client
            .post(self.config.endpoint.clone())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let payload: PredictResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::permanent(format!("malformed prediction response: {e}")))?;
        let score = extract_score(&payload.predictions)?;
        debug!(
            target: "threatline::inference",
            endpoint = %self.config.endpoint,
            score,
            "prediction received"
        );
        Ok(score)
    }
}

fn classify_transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AdapterError::transient(format!("inference request failed: {err}"))
    } else {
        AdapterError::permanent(format!("inference request failed: {err}"))
    }
}

fn classify_status(status: StatusCode, detail: &str) -> AdapterError {
    let message = if detail.is_empty() {
        format!("inference endpoint returned HTTP {status}")
    } else {
        format!("inference endpoint returned HTTP {status}: {}", truncate(detail, 256))
    };
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        AdapterError::Transient(message)
    } else {
        AdapterError::Permanent(message)
    }
}

/// First prediction is the score. A prediction that is itself a vector of
/// class probabilities contributes its last entry (the positive class).
fn extract_score(predictions: &[Value]) -> Result<f64, AdapterError> {
    let first = predictions
        .first()
        .ok_or_else(|| AdapterError::permanent("prediction response contained no predictions"))?;
    let score = match first {
        Value::Number(n) => n.as_f64(),
        Value::Array(probs) => probs.last().and_then(Value::as_f64),
        _ => None,
    }
    .ok_or_else(|| AdapterError::permanent(format!("prediction `{first}` is not a number")))?;

    if !(0.0..=1.0).contains(&score) {
        return Err(AdapterError::permanent(format!(
            "score {score} is outside [0.0, 1.0]"
        )));
    }
    Ok(score)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
