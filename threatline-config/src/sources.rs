//! Environment overrides.

use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

use crate::loader::ConfigLoadError;
use crate::models::{Settings, StoreBackend};

/// Configuration pulled from the process environment.
///
/// Path and inline JSON pick the base [`Settings`]; every other field
/// overrides a single knob after the base has been parsed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvConfig {
    /// `THREATLINE_CONFIG_PATH`
    pub config_path: Option<PathBuf>,
    /// `THREATLINE_CONFIG_JSON`
    pub config_json: Option<String>,
    /// `THREATLINE_BATCH_SIZE`
    pub batch_size: Option<usize>,
    /// `THREATLINE_MAX_CONCURRENCY`
    pub max_concurrency: Option<usize>,
    /// `THREATLINE_MAX_RETRIES`
    pub max_retries: Option<u32>,
    /// `THREATLINE_CALL_TIMEOUT_MS`
    pub call_timeout_ms: Option<u64>,
    /// `THREATLINE_INFERENCE_ENABLED` (`true` or `false`)
    pub inference_enabled: Option<bool>,
    /// `THREATLINE_INFERENCE_URL`
    pub inference_url: Option<Url>,
    /// `THREATLINE_MODEL_VERSION`
    pub model_version: Option<String>,
    /// `THREATLINE_STORE`
    pub store_backend: Option<StoreBackend>,
    /// `DATABASE_URL`
    pub database_url: Option<String>,
    /// `THREATLINE_EVENTS_PATH`
    pub events_path: Option<PathBuf>,
}

impl EnvConfig {
    /// Reads the overrides from the process environment.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the overrides from an arbitrary key lookup. Blank values count
    /// as unset; values that fail to parse are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            config_path: var("THREATLINE_CONFIG_PATH").map(PathBuf::from),
            config_json: var("THREATLINE_CONFIG_JSON"),
            batch_size: parsed(&var, "THREATLINE_BATCH_SIZE")?,
            max_concurrency: parsed(&var, "THREATLINE_MAX_CONCURRENCY")?,
            max_retries: parsed(&var, "THREATLINE_MAX_RETRIES")?,
            call_timeout_ms: parsed(&var, "THREATLINE_CALL_TIMEOUT_MS")?,
            inference_enabled: parsed(&var, "THREATLINE_INFERENCE_ENABLED")?,
            inference_url: parsed(&var, "THREATLINE_INFERENCE_URL")?,
            model_version: var("THREATLINE_MODEL_VERSION"),
            store_backend: parsed(&var, "THREATLINE_STORE")?,
            database_url: var("DATABASE_URL"),
            events_path: var("THREATLINE_EVENTS_PATH").map(PathBuf::from),
        })
    }

    /// Applies the single-knob overrides on top of `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(batch_size) = self.batch_size {
            settings.pipeline.batch_size = batch_size;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            settings.pipeline.max_concurrency = max_concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            settings.pipeline.retry.max_retries = max_retries;
        }
        if let Some(call_timeout_ms) = self.call_timeout_ms {
            settings.pipeline.call_timeout_ms = call_timeout_ms;
        }
        if let Some(enabled) = self.inference_enabled {
            settings.inference.enabled = enabled;
        }
        if let Some(url) = &self.inference_url {
            settings.inference.endpoint = Some(url.clone());
        }
        if let Some(model_version) = &self.model_version {
            settings.inference.model_version = model_version.clone();
        }
        if let Some(backend) = self.store_backend {
            settings.store.backend = backend;
        }
        if let Some(database_url) = &self.database_url {
            settings.store.database_url = Some(database_url.clone());
        }
        if let Some(path) = &self.events_path {
            settings.telemetry.jsonl_path = Some(path.clone());
        }
    }
}

fn parsed<T, V>(var: &V, key: &'static str) -> Result<Option<T>, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|value| {
            value.parse::<T>().map_err(|err| ConfigLoadError::InvalidEnv {
                key,
                value: value.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}
