//! Settings model and file parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use threatline_core::PipelineConfig;
use threatline_core::adapters::HttpInferenceConfig;
use url::Url;

/// Where the base settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    /// No file or inline settings were found.
    #[default]
    Default,
    /// Path passed to the loader explicitly (e.g. `--config`).
    Explicit(PathBuf),
    /// `$THREATLINE_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// `$THREATLINE_CONFIG_JSON`.
    EnvInline,
    /// One of the well-known file locations in the working directory.
    File(PathBuf),
}

impl fmt::Display for SettingsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsSource::Default => f.write_str("built-in defaults"),
            SettingsSource::Explicit(path) => write!(f, "{}", path.display()),
            SettingsSource::EnvPath(path) => {
                write!(f, "{} (THREATLINE_CONFIG_PATH)", path.display())
            }
            SettingsSource::EnvInline => f.write_str("THREATLINE_CONFIG_JSON"),
            SettingsSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Everything an ingestion run needs besides its input.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Batch sizing, concurrency, retry policy, schema and feature layout.
    pub pipeline: PipelineConfig,
    /// Model endpoint.
    pub inference: InferenceSettings,
    /// Record store backend.
    pub store: StoreSettings,
    /// Optional event file.
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Parses `contents` read from `path`, picking the format from the
    /// extension and falling back to content sniffing.
    pub fn parse_file(path: &Path, contents: &str) -> anyhow::Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(contents)
                .with_context(|| format!("invalid settings {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(contents).map_err(|err| {
                anyhow!("invalid settings {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(contents, &path.display().to_string()),
        }
    }

    /// Parses TOML, falling back to JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse settings {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    /// Parses a JSON payload such as `$THREATLINE_CONFIG_JSON`.
    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid settings json: {err}"))
    }

    /// Adapter config for the model endpoint, if inference is enabled and an
    /// endpoint is configured.
    pub fn http_inference(&self) -> Option<HttpInferenceConfig> {
        if !self.inference.enabled {
            return None;
        }
        let endpoint = self.inference.endpoint.clone()?;
        Some(HttpInferenceConfig {
            endpoint,
            model_version: self.inference.model_version.clone(),
            connect_timeout_ms: self.inference.connect_timeout_ms,
        })
    }
}

/// Model endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// When false, records are stored without scoring and left for a later
    /// `resume`; no endpoint is needed.
    pub enabled: bool,
    /// Prediction URL. Required for `ingest` while inference is enabled;
    /// `canonical-id` runs without it.
    pub endpoint: Option<Url>,
    /// Recorded next to every score so results stay attributable.
    pub model_version: String,
    /// TCP connect timeout (ms).
    pub connect_timeout_ms: u64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            model_version: "unversioned".to_string(),
            connect_timeout_ms: 2_000,
        }
    }
}

/// Which [`RecordStore`](threatline_core::RecordStore) to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local map; records vanish with the process.
    #[default]
    Memory,
    /// PostgreSQL; needs the `postgres` feature and a database URL.
    Postgres,
}

impl StoreBackend {
    /// Settings spelling of the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Record store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Backend to open.
    pub backend: StoreBackend,
    /// Connection string for the postgres backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Pool size for the postgres backend.
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

/// Telemetry output settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Append every telemetry event as one JSON line to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,
}
