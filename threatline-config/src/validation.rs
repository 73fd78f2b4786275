//! Guard rails applied after loading.

use thiserror::Error;

use crate::models::{Settings, StoreBackend};

/// Settings that parse fine but cannot drive a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    /// The pipeline section is unusable.
    #[error("pipeline: {0}")]
    Pipeline(String),
    /// Inference is enabled but no endpoint is set.
    #[error(
        "inference.endpoint is required (set THREATLINE_INFERENCE_URL, \
         or THREATLINE_INFERENCE_ENABLED=false to store without scoring)"
    )]
    MissingInferenceEndpoint,
    /// The endpoint is not http or https.
    #[error("inference.endpoint must be http or https, got `{0}`")]
    UnsupportedEndpointScheme(String),
    /// Scores would not be attributable to a model.
    #[error("inference.model_version must not be empty")]
    EmptyModelVersion,
    /// The postgres backend has no connection string.
    #[error("store.database_url is required for the postgres backend (set DATABASE_URL)")]
    MissingDatabaseUrl,
    /// The postgres pool would have no connections.
    #[error("store.max_connections must be positive")]
    ZeroConnections,
}

/// Checks `settings` against the rules every run needs. The inference
/// endpoint is only enforced when `require_inference` is set and inference
/// is enabled, so tooling that never calls the model can share the same file.
pub fn validate(settings: &Settings, require_inference: bool) -> Result<(), ConfigGuardRailError> {
    let require_inference = require_inference && settings.inference.enabled;
    settings
        .pipeline
        .validate()
        .map_err(|err| ConfigGuardRailError::Pipeline(err.to_string()))?;

    match &settings.inference.endpoint {
        Some(url) if !matches!(url.scheme(), "http" | "https") => {
            return Err(ConfigGuardRailError::UnsupportedEndpointScheme(
                url.scheme().to_string(),
            ));
        }
        None if require_inference => return Err(ConfigGuardRailError::MissingInferenceEndpoint),
        _ => {}
    }
    if require_inference && settings.inference.model_version.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyModelVersion);
    }

    if settings.store.backend == StoreBackend::Postgres {
        if settings.store.database_url.is_none() {
            return Err(ConfigGuardRailError::MissingDatabaseUrl);
        }
        if settings.store.max_connections == 0 {
            return Err(ConfigGuardRailError::ZeroConnections);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable() -> Settings {
        let mut settings = Settings::default();
        settings.inference.endpoint = Some("https://models.example/predict".parse().unwrap());
        settings
    }

    #[test]
    fn defaults_pass_without_inference() {
        assert_eq!(validate(&Settings::default(), false), Ok(()));
        assert_eq!(
            validate(&Settings::default(), true),
            Err(ConfigGuardRailError::MissingInferenceEndpoint)
        );
        assert_eq!(validate(&runnable(), true), Ok(()));
    }

    #[test]
    fn disabled_inference_needs_no_endpoint() {
        let mut settings = Settings::default();
        settings.inference.enabled = false;
        assert_eq!(validate(&settings, true), Ok(()));
        assert!(settings.http_inference().is_none());

        settings.inference.endpoint = Some("ftp://models.example/predict".parse().unwrap());
        assert_eq!(
            validate(&settings, true),
            Err(ConfigGuardRailError::UnsupportedEndpointScheme("ftp".into()))
        );
    }

    #[test]
    fn pipeline_rules_surface() {
        let mut settings = runnable();
        settings.pipeline.batch_size = 0;
        assert!(matches!(
            validate(&settings, true),
            Err(ConfigGuardRailError::Pipeline(msg)) if msg.contains("batch_size")
        ));

        let mut settings = runnable();
        settings.pipeline.retry.backoff_base_ms = 5_000;
        settings.pipeline.retry.backoff_cap_ms = 1_000;
        assert!(matches!(
            validate(&settings, true),
            Err(ConfigGuardRailError::Pipeline(_))
        ));
    }

    #[test]
    fn postgres_needs_a_url() {
        let mut settings = runnable();
        settings.store.backend = StoreBackend::Postgres;
        assert_eq!(
            validate(&settings, true),
            Err(ConfigGuardRailError::MissingDatabaseUrl)
        );
        settings.store.database_url = Some("postgres://localhost/threatline".into());
        assert_eq!(validate(&settings, true), Ok(()));
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let mut settings = runnable();
        settings.inference.endpoint = Some("ftp://models.example/predict".parse().unwrap());
        assert_eq!(
            validate(&settings, false),
            Err(ConfigGuardRailError::UnsupportedEndpointScheme("ftp".into()))
        );
    }
}
