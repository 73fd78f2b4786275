//! Settings model and loader for Threatline.
//!
//! `threatlinectl` (and anything else embedding the pipeline) resolves its
//! [`Settings`] through [`ConfigLoader`]: a TOML/JSON file or inline JSON
//! provides the base, individual environment variables override single
//! knobs, and the guard rails in [`validation`] reject the result before any
//! store or model connection is opened.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    InferenceSettings, Settings, SettingsSource, StoreBackend, StoreSettings,
    TelemetrySettings,
};
pub use sources::EnvConfig;
pub use validation::ConfigGuardRailError;
