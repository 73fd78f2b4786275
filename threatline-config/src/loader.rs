//! Settings resolution across files and the environment.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Settings, SettingsSource};
use crate::sources::EnvConfig;
use crate::validation::{self, ConfigGuardRailError};

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "threatline.toml",
    "threatline.json",
    "config/threatline.toml",
    "config/threatline.json",
];

/// Knobs for [`ConfigLoader`].
#[derive(Debug, Clone)]
pub struct ConfigLoaderOptions {
    /// Settings file that wins over every environment source.
    pub config_path: Option<PathBuf>,
    /// `.env` file to read instead of the one in the working directory.
    pub env_file: Option<PathBuf>,
    /// Directory the default file locations are resolved against.
    pub search_dir: Option<PathBuf>,
    /// Enforce a configured inference endpoint.
    pub require_inference: bool,
}

impl Default for ConfigLoaderOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            env_file: None,
            search_dir: None,
            require_inference: true,
        }
    }
}

/// Resolves [`Settings`] in this order:
///
/// 1. an explicit path ([`ConfigLoader::with_config_path`])
/// 2. `$THREATLINE_CONFIG_PATH` (TOML or JSON file)
/// 3. `$THREATLINE_CONFIG_JSON` (inline JSON)
/// 4. `threatline.toml`, `threatline.json`, `config/threatline.{toml,json}`
/// 5. built-in defaults
///
/// Single-variable overrides from [`EnvConfig`] are applied on top, then the
/// guard rails run.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvConfig>,
}

/// Loaded settings plus where they came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// Validated settings.
    pub settings: Settings,
    /// Origin of the base settings.
    pub source: SettingsSource,
    /// Whether a `.env` file was found and read.
    pub env_file_loaded: bool,
}

impl ConfigLoader {
    /// Loader with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with explicit options.
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options, env: None }
    }

    /// Reads settings from `path`, ignoring every other base source.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Reads `.env` overrides from `path`.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Resolves the default file locations against `dir`.
    pub fn with_search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.options.search_dir = Some(dir.into());
        self
    }

    /// Whether an inference endpoint must be configured.
    pub fn require_inference(mut self, required: bool) -> Self {
        self.options.require_inference = required;
        self
    }

    /// Uses `env` instead of reading the process environment. No `.env`
    /// file is loaded in that case.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    /// Resolves, overrides and validates the settings.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env, env_file_loaded) = match &self.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather()?, loaded)
            }
        };

        let (mut settings, source) = self.load_base(&env)?;
        env.apply(&mut settings);
        validation::validate(&settings, self.options.require_inference)?;

        info!(
            target: "threatline::config",
            source = %source,
            env_file_loaded,
            store = %settings.store.backend,
            batch_size = settings.pipeline.batch_size,
            max_concurrency = settings.pipeline.max_concurrency,
            "settings loaded"
        );

        Ok(ConfigLoad {
            settings,
            source,
            env_file_loaded,
        })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        result.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err.into()),
        })
    }

    fn load_base(&self, env: &EnvConfig) -> Result<(Settings, SettingsSource), ConfigLoadError> {
        if let Some(path) = &self.options.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let settings = read_settings(path)?;
            return Ok((settings, SettingsSource::Explicit(path.clone())));
        }

        if let Some(path) = &env.config_path {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            let settings = read_settings(path)?;
            return Ok((settings, SettingsSource::EnvPath(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let settings = Settings::parse_json(raw).map_err(|err| ConfigLoadError::Parse {
                origin: "THREATLINE_CONFIG_JSON".to_string(),
                message: format!("{err:#}"),
            })?;
            return Ok((settings, SettingsSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let settings = read_settings(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        debug!(target: "threatline::config", "no settings file found; using defaults");
        Ok((Settings::default(), SettingsSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        let base = self.options.search_dir.as_deref().unwrap_or(Path::new(""));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.exists())
    }
}

fn read_settings(path: &Path) -> Result<Settings, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;
    Settings::parse_file(path, &contents).map_err(|err| ConfigLoadError::Parse {
        origin: path.display().to_string(),
        message: format!("{err:#}"),
    })
}

/// Why settings could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly named file is missing.
    #[error("config file {path} does not exist")]
    MissingConfig {
        /// File that was asked for.
        path: PathBuf,
    },
    /// A settings file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Neither parser accepted the settings.
    #[error("failed to parse settings from {origin}: {message}")]
    Parse {
        /// File path or variable name.
        origin: String,
        /// Parser output.
        message: String,
    },
    /// An override variable holds an unparsable value.
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidEnv {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
        /// Parser output.
        reason: String,
    },
    /// Loaded settings failed a guard rail.
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    /// The `.env` file could not be read.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
