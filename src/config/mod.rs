//! Configuration loading: `config.toml`, then environment overrides, then
//! validation.
//!
//! Environment overrides:
//! - `PARLEY_HOST`, `PARLEY_PORT` → `gateway.host`, `gateway.port`
//! - `PARLEY_CREDENTIAL_SECRET` → `auth.credential_secret`
//! - `PARLEY_API_KEY` or `OPENAI_API_KEY` → `upstream.api_key`
//! - `PARLEY_LOG` → `logging.level`

pub mod schema;

pub use schema::{
    AuthConfig, CaptureConfig, Config, FallbackConfig, GatewayConfig, LoggingConfig,
    ReliabilityConfig, UpstreamConfig,
};

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::reliability::RetryPolicy;

/// Env var naming the config file when `--config` is not given.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `<config dir>/parley/config.toml`, or `./config.toml` when the platform
/// has no config directory.
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "parley", "parley")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

impl Config {
    /// Load from `path`, `$PARLEY_CONFIG` or the default location. A missing
    /// file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse one file without env overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Apply overrides read through `lookup`. Empty values are ignored.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("PARLEY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("PARLEY_PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PARLEY_PORT"),
            }
        }
        if let Some(secret) = get("PARLEY_CREDENTIAL_SECRET") {
            self.auth.credential_secret = Some(secret);
        }
        if let Some(key) = get("PARLEY_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.upstream.api_key = Some(key);
        }
        if let Some(level) = get("PARLEY_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.gateway.host.trim().is_empty() {
            return invalid("gateway.host must not be empty");
        }
        if self.auth.credential_ttl_secs == 0 {
            return invalid("auth.credential_ttl_secs must be greater than 0");
        }
        if let Some(secret) = &self.auth.credential_secret {
            if secret.len() < 16 {
                return invalid("auth.credential_secret must be at least 16 bytes");
            }
        }
        if self.upstream.model.trim().is_empty() {
            return invalid("upstream.model must not be empty");
        }
        let capture = &self.capture;
        if !(capture.silence_threshold > 0.0 && capture.silence_threshold <= 1.0) {
            return invalid("capture.silence_threshold must be in (0, 1]");
        }
        if capture.silence_timeout_ms == 0 {
            return invalid("capture.silence_timeout_ms must be greater than 0");
        }
        if capture.monitor_interval_ms == 0 {
            return invalid("capture.monitor_interval_ms must be greater than 0");
        }
        if capture.monitor_interval_ms >= capture.silence_timeout_ms {
            return invalid("capture.monitor_interval_ms must be shorter than silence_timeout_ms");
        }
        if self.reliability.max_retries > 10 {
            return invalid("reliability.max_retries must be at most 10");
        }
        if self.reliability.max_retries > 0 && self.reliability.base_delay_ms == 0 {
            return invalid("reliability.base_delay_ms must be greater than 0");
        }
        if !RetryPolicy::from(&self.reliability).strictly_increasing() {
            return invalid(
                "reliability.max_delay_ms is reached before the last retry; \
                 lower max_retries or raise max_delay_ms",
            );
        }
        Ok(())
    }

    /// JSON schema of the config file.
    pub fn json_schema() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&schemars::schema_for!(Config))
    }
}
