//! Startup configuration for the implant-facing listener.
//!
//! Loaded once from YAML (path in `HARRIER_CONFIG`, default `config.yaml`).
//! Any load or validation failure is fatal: the listener cannot run with a
//! partial protocol surface.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Transport the listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ListenerKind {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub kind: ListenerKind,
    pub ip: String,
    pub port: u16,
    pub register_path: String,
    pub task_path: String,
    pub result_path: String,
    pub reconnect_path: String,
    #[serde(default)]
    pub ssl_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub ssl_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImplantConfig {
    /// Expected `User-Agent` shibboleth.
    pub user_agent: String,
    /// Expected `X-Correlation-ID` shibboleth.
    pub http_allow_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listener: ListenerConfig,
    pub implant: ImplantConfig,
    #[serde(default)]
    pub files: FilesConfig,
    /// Take the observed external IP from `X-Forwarded-For` instead of the
    /// socket peer address.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path from `HARRIER_CONFIG`, falling back to
    /// `config.yaml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HARRIER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("register_path", &self.listener.register_path),
            ("task_path", &self.listener.task_path),
            ("result_path", &self.listener.result_path),
            ("reconnect_path", &self.listener.reconnect_path),
        ] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-root path starting with '/', got {path:?}"
                )));
            }
            if path.ends_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not end with '/', got {path:?}"
                )));
            }
        }

        if self.implant.user_agent.is_empty() {
            return Err(ConfigError::Invalid("implant.user_agent is empty".into()));
        }
        if self.implant.http_allow_key.is_empty() {
            return Err(ConfigError::Invalid(
                "implant.http_allow_key is empty".into(),
            ));
        }

        if self.listener.kind == ListenerKind::Https
            && (self.listener.ssl_cert_path.is_none() || self.listener.ssl_key_path.is_none())
        {
            return Err(ConfigError::Invalid(
                "HTTPS listener requires ssl_cert_path and ssl_key_path".into(),
            ));
        }

        Ok(())
    }
}
