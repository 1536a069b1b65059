//! Configuration types and loading
//!
//! Config path precedence: `--config` flag > `CONFIG_PATH` env > `apictl.toml`.
//! The login password comes from the API_PASSWORD env var or password_file,
//! never from the TOML itself.

use common::Secret;
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Remote API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// API root including the version prefix, e.g. `https://host/api/v1`
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Where the session's refresh token is persisted
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// File holding the login password (alternative to API_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then resolve the password.
    ///
    /// Password resolution order:
    /// 1. API_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        let url = Url::parse(&config.api.base_url).map_err(|e| common::Error::InvalidUrl {
            url: config.api.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(common::Error::InvalidUrl {
                url: config.api.base_url.clone(),
                reason: "scheme must be http or https".into(),
            });
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if let Ok(password) = std::env::var("API_PASSWORD") {
            config.auth.password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.auth.password_file {
            let password = std::fs::read_to_string(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    password_file.display()
                ))
            })?;
            let password = password.trim_end_matches(['\r', '\n']).to_owned();
            if !password.is_empty() {
                config.auth.password = Some(Secret::new(password));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("apictl.toml")
    }
}
