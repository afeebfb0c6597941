//! Configuration file handling
//!
//! Settings are read from `~/.config/cloudtail/config.toml` (or `--config`).
//! Every key is optional; missing keys fall back to built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use cloudtail_backend::DEFAULT_ENDPOINT;
use cloudtail_logs::TailConfig;

/// Environment variable that overrides `backend.access_token`
pub const ACCESS_TOKEN_ENV: &str = "CLOUDTAIL_ACCESS_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tail: TailSection,
    pub backend: BackendSection,
}

/// `[tail]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TailSection {
    /// Wait between empty polls and between retries (default: 2000)
    pub poll_interval_ms: u64,

    /// Consecutive failed fetches tolerated in follow mode (default: 5)
    pub max_retries: u32,

    /// Per-request timeout (default: 30)
    pub request_timeout_secs: u64,
}

impl Default for TailSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_retries: 5,
            request_timeout_secs: 30,
        }
    }
}

/// `[backend]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    pub endpoint: String,
    pub page_size: usize,
    pub access_token: Option<String>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            page_size: 1000,
            access_token: None,
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the default location if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::read(path)?,
            None => match Self::default_path().filter(|path| path.exists()) {
                Some(path) => Self::read(&path)?,
                None => Self::default(),
            },
        };

        Ok(config.with_env_token(std::env::var(ACCESS_TOKEN_ENV).ok()))
    }

    fn default_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join("cloudtail").join("config.toml"))
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tail.poll_interval_ms == 0 {
            bail!("tail.poll_interval_ms must be greater than zero");
        }
        if self.tail.request_timeout_secs == 0 {
            bail!("tail.request_timeout_secs must be greater than zero");
        }
        if self.backend.page_size == 0 {
            bail!("backend.page_size must be greater than zero");
        }
        Ok(())
    }

    /// A non-empty token from the environment wins over the file
    fn with_env_token(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.backend.access_token = Some(token.trim().to_string());
        }
        self
    }

    pub fn tail_config(&self) -> TailConfig {
        TailConfig {
            poll_interval: Duration::from_millis(self.tail.poll_interval_ms),
            max_retries: self.tail.max_retries,
            request_timeout: Duration::from_secs(self.tail.request_timeout_secs),
        }
    }
}
