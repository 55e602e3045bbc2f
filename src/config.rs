//! Runtime configuration for the download coordinator.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::downloader::HttpOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Holds the database and, unless overridden, the temp directory.
    pub data_dir: PathBuf,
    /// Where in-flight downloads are written. Defaults to `<data_dir>/tmp`.
    pub temp_dir: Option<PathBuf>,
    pub database_file: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub use_system_proxy: bool,
    /// Worker threads for the runtime owned by the C boundary.
    pub worker_threads: Option<usize>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let http = HttpOptions::default();
        Self {
            data_dir: PathBuf::from("odm-data"),
            temp_dir: None,
            database_file: "downloads.db".to_string(),
            user_agent: http.user_agent,
            connect_timeout_secs: http.connect_timeout.as_secs(),
            use_system_proxy: http.system_proxy,
            worker_threads: None,
            log_filter: "info".to_string(),
        }
    }
}

impl DownloaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn use_system_proxy(mut self, enabled: bool) -> Self {
        self.use_system_proxy = enabled;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".to_string()));
        }
        if self.database_file.trim().is_empty() {
            return Err(ConfigError::Invalid("database_file must not be empty".to_string()));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tmp"))
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            system_proxy: self.use_system_proxy,
        }
    }
}
