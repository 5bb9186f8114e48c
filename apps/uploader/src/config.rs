//! Uploader configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/paperdrop/uploader.toml`, falling
//! back to `~/.config/paperdrop/uploader.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use paperdrop_transfer::{ChunkPolicy, ValidatorConfig};
use paperdrop_upload::{RetryPolicy, UploadConfig};
use serde::{Deserialize, Serialize};

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the upload service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token sent with every request. Empty disables auth.
    #[serde(default)]
    pub auth_token: String,

    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,

    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub chunks: ChunkPolicy,

    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Where resume sessions are kept.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

/// Backoff settings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_endpoint() -> String {
    "http://localhost:8080/api".into()
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_max_jobs() -> usize {
    64
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.25
}

fn default_session_dir() -> PathBuf {
    data_home().join("paperdrop").join("sessions")
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: c.max_attempts,
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            jitter: c.jitter.clamp(0.0, 1.0),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: String::new(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_jobs: default_max_jobs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            retry: RetryConfig::default(),
            chunks: ChunkPolicy::default(),
            validator: ValidatorConfig::default(),
            session_dir: default_session_dir(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file at the default location is created with defaults; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => {
                let path = config_path();
                if path.exists() {
                    Self::read(&path)
                } else {
                    let config = Config::default();
                    config.save(&path)?;
                    Ok(config)
                }
            }
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file may hold the auth token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            max_concurrent_chunks: self.max_concurrent_chunks,
            max_jobs: self.max_jobs,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
            retry: RetryPolicy::from(&self.retry),
            chunk_policy: self.chunks,
            validator: self.validator.clone(),
        }
    }
}

/// Default configuration file path.
pub fn config_path() -> PathBuf {
    config_home().join("paperdrop").join("uploader.toml")
}

fn config_home() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

fn data_home() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(home).join(fallback)
        }
    }
}
