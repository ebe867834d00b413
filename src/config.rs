//! Daemon configuration — YAML file plus environment overrides.
//!
//! ```yaml
//! pulse_interval_minutes: 15
//! pools:
//!   - name: text
//!     env_var: TOGETHER_API_KEY
//!     daily_limit: 1000
//!     adapter:
//!       kind: openai_compat
//!       base_url: https://api.together.xyz/v1
//!       endpoint: chat
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::adapters::openai::Endpoint;

const DEFAULT_DAILY_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control socket location.
    pub socket_path: PathBuf,
    /// How often pool stats are logged.
    pub pulse_interval_minutes: u64,
    /// Per-request timeout for provider calls.
    pub request_timeout_secs: u64,
    pub pools: Vec<PoolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: data_dir().join("keypool.sock"),
            pulse_interval_minutes: 15,
            request_timeout_secs: 60,
            pools: Vec::new(),
        }
    }
}

/// One provider class and where its keys come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Base environment variable; `_2`, `_3`, ... are picked up too.
    pub env_var: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
}

impl PoolConfig {
    pub fn new(name: &str, env_var: &str, daily_limit: u32) -> Self {
        Self {
            name: name.to_string(),
            env_var: env_var.to_string(),
            daily_limit,
            adapter: None,
        }
    }
}

fn default_daily_limit() -> u32 {
    DEFAULT_DAILY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    OpenaiCompat {
        base_url: String,
        #[serde(default)]
        endpoint: Endpoint,
    },
}

impl Config {
    /// Load from `$KEYPOOL_CONFIG` or the default location, then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok();
        let path = config_path(env);

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup("KEYPOOL_SOCKET").filter(|s| !s.trim().is_empty()) {
            self.socket_path = PathBuf::from(socket.trim());
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                anyhow::bail!("Pool with env_var '{}' has an empty name", pool.env_var);
            }
            if pool.env_var.trim().is_empty() {
                anyhow::bail!("Pool '{}' has an empty env_var", pool.name);
            }
            if pool.daily_limit == 0 {
                anyhow::bail!("Pool '{}' has a daily_limit of 0", pool.name);
            }
            if !seen.insert(pool.name.as_str()) {
                anyhow::bail!("Pool '{}' is defined more than once", pool.name);
            }
        }
        if self.pulse_interval_minutes == 0 {
            anyhow::bail!("pulse_interval_minutes must be at least 1");
        }
        Ok(())
    }
}

/// `~/.keypool`, or `./.keypool` when there is no home directory.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".keypool"))
        .unwrap_or_else(|| PathBuf::from(".keypool"))
}

fn config_path<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("KEYPOOL_CONFIG").filter(|p| !p.trim().is_empty()) {
        return PathBuf::from(path.trim());
    }
    dirs::config_dir()
        .map(|dir| dir.join("keypool").join("config.yaml"))
        .unwrap_or_else(|| data_dir().join("config.yaml"))
}
