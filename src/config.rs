//! Typed configuration (§10.3). The core reads only what §6 says it may:
//! the backend list, the pool's `min_idle_connections`, and logging level
//! and sink names. Health-check/dwell/coalescing timers are intentionally
//! not configurable here — they live in [`crate::backend`] and
//! [`crate::logging`] as constants per §5.

use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub address: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "read-write".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_idle_connections: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle_connections: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sinks: default_sinks(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sinks() -> Vec<String> {
    vec!["stdout".to_string()]
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to parse {path}: {e}")))?;
        if config.backends.is_empty() {
            return Err(ProxyError::Config(
                "at least one backend must be configured".to_string(),
            ));
        }
        Ok(config)
    }
}
