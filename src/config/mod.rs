use crate::utils::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The tunable constants that govern the concurrent request-serving core.
///
/// These are the spec's `MAX_CLIENTS` / `WORKERS` / ... table. They default
/// to the documented values and may be overridden by a TOML config file and
/// then by `PROXY_*` environment variables, in that precedence order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_cache_max_total_bytes")]
    pub cache_max_total_bytes: u64,
    #[serde(default = "default_cache_max_entry_bytes")]
    pub cache_max_entry_bytes: u64,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(default = "default_pool_idle_max_age_s")]
    pub pool_idle_max_age_s: u64,
    #[serde(default = "default_upstream_connect_timeout_s")]
    pub upstream_connect_timeout_s: u64,
    #[serde(default = "default_io_buffer_bytes")]
    pub io_buffer_bytes: usize,
}

fn default_max_clients() -> usize {
    1200
}
fn default_workers() -> usize {
    50
}
fn default_queue_capacity() -> usize {
    2000
}
fn default_cache_max_total_bytes() -> u64 {
    200 * 1024 * 1024
}
fn default_cache_max_entry_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_pool_capacity() -> usize {
    100
}
fn default_pool_idle_max_age_s() -> u64 {
    60
}
fn default_upstream_connect_timeout_s() -> u64 {
    30
}
fn default_io_buffer_bytes() -> usize {
    8192
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            cache_max_total_bytes: default_cache_max_total_bytes(),
            cache_max_entry_bytes: default_cache_max_entry_bytes(),
            pool_capacity: default_pool_capacity(),
            pool_idle_max_age_s: default_pool_idle_max_age_s(),
            upstream_connect_timeout_s: default_upstream_connect_timeout_s(),
            io_buffer_bytes: default_io_buffer_bytes(),
        }
    }
}

impl Limits {
    pub fn pool_idle_max_age(&self) -> Duration {
        Duration::from_secs(self.pool_idle_max_age_s)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_s)
    }

    /// Apply `PROXY_*` environment variable overrides on top of whatever was
    /// loaded from file/defaults. Unset or unparsable variables are ignored.
    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $var:literal) => {
                if let Ok(raw) = std::env::var($var) {
                    if let Ok(value) = raw.parse() {
                        self.$field = value;
                    }
                }
            };
        }

        env_override!(max_clients, "PROXY_MAX_CLIENTS");
        env_override!(workers, "PROXY_WORKERS");
        env_override!(queue_capacity, "PROXY_QUEUE_CAPACITY");
        env_override!(cache_max_total_bytes, "PROXY_CACHE_MAX_TOTAL_BYTES");
        env_override!(cache_max_entry_bytes, "PROXY_CACHE_MAX_ENTRY_BYTES");
        env_override!(pool_capacity, "PROXY_POOL_CAPACITY");
        env_override!(pool_idle_max_age_s, "PROXY_POOL_IDLE_MAX_AGE_S");
        env_override!(
            upstream_connect_timeout_s,
            "PROXY_UPSTREAM_CONNECT_TIMEOUT_S"
        );
        env_override!(io_buffer_bytes, "PROXY_IO_BUFFER_BYTES");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub bind_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub limits: Limits,
}

impl Config {
    /// Build the default configuration for the given bind port (the CLI's
    /// sole positional argument), then layer an optional config file and
    /// `PROXY_*` environment variables on top.
    pub fn load(bind_port: u16, config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            Self::defaults_for_port(bind_port)
        };

        config.server.bind_port = bind_port;
        config.limits.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn defaults_for_port(bind_port: u16) -> Self {
        Self {
            server: ServerConfig {
                bind_address: default_bind_address(),
                bind_port,
            },
            logging: LoggingConfig::default(),
            limits: Limits::default(),
        }
    }

    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ProxyError::Config(format!("failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        if self.limits.workers == 0 {
            return Err(ProxyError::Config("workers must be at least 1".to_string()));
        }
        if self.limits.max_clients == 0 {
            return Err(ProxyError::Config(
                "max_clients must be at least 1".to_string(),
            ));
        }
        if self.limits.cache_max_entry_bytes > self.limits.cache_max_total_bytes {
            return Err(ProxyError::Config(
                "cache_max_entry_bytes cannot exceed cache_max_total_bytes".to_string(),
            ));
        }
        Ok(())
    }
}
