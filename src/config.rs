//! Server configuration.
//!
//! Loaded from a TOML file; every section has defaults so an empty config is
//! valid. The RUST_LOG environment variable overrides the configured log
//! level (see `logging`).

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::Error;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Connection buffer sizing.
    #[serde(default)]
    pub buffers: BuffersConfig,

    /// Storage engine configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Number of reactor worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of reactor threads (default: number of CPUs).
    pub threads: Option<usize>,
}

/// Listener configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to listen on.
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            backlog: default_backlog(),
        }
    }
}

/// Connection buffer sizing. Powers of two recommended.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuffersConfig {
    /// Receive buffer capacity per connection. A request plus its arguments
    /// must fit.
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,

    /// Capacity of each send chain link.
    #[serde(default = "default_buffer_size")]
    pub send_link_size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_buffer_size(),
            send_link_size: default_buffer_size(),
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Number of write worker threads.
    #[serde(default = "default_write_threads")]
    pub write_threads: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_threads: default_write_threads(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "bramble=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log output.
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_address() -> SocketAddr {
    "127.0.0.1:11211".parse().expect("valid default address")
}

fn default_backlog() -> u32 {
    4096
}

fn default_buffer_size() -> usize {
    4096
}

fn default_write_threads() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listener.address.port(), 11211);
        assert_eq!(config.buffers.recv_buffer_size, 4096);
        assert_eq!(config.store.write_threads, 2);
        assert_eq!(config.logging.level, "info");
        assert!(config.threads() >= 1);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [workers]
            threads = 2

            [listener]
            address = "0.0.0.0:11300"
            backlog = 128

            [buffers]
            recv_buffer_size = 8192
            send_link_size = 16384

            [store]
            write_threads = 4

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();
        assert_eq!(config.threads(), 2);
        assert_eq!(config.listener.address.port(), 11300);
        assert_eq!(config.listener.backlog, 128);
        assert_eq!(config.buffers.send_link_size, 16384);
        assert_eq!(config.store.write_threads, 4);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[listener]\nbogus = 1\n");
        assert!(result.is_err());
    }
}
