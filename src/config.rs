//! Server configuration, loaded from a TOML file.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration for a server binary.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of sub-loop threads (default: number of CPUs; 0 keeps all
    /// I/O on the base loop)
    pub threads: Option<usize>,
}

/// Listener configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to listen on
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// Bind with SO_REUSEPORT
    #[serde(default)]
    pub reuse_port: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            reuse_port: false,
        }
    }
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level when RUST_LOG is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format: "pretty", "compact", or "json"
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include thread names (one loop per thread, so this names the loop)
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(threads) = self.workers.threads
            && threads > 1024
        {
            return Err(format!("workers.threads ({}) is unreasonably large", threads).into());
        }
        Ok(())
    }

    /// Number of sub-loop threads to run.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listener.address, default_address());
        assert!(!config.listener.reuse_port);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.timestamps);
        assert!(config.threads() >= 1);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [workers]
            threads = 4

            [listener]
            address = "127.0.0.1:9000"
            reuse_port = true

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            thread_names = false
            "#,
        )
        .unwrap();
        assert_eq!(config.threads(), 4);
        assert_eq!(config.listener.address.port(), 9000);
        assert!(config.listener.reuse_port);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("[listener]\nportt = 1\n").is_err());
    }

    #[test]
    fn absurd_thread_count_fails_validation() {
        let config: Config = toml::from_str("[workers]\nthreads = 100000\n").unwrap();
        assert!(config.validate().is_err());
    }
}
