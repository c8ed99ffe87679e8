use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the gridpay-server HTTP API
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Interval in seconds between polls for pending commands
    pub poll_interval_secs: u64,
    /// Deadline in seconds for one physical write including read-back
    pub write_timeout_secs: u64,
    /// Delay in milliseconds between retry attempts
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    /// In-process relay simulation for development
    Mock {
        /// Fraction of writes that fail, 0.0 to 1.0
        fail_rate: f64,
    },
    /// Modbus TCP against real metering hardware
    Modbus,
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://127.0.0.1:8080".to_string(),
            },
            worker: WorkerConfig {
                poll_interval_secs: 5,
                write_timeout_secs: 10,
                retry_delay_ms: 1000,
            },
            driver: DriverConfig::Mock { fail_rate: 0.0 },
        }
    }
}
