use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    /// A device is considered offline when it has not reported for this
    /// long. Defaults to three reporting intervals.
    pub offline_after_secs: u64,
    /// Interval between connectivity sweeps.
    pub sweep_interval_secs: u64,
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
                http_addr: "0.0.0.0:8080".parse().unwrap(),
            },
            store: StoreConfig::Memory,
            monitor: MonitorConfig {
                offline_after_secs: 180,
                sweep_interval_secs: 60,
            },
        }
    }
}
