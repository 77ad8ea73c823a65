//! # Configuration Management Module
//!
//! TOML configuration for the `meshrelay` binary. Library users can build a
//! [`crate::delivery::DeliveryTuning`] directly and skip this module.
//!
//! ## Configuration Structure
//!
//! - [`NodeConfig`] - identity of this node on the mesh
//! - [`DeliveryConfig`] - chunking, pacing and retry knobs
//! - [`StorageConfig`] - sled location and retention
//! - [`LoggingConfig`] - log level and optional log file
//! - [`SerialConfig`] - radio device settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshrelay::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Node: {}", config.node.node_id);
//!     println!("Chunk budget: {:?}", config.delivery.content_budget_bytes);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [node]
//! node_id = "!a1b2c3d4"
//!
//! [delivery]
//! split_threshold_bytes = 150
//! content_budget_bytes = 120
//! max_chunks = 16
//! max_frame_bytes = 200
//! max_retries = 3
//! retry_delay_ms = 15000
//! inter_chunk_delay_ms = 2000
//! enable_confirmations = true
//!
//! [storage]
//! data_dir = "./data"
//! retention_days = 30
//! ```
//!
//! Every `[delivery]` key is optional; missing keys fall back to the defaults
//! shown above and out-of-range values are clamped when the tuning is built.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Id this node reports as the receiver of reassembled messages.
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Messages longer than this many UTF-8 bytes are chunked.
    #[serde(default)]
    pub split_threshold_bytes: Option<usize>,
    /// Content bytes per chunk, before the frame envelope.
    #[serde(default)]
    pub content_budget_bytes: Option<usize>,
    /// Chunks beyond this count are dropped and reported as truncation.
    #[serde(default)]
    pub max_chunks: Option<usize>,
    /// Hard per-packet limit of the radio.
    #[serde(default)]
    pub max_frame_bytes: Option<usize>,
    /// Wire attempts per chunk.
    #[serde(default)]
    pub max_retries: Option<u8>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Pause after each successful chunk send.
    #[serde(default)]
    pub inter_chunk_delay_ms: Option<u64>,
    /// Send a confirmation frame for every received chunk.
    #[serde(default)]
    pub enable_confirmations: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Age in days after which finished records are purged by `cleanup`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl StorageConfig {
    /// Directory holding the sled database.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("delivery")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                node_id: "!00000000".to_string(),
            },
            delivery: DeliveryConfig {
                split_threshold_bytes: Some(150),
                content_budget_bytes: Some(120),
                max_chunks: Some(16),
                max_frame_bytes: Some(200),
                max_retries: Some(3),
                retry_delay_ms: Some(15_000),
                inter_chunk_delay_ms: Some(2_000),
                enable_confirmations: Some(true),
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                retention_days: default_retention_days(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshrelay.log".to_string()),
            },
            serial: SerialConfig::default(),
        }
    }
}
