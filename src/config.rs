use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::genes::Architecture;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique controller identifier, also the MQTT client id suffix
    pub controller_id: String,

    /// MQTT broker configuration
    pub mqtt: MqttConfig,

    /// Durable saga state and inventory
    #[serde(default)]
    pub store: StoreConfig,

    /// Local gene cache
    #[serde(default)]
    pub genepool: GenePoolConfig,

    /// Agents catlets can be placed on
    #[serde(default)]
    pub placement: PlacementConfig,

    /// Architecture genes are resolved for
    #[serde(default)]
    pub architecture: Architecture,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Re-send pending commands of persisted sagas at startup
    #[serde(default = "default_resume_on_start")]
    pub resume_on_start: bool,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// One JSON file per running saga
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    /// Catlets, genes, operation outcomes and the disk cleanup queue
    #[serde(default = "default_inventory_dir")]
    pub inventory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            inventory: default_inventory_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenePoolConfig {
    #[serde(default = "default_genepool_root")]
    pub root: PathBuf,
}

impl Default for GenePoolConfig {
    fn default() -> Self {
        Self {
            root: default_genepool_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub agents: Vec<String>,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_resume_on_start() -> bool {
    true
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("data/sagas")
}

fn default_inventory_dir() -> PathBuf {
    PathBuf::from("data/inventory")
}

fn default_genepool_root() -> PathBuf {
    PathBuf::from("data/genepool")
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            controller_id = %config.controller_id,
            agents = config.placement.agents.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Development configuration: local broker, one agent, data under `data/`
    pub fn default_for_controller(controller_id: String) -> Self {
        Self {
            controller_id,
            mqtt: MqttConfig {
                broker: "localhost".to_string(),
                port: 1883,
                keep_alive_secs: default_keep_alive(),
            },
            store: StoreConfig::default(),
            genepool: GenePoolConfig::default(),
            placement: PlacementConfig {
                agents: vec!["local".to_string()],
            },
            architecture: Architecture::default(),
            log_level: default_log_level(),
            resume_on_start: default_resume_on_start(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}
