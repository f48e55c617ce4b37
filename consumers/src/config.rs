//! Configuration loading for the consumers binary.
//!
//! Mirrors `ConfigManager` from the scheduler binary: a single TOML file is
//! read, parsed, validated, and cached alongside a checksum.

use std::path::PathBuf;

use anyhow::{Context, Result};
use core::config::ConsumersConfig;
use tracing::{debug, info};

const CONSUMERS_CONFIG_FILE: &str = "consumers.toml";

pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: Option<ConsumersConfig>,
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    /// Accepts either a path to a directory containing `consumers.toml` or
    /// a direct path to the file.
    pub fn new(config_path: PathBuf) -> Self {
        let config_path = if config_path.is_dir() {
            config_path.join(CONSUMERS_CONFIG_FILE)
        } else {
            config_path
        };
        ConfigManager {
            config_path,
            config: None,
            current_checksum: None,
        }
    }

    pub async fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading consumers configuration from {}",
            self.config_path.display()
        );

        let content = if self.config_path.exists() {
            tokio::fs::read_to_string(&self.config_path)
                .await
                .with_context(|| format!("Failed to read {}", self.config_path.display()))?
        } else {
            debug!(
                "{} not found, using built-in defaults",
                self.config_path.display()
            );
            String::new()
        };

        let config: ConsumersConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| {
                format!(
                    "Invalid consumers configuration in {}",
                    self.config_path.display()
                )
            })?;

        self.current_checksum = Some(core::utils::calculate_string_checksum(&content));
        self.config = Some(config);

        let config = self.config.as_ref().unwrap();
        info!(
            stream_name = %config.stream_name,
            consumer_group = %config.consumer_group,
            worker_count = config.worker_count,
            "consumers configuration loaded successfully"
        );

        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }
}
