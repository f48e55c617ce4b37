//! Configuration loading for the scheduler binary.
//!
//! A single TOML file is read, parsed, validated, and cached alongside a
//! checksum so a future reload can detect whether the file actually
//! changed before doing any work.

use std::path::PathBuf;

use anyhow::{Context, Result};
use core::config::SchedulerConfig;
use tracing::{debug, info};

const SCHEDULER_CONFIG_FILE: &str = "scheduler.toml";

pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: Option<SchedulerConfig>,
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    /// Accepts either a path to a directory containing `scheduler.toml` or
    /// a direct path to the file.
    pub fn new(config_path: PathBuf) -> Self {
        let config_path = if config_path.is_dir() {
            config_path.join(SCHEDULER_CONFIG_FILE)
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
            "Loading scheduler configuration from {}",
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

        let config: SchedulerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| {
                format!(
                    "Invalid scheduler configuration in {}",
                    self.config_path.display()
                )
            })?;

        self.current_checksum = Some(core::utils::calculate_string_checksum(&content));
        self.config = Some(config);

        let config = self.config.as_ref().unwrap();
        debug!(database_path = %config.database_path, "scheduler configuration parameters");
        info!(
            database_path = %config.database_path,
            default_queue = %config.default_queue,
            "Scheduler configuration loaded successfully"
        );

        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }
}
