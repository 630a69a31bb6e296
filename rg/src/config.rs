//! reqgate configuration types and loading

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scheduler::SchedulerConfig;

/// Main reqgate configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission control settings
    pub scheduler: SchedulerConfig,

    /// Synthetic workload used by `reqgate simulate`
    pub simulation: SimulationConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("Invalid scheduler configuration")?;
        self.simulation.validate().context("Invalid simulation configuration")?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .reqgate.yml
        let local_config = PathBuf::from(".reqgate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/reqgate/reqgate.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("reqgate").join("reqgate.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Synthetic workload for `reqgate simulate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of requests to submit
    pub requests: usize,

    /// Simulated backend latency per call in milliseconds
    #[serde(rename = "work-ms")]
    pub work_ms: u64,

    /// Chance that the fake backend answers 429
    #[serde(rename = "throttle-probability")]
    pub throttle_probability: f64,

    /// Spread requests over this many dedup keys (0 disables keys)
    #[serde(rename = "distinct-keys")]
    pub distinct_keys: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            requests: 20,
            work_ms: 100,
            throttle_probability: 0.1,
            distinct_keys: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.throttle_probability) {
            return Err(eyre!(
                "throttle-probability must be between 0 and 1, got {}",
                self.throttle_probability
            ));
        }
        Ok(())
    }
}
