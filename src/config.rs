// ABOUTME: TOML configuration of a forwarder - source layout, destination, transfer pacing, drivers
// ABOUTME: Validated on load so that a bad driver set or window size fails before any data moves

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::{DriverConfig, DriverSet};
use crate::scanner::SourceLayout;
use crate::source::TimeEncoding;
use crate::transfer::TransferSettings;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "telemetry-sync.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Sync state file; defaults to `~/.telemetry-sync/<source name>-state.json`
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub transfer: TransferSettings,
    /// In priority order: the first driver whose pattern matches a table claims it
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Installation name, used for the default state file
    pub name: String,
    /// Directory holding the `*.db` / `*.sqlite` exports
    pub root: PathBuf,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default)]
    pub time_encoding: TimeEncoding,
    #[serde(flatten)]
    pub layout: SourceLayout,
}

fn default_time_column() -> String {
    "Timestamp".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub base_url: String,
    pub username: String,
    /// Usually supplied through the environment instead
    #[serde(default)]
    pub password: Option<String>,
    /// Local label document used instead of the label API
    #[serde(default)]
    pub labels_file: Option<PathBuf>,
    #[serde(default = "default_max_records_per_call")]
    pub max_records_per_call: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Workspace id -> live source database
    #[serde(default)]
    pub workspaces: BTreeMap<String, String>,
}

fn default_max_records_per_call() -> usize {
    5_000
}

fn default_timeout_secs() -> u64 {
    60
}

impl DestinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn password(&self) -> Result<&str> {
        self.password.as_deref().with_context(|| {
            format!(
                "No password for telemetry user '{}'. \
                 Set TELEMETRY_SYNC_PASSWORD or pass --password.",
                self.username
            )
        })
    }
}

impl ForwarderConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ForwarderConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.name.trim().is_empty() {
            bail!("source.name must not be empty");
        }
        url::Url::parse(&self.destination.base_url).with_context(|| {
            format!("destination.base_url is not a valid URL: {}", self.destination.base_url)
        })?;
        if self.destination.max_records_per_call == 0 {
            bail!("destination.max_records_per_call must be at least 1");
        }
        if self.transfer.max_window_days == 0 {
            bail!("transfer.max_window_days must be at least 1");
        }
        if self.transfer.max_records_per_job == 0 {
            bail!("transfer.max_records_per_job must be at least 1");
        }
        if let Some(hour) = self.transfer.cutoff_hour {
            if hour >= 24 {
                bail!("transfer.cutoff_hour must be between 0 and 23, got {}", hour);
            }
        }
        if self.destination.workspaces.is_empty() {
            tracing::warn!("No [destination.workspaces] configured; nothing will be mapped");
        }
        self.driver_set()?;
        Ok(())
    }

    /// Compile the driver list.
    pub fn driver_set(&self) -> Result<DriverSet> {
        DriverSet::new(self.drivers.clone()).context("Invalid driver configuration")
    }

    /// Effective state file path.
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().context("Failed to determine home directory")?;
        Ok(home
            .join(".telemetry-sync")
            .join(format!("{}-state.json", self.source.name)))
    }
}
