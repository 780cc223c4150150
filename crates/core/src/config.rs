use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Deployment name
    pub name: String,

    /// Per-session poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Risk reconciliation interval in milliseconds
    pub risk_check_interval_ms: u64,

    /// Timeout applied to every broker automation call, in milliseconds
    pub broker_call_timeout_ms: u64,

    /// Bound on the whole authentication sequence, in milliseconds
    pub login_timeout_ms: u64,

    /// Directory holding persisted per-account authentication state
    pub auth_state_dir: PathBuf,

    /// Upper bound on concurrently connected accounts
    pub max_accounts: usize,

    /// Log filter applied when RUST_LOG is unset
    pub log_level: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            name: "fleet".to_string(),
            poll_interval_ms: 3_000,
            risk_check_interval_ms: 2_000,
            broker_call_timeout_ms: 15_000,
            login_timeout_ms: 15_000,
            auth_state_dir: PathBuf::from("sessions"),
            max_accounts: 25,
            log_level: "info".to_string(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: FleetConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Write this configuration to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}
