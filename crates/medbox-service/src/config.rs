use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use medbox_api::parse_utc_offset;
use medbox_core::{grace_from_minutes, horizon_from_hours, EngineConfig};
use serde::Deserialize;

const DEFAULT_DB: &str = "./medbox.sqlite3";
const DEFAULT_BIND: &str = "127.0.0.1:4020";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// One configuration layer. Files and command-line flags both produce one;
/// later layers win field by field.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub db: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub sweep_interval_secs: Option<u64>,
    pub horizon_hours: Option<i64>,
    pub utc_offset: Option<String>,
    pub missed_grace_minutes: Option<i64>,
}

impl ConfigLayer {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML for this layer.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    #[must_use]
    pub fn overlay(self, over: Self) -> Self {
        Self {
            db: over.db.or(self.db),
            bind: over.bind.or(self.bind),
            sweep_interval_secs: over.sweep_interval_secs.or(self.sweep_interval_secs),
            horizon_hours: over.horizon_hours.or(self.horizon_hours),
            utc_offset: over.utc_offset.or(self.utc_offset),
            missed_grace_minutes: over.missed_grace_minutes.or(self.missed_grace_minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub sweep_interval: StdDuration,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    /// Fill unset fields with defaults and validate the result.
    ///
    /// # Errors
    /// Returns an error for a zero sweep interval, a horizon or grace period
    /// outside its accepted range, or a malformed UTC offset.
    pub fn resolve(layer: ConfigLayer) -> Result<Self> {
        let defaults = EngineConfig::default();

        let sweep_interval_secs = layer.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
        if sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs MUST be at least 1"));
        }

        let default_horizon = match layer.horizon_hours {
            Some(hours) => horizon_from_hours(hours).context("invalid horizon_hours")?,
            None => defaults.default_horizon,
        };

        let missed_grace = match layer.missed_grace_minutes {
            Some(minutes) => grace_from_minutes(minutes).context("invalid missed_grace_minutes")?,
            None => defaults.missed_grace,
        };

        let utc_offset = match layer.utc_offset.as_deref() {
            Some(raw) => parse_utc_offset(raw)?,
            None => defaults.utc_offset,
        };

        let bind = match layer.bind {
            Some(bind) => bind,
            None => DEFAULT_BIND.parse().context("invalid default bind address")?,
        };

        Ok(Self {
            db: layer.db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
            bind,
            sweep_interval: StdDuration::from_secs(sweep_interval_secs),
            engine: EngineConfig { utc_offset, missed_grace, default_horizon },
        })
    }
}
