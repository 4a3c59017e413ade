use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::labels::CanonicalClass;

/// Environment variable that overrides `datastore.url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub labels: LabelsConfig,
    /// IANA zone used for every calendar-date and hour bucket
    pub reference_timezone: Tz,
    pub datastore: DatastoreConfig,
    pub analytics: AnalyticsConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive misses tolerated before a track is deleted
    pub max_age: u32,
    /// Consecutive hits needed to confirm a tentative track
    pub confirmation_hits: u32,
    /// Maximum association cost (1 - IoU) accepted as a match
    pub gate_threshold: f64,
    /// Nominal frames per second, converts wall-clock deltas to frame units
    pub frame_rate: f64,
    /// Detections below this confidence are ignored
    pub min_confidence: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    /// Extra raw label spellings, merged over the built-in table
    pub aliases: BTreeMap<String, CanonicalClass>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub statement_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Hard cap on rows returned by a listing, with or without a limit
    pub max_list_rows: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Feed silence after which stale tracks are aged by wall clock
    pub stall_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            labels: LabelsConfig::default(),
            reference_timezone: Tz::Asia__Jakarta,
            datastore: DatastoreConfig::default(),
            analytics: AnalyticsConfig::default(),
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            confirmation_hits: 3,
            gate_threshold: 0.7,
            frame_rate: 30.0,
            min_confidence: 0.5,
        }
    }
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/vehicle_db".to_string(),
            min_connections: 1,
            max_connections: 8,
            acquire_timeout_ms: 3000,
            statement_timeout_ms: None,
        }
    }
}

impl DatastoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            max_list_rows: 10_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 2000,
        }
    }
}

impl PipelineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load, apply environment overrides and validate. Any error is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::from_file(path)?;
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            cfg.datastore.url = url;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;

        let ds = &self.datastore;
        if ds.url.trim().is_empty() {
            return Err(invalid("datastore.url must not be empty"));
        }
        if ds.max_connections == 0 {
            return Err(invalid("datastore.max_connections must be at least 1"));
        }
        if ds.min_connections > ds.max_connections {
            return Err(invalid(format!(
                "datastore.min_connections ({}) exceeds max_connections ({})",
                ds.min_connections, ds.max_connections
            )));
        }
        if ds.acquire_timeout_ms == 0 {
            return Err(invalid("datastore.acquire_timeout_ms must be positive"));
        }
        if self.analytics.max_list_rows == 0 {
            return Err(invalid("analytics.max_list_rows must be positive"));
        }
        if self.pipeline.stall_timeout_ms == 0 {
            return Err(invalid("pipeline.stall_timeout_ms must be positive"));
        }
        if self.labels.aliases.keys().any(|k| k.trim().is_empty()) {
            return Err(invalid("labels.aliases contains an empty label"));
        }
        Ok(())
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.confirmation_hits == 0 {
            return Err(invalid("tracker.confirmation_hits must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.gate_threshold) {
            return Err(invalid(format!(
                "tracker.gate_threshold {} outside [0, 1]",
                self.gate_threshold
            )));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(invalid(format!(
                "tracker.frame_rate {} must be a positive number",
                self.frame_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid(format!(
                "tracker.min_confidence {} outside [0, 1]",
                self.min_confidence
            )));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
