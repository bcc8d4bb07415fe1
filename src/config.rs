//! Service configuration
//!
//! Loaded from a TOML file, then overridden from `RESETGUARD_*` environment
//! variables. Every field has a default so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Granularity, Group};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub correction: CorrectionConfig,
    pub monitor: MonitorConfig,
    pub server: ServerConfig,
    pub groups: Vec<Group>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Apply `RESETGUARD_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("RESETGUARD_STORE_PATH") {
            self.store.path = v;
            self.store.kind = StoreKind::Sqlite;
        }
        if let Ok(v) = std::env::var("RESETGUARD_COMMIT_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                self.correction.commit_delay = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("RESETGUARD_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.correction.max_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("RESETGUARD_ESTIMATE_MISSING_ENERGY") {
            if let Ok(b) = v.parse() {
                self.correction.estimate_missing_energy = b;
            }
        }
        if let Ok(v) = std::env::var("RESETGUARD_UTC_OFFSET_MINUTES") {
            if let Ok(m) = v.parse() {
                self.correction.utc_offset_minutes = m;
            }
        }
        if let Ok(v) = std::env::var("RESETGUARD_WEBHOOK_URL") {
            if !v.trim().is_empty() {
                self.monitor.webhook_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RESETGUARD_BIND") {
            self.server.bind = v;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// SQLite database path
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sqlite,
            path: "statistics.db".into(),
        }
    }
}

/// Correction engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Bucket width used for detection and correction
    pub granularity: Granularity,
    /// Wait between submitting an adjustment and re-querying
    #[serde(rename = "commit_delay_ms", with = "duration_serde")]
    pub commit_delay: Duration,
    /// Per-counter bound on correction loop passes
    pub max_iterations: usize,
    /// Add the rate-based estimate of energy accrued during the reset gap
    pub estimate_missing_energy: bool,
    /// Offset of local wall-clock time from UTC.
    ///
    /// Fixed for every timestamp: there is no tz database, so daylight saving
    /// is not followed. Windows that straddle a DST change, or are read under
    /// the other season's offset, are shifted by the difference; update this
    /// value when the clocks change.
    pub utc_offset_minutes: i32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Hour,
            commit_delay: Duration::from_secs(2),
            max_iterations: 100,
            estimate_missing_energy: true,
            utc_offset_minutes: 0,
        }
    }
}

impl CorrectionConfig {
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(
                "utc_offset_minutes {} out of range, using UTC",
                self.utc_offset_minutes
            );
            Utc.fix()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Broadcast channel capacity for live alerts
    pub alert_capacity: usize,
    /// Optional URL receiving every live alert as JSON
    pub webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_capacity: 100,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
        }
    }
}

// Serde helper for Duration (using milliseconds for simplicity)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
