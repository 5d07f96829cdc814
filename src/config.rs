//! Exchange configuration supplied by the planner / coordinator.
//!
//! ```
//! use ironexchange::config::ExchangeConfig;
//! use std::time::Duration;
//!
//! let config = ExchangeConfig::default()
//!     .with_max_buffer_rows(Some(4096))
//!     .with_low_water_percent(25)
//!     .with_inactive_sink_timeout(Duration::from_secs(30));
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{ExchangeError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Capacity and lifecycle settings for one exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Maximum rows held by a buffer at once. `None` disables the row bound.
    pub max_buffer_rows: Option<usize>,
    /// Maximum estimated bytes held by a buffer at once. `None` disables the byte bound.
    pub max_buffer_bytes: Option<usize>,
    /// Once throttled, producers resume when outstanding rows and bytes drop to this
    /// percentage of their bounds.
    pub low_water_percent: u8,
    /// Sinks not fetched from within this window are early-terminated by the service.
    #[serde(with = "duration_ms")]
    pub inactive_sink_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_buffer_rows: None,
            max_buffer_bytes: Some(16 * 1024 * 1024),
            low_water_percent: 50,
            inactive_sink_timeout: Duration::from_secs(300),
        }
    }
}

impl ExchangeConfig {
    /// Config bounded by rows only (no byte bound).
    #[must_use]
    pub fn with_row_capacity(rows: usize) -> Self {
        Self {
            max_buffer_rows: Some(rows),
            max_buffer_bytes: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_buffer_rows(mut self, rows: Option<usize>) -> Self {
        self.max_buffer_rows = rows;
        self
    }

    #[must_use]
    pub fn with_max_buffer_bytes(mut self, bytes: Option<usize>) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_low_water_percent(mut self, percent: u8) -> Self {
        self.low_water_percent = percent;
        self
    }

    #[must_use]
    pub fn with_inactive_sink_timeout(mut self, timeout: Duration) -> Self {
        self.inactive_sink_timeout = timeout;
        self
    }

    /// Check bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidConfig`] when no capacity bound is set, a
    /// bound is zero, or the low-water percentage is above 100.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_rows.is_none() && self.max_buffer_bytes.is_none() {
            return Err(ExchangeError::InvalidConfig(
                "at least one of max_buffer_rows / max_buffer_bytes must be set".into(),
            ));
        }
        if self.max_buffer_rows == Some(0) || self.max_buffer_bytes == Some(0) {
            return Err(ExchangeError::InvalidConfig("buffer bounds must be positive".into()));
        }
        if self.low_water_percent > 100 {
            return Err(ExchangeError::InvalidConfig(format!(
                "low_water_percent must be 0..=100, got {}",
                self.low_water_percent
            )));
        }
        Ok(())
    }

    /// Row level at or below which a throttled buffer resumes producers.
    #[must_use]
    pub fn low_water_rows(&self) -> Option<usize> {
        self.max_buffer_rows
            .map(|max| max * usize::from(self.low_water_percent) / 100)
    }

    #[must_use]
    pub fn low_water_bytes(&self) -> Option<usize> {
        self.max_buffer_bytes
            .map(|max| max * usize::from(self.low_water_percent) / 100)
    }

    /// Parse and validate a JSON config document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("parse exchange config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a valid config.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read exchange config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("load exchange config {}", path.display()))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
