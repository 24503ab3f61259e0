//! Collector configuration and validation
//!
//! # Example
//!
//! ```ignore
//! use sync_collector::domain::CollectorConfigBuilder;
//! use std::time::Duration;
//!
//! let config = CollectorConfigBuilder::new()
//!     .backoff_min(Duration::from_secs(2))
//!     .backoff_max(Duration::from_secs(300))
//!     .build()
//!     .expect("Valid config");
//! ```

use std::env;
use std::time::Duration;

use crate::error::CollectorError;

/// Hard ceiling for the download backoff.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(10 * 60);

/// Collector configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorConfig {
    /// First delay after a failed download
    pub backoff_min: Duration,
    /// Largest delay between download retries (at most 10 minutes)
    pub backoff_max: Duration,
    /// First delay before retrying a collection pass that hit a storage error
    pub retry_min: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_max: BACKOFF_CEILING,
            retry_min: Duration::from_millis(500),
        }
    }
}

impl CollectorConfig {
    /// Validate delays
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.backoff_min.is_zero() {
            return Err(CollectorError::InvalidConfig(
                "backoff_min cannot be 0".to_string(),
            ));
        }

        if self.backoff_min > self.backoff_max {
            return Err(CollectorError::InvalidConfig(format!(
                "backoff_min {:?} exceeds backoff_max {:?}",
                self.backoff_min, self.backoff_max
            )));
        }

        if self.backoff_max > BACKOFF_CEILING {
            return Err(CollectorError::InvalidConfig(format!(
                "backoff_max {:?} exceeds ceiling {:?}",
                self.backoff_max, BACKOFF_CEILING
            )));
        }

        if self.retry_min.is_zero() {
            return Err(CollectorError::InvalidConfig(
                "retry_min cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SYNC_COLLECTOR_BACKOFF_MIN_MS` (default: 1000)
    /// - `SYNC_COLLECTOR_BACKOFF_MAX_MS` (default: 600000)
    /// - `SYNC_COLLECTOR_RETRY_MIN_MS` (default: 500)
    pub fn from_env() -> Result<Self, CollectorError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CollectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| -> Result<Option<Duration>, CollectorError> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| CollectorError::InvalidConfig(format!("{key}: {e}")))
                })
                .transpose()
        };

        let mut builder = CollectorConfigBuilder::new();
        if let Some(d) = millis("SYNC_COLLECTOR_BACKOFF_MIN_MS")? {
            builder = builder.backoff_min(d);
        }
        if let Some(d) = millis("SYNC_COLLECTOR_BACKOFF_MAX_MS")? {
            builder = builder.backoff_max(d);
        }
        if let Some(d) = millis("SYNC_COLLECTOR_RETRY_MIN_MS")? {
            builder = builder.retry_min(d);
        }
        builder.build()
    }
}

/// Builder for CollectorConfig with validation
#[derive(Default)]
pub struct CollectorConfigBuilder {
    backoff_min: Option<Duration>,
    backoff_max: Option<Duration>,
    retry_min: Option<Duration>,
}

impl CollectorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backoff_min(mut self, delay: Duration) -> Self {
        self.backoff_min = Some(delay);
        self
    }

    pub fn backoff_max(mut self, delay: Duration) -> Self {
        self.backoff_max = Some(delay);
        self
    }

    pub fn retry_min(mut self, delay: Duration) -> Self {
        self.retry_min = Some(delay);
        self
    }

    /// Build the CollectorConfig, validating all parameters
    pub fn build(self) -> Result<CollectorConfig, CollectorError> {
        let defaults = CollectorConfig::default();

        let config = CollectorConfig {
            backoff_min: self.backoff_min.unwrap_or(defaults.backoff_min),
            backoff_max: self.backoff_max.unwrap_or(defaults.backoff_max),
            retry_min: self.retry_min.unwrap_or(defaults.retry_min),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff_max, BACKOFF_CEILING);
    }

    #[test]
    fn test_rejects_min_above_max() {
        let result = CollectorConfigBuilder::new()
            .backoff_min(Duration::from_secs(20))
            .backoff_max(Duration::from_secs(10))
            .build();
        assert!(matches!(result, Err(CollectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_ceiling_above_ten_minutes() {
        let result = CollectorConfigBuilder::new()
            .backoff_max(Duration::from_secs(11 * 60))
            .build();
        assert!(matches!(result, Err(CollectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_floor() {
        let result = CollectorConfigBuilder::new()
            .backoff_min(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(CollectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_lookup_reads_millis() {
        let vars: HashMap<&str, &str> = [
            ("SYNC_COLLECTOR_BACKOFF_MIN_MS", "250"),
            ("SYNC_COLLECTOR_BACKOFF_MAX_MS", "60000"),
        ]
        .into_iter()
        .collect();

        let lookup = |k: &str| vars.get(k).map(|v| v.to_string());
        let config = CollectorConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.backoff_min, Duration::from_millis(250));
        assert_eq!(config.backoff_max, Duration::from_secs(60));
        assert_eq!(config.retry_min, CollectorConfig::default().retry_min);
    }

    #[test]
    fn test_from_lookup_rejects_non_numeric() {
        let result = CollectorConfig::from_lookup(|k| match k {
            "SYNC_COLLECTOR_RETRY_MIN_MS" => Some("soon".to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(CollectorError::InvalidConfig(_))));
    }
}
