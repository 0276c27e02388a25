use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{LResult, LocationError};

/// Tracking session configuration.
///
/// Supplied to `LocationTracker::start`. The controller keeps its own copy and
/// may switch `enable_high_accuracy` off during network fallback; the
/// caller's value is never touched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
    /// Desired accuracy tier. Informational only, never gates a fix.
    pub min_accuracy_m: f64,
    /// Fixes reporting a larger radius are discarded
    pub max_accuracy_m: f64,
    pub update_throttle_ms: u64,

    // ── Network fallback ──
    pub fallback_timeout_ms: u64,
    pub fallback_maximum_age_ms: u64,
    pub watch_restart_delay_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: 10_000,
            maximum_age_ms: 0,
            min_accuracy_m: 10.0,
            max_accuracy_m: 100.0,
            update_throttle_ms: 1_000,
            fallback_timeout_ms: 20_000,
            fallback_maximum_age_ms: 300_000,
            watch_restart_delay_ms: 1_000,
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> LResult<()> {
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be positive"));
        }
        if self.fallback_timeout_ms == 0 {
            return Err(invalid("fallback_timeout_ms must be positive"));
        }
        if !self.min_accuracy_m.is_finite() || self.min_accuracy_m <= 0.0 {
            return Err(invalid(format!(
                "min_accuracy_m must be a positive number, got {}",
                self.min_accuracy_m
            )));
        }
        if !self.max_accuracy_m.is_finite() || self.max_accuracy_m <= 0.0 {
            return Err(invalid(format!(
                "max_accuracy_m must be a positive number, got {}",
                self.max_accuracy_m
            )));
        }
        if self.min_accuracy_m > self.max_accuracy_m {
            return Err(invalid(format!(
                "min_accuracy_m ({}) exceeds max_accuracy_m ({})",
                self.min_accuracy_m, self.max_accuracy_m
            )));
        }
        if i64::try_from(self.update_throttle_ms).is_err() {
            return Err(invalid(format!(
                "update_throttle_ms out of range, got {}",
                self.update_throttle_ms
            )));
        }
        if self.fallback_maximum_age_ms < self.maximum_age_ms {
            return Err(invalid(
                "fallback_maximum_age_ms must not be shorter than maximum_age_ms",
            ));
        }
        Ok(())
    }

    /// Parse a JSON config; missing keys take defaults, unknown keys are rejected.
    pub fn from_json_str(json: &str) -> LResult<Self> {
        let config: TrackingConfig =
            serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> LResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_ms)
    }
}

fn invalid(msg: impl Into<String>) -> LocationError {
    LocationError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TrackingConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enable_high_accuracy);
        assert_eq!(config.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let config = TrackingConfig {
            min_accuracy_m: 200.0,
            ..TrackingConfig::default()
        };
        assert!(matches!(config.validate(), Err(LocationError::InvalidConfig(_))));

        let config = TrackingConfig {
            max_accuracy_m: f64::NAN,
            ..TrackingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TrackingConfig {
            timeout_ms: 0,
            ..TrackingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TrackingConfig {
            maximum_age_ms: 600_000,
            ..TrackingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_throttle_beyond_timestamp_range() {
        let config = TrackingConfig {
            update_throttle_ms: i64::MAX as u64 + 1,
            ..TrackingConfig::default()
        };
        assert!(matches!(config.validate(), Err(LocationError::InvalidConfig(_))));

        let config = TrackingConfig {
            update_throttle_ms: i64::MAX as u64,
            ..TrackingConfig::default()
        };
        assert!(config.validate().is_ok());

        let json = format!(r#"{{"update_throttle_ms": {}}}"#, u64::MAX);
        assert!(TrackingConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn test_json_partial_and_unknown_keys() {
        let config =
            TrackingConfig::from_json_str(r#"{"max_accuracy_m": 50.0, "update_throttle_ms": 0}"#)
                .unwrap();
        assert_eq!(config.max_accuracy_m, 50.0);
        assert_eq!(config.update_throttle_ms, 0);
        assert_eq!(config.timeout_ms, 10_000);

        let err = TrackingConfig::from_json_str(r#"{"maxAccuracy": 50.0}"#).unwrap_err();
        assert!(matches!(err, LocationError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TrackingConfig::load("/nonexistent/tracking.json").unwrap_err();
        assert!(matches!(err, LocationError::InvalidConfig(_)));
    }
}
