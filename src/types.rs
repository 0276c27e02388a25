use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Raw position sample from the platform geolocation capability
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(alias = "timestamp")]
    pub timestamp_ms: i64,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            altitude: None,
            heading: None,
            speed: None,
            timestamp_ms,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Coordinates in range and a finite, non-negative accuracy.
    pub fn is_well_formed(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.accuracy.is_finite()
            && self.accuracy >= 0.0
    }
}

/// Positioning technology a record is attributed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Gps,
    Network,
    Cell,
}

impl LocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::Gps => "gps",
            LocationSource::Network => "network",
            LocationSource::Cell => "cell",
        }
    }
}

impl std::fmt::Display for LocationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smoothed, validated position. Never mutated after the pipeline builds it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    /// Filtered latitude
    pub latitude: f64,
    /// Filtered longitude
    pub longitude: f64,
    pub raw_latitude: f64,
    pub raw_longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub source: LocationSource,
    pub distance_from_previous: Option<f64>,
    pub calculated_speed: Option<f64>,
    pub validation_warning: Option<String>,
}

impl PositionRecord {
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    pub fn is_flagged(&self) -> bool {
        self.validation_warning.is_some()
    }
}

/// Controller lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    /// Constructed, or returned here after a failed acquisition
    Idle,
    /// One-shot request in flight
    Acquiring { high_accuracy: bool },
    /// Watch open and delivering
    Tracking(LocationSource),
    /// Watch reopened in network mode after it failed with no accepted fix
    Degraded,
    Stopped,
}

impl TrackingState {
    pub fn is_tracking(&self) -> bool {
        matches!(self, TrackingState::Tracking(_) | TrackingState::Degraded)
    }
}

/// Snapshot returned by `LocationTracker::status`
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub location_source: Option<LocationSource>,
    pub gps_available: bool,
    pub current_position: Option<PositionRecord>,
    pub average_accuracy: Option<f64>,
    pub gps_quality: Option<u8>,
    pub history_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_fix_well_formed() {
        assert!(RawFix::new(37.7749, -122.4194, 8.0, 0).is_well_formed());
        assert!(!RawFix::new(91.0, 0.0, 8.0, 0).is_well_formed());
        assert!(!RawFix::new(0.0, -180.5, 8.0, 0).is_well_formed());
        assert!(!RawFix::new(f64::NAN, 0.0, 8.0, 0).is_well_formed());
        assert!(!RawFix::new(0.0, 0.0, -1.0, 0).is_well_formed());
        assert!(!RawFix::new(0.0, 0.0, f64::INFINITY, 0).is_well_formed());
    }

    #[test]
    fn test_raw_fix_deserialize() {
        let json = r#"{"latitude": 37.7749, "longitude": -122.4194, "accuracy": 8.0, "timestampMs": 1000}"#;
        let fix: RawFix = serde_json::from_str(json).unwrap();
        assert_eq!(fix, RawFix::new(37.7749, -122.4194, 8.0, 1000));

        let json = r#"{"latitude": 1.0, "longitude": 2.0, "accuracy": 3.0, "speed": 1.5, "timestamp": 42}"#;
        let fix: RawFix = serde_json::from_str(json).unwrap();
        assert_eq!(fix.timestamp_ms, 42);
        assert_eq!(fix.speed, Some(1.5));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = PositionRecord {
            latitude: 1.0,
            longitude: 2.0,
            raw_latitude: 1.0,
            raw_longitude: 2.0,
            accuracy: 5.0,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: 1_700_000_000_000,
            source: LocationSource::Gps,
            distance_from_previous: Some(3.0),
            calculated_speed: None,
            validation_warning: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["rawLatitude"], 1.0);
        assert_eq!(value["distanceFromPrevious"], 3.0);
        assert_eq!(value["source"], "gps");
        assert!(record.recorded_at().is_some());
        assert!(!record.is_flagged());
    }

    #[test]
    fn test_tracking_state_flags() {
        assert!(TrackingState::Tracking(LocationSource::Gps).is_tracking());
        assert!(TrackingState::Degraded.is_tracking());
        assert!(!TrackingState::Acquiring { high_accuracy: true }.is_tracking());
        assert!(!TrackingState::Stopped.is_tracking());
    }
}
