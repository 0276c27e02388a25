use serde::{Deserialize, Serialize};

use crate::geodesy::distance_meters;

/// ~540 km/h, faster than anything a fitness activity produces
pub const MAX_SPEED_MPS: f64 = 150.0;
/// Moves shorter than this within `NOISE_WINDOW_SECS` are receiver jitter
pub const MIN_SIGNIFICANT_MOVEMENT_M: f64 = 5.0;
pub const NOISE_WINDOW_SECS: f64 = 60.0;

pub const SPEED_WARNING: &str = "speed exceeds maximum";

/// Position plus the time it was observed
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl TimedPosition {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementVerdict {
    Valid,
    /// Valid, but too small to be real movement
    GpsNoise,
    /// Implausible. The fix is still delivered, carrying a warning.
    ExcessiveSpeed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MovementCheck {
    pub distance_m: f64,
    pub elapsed_secs: f64,
    pub speed_mps: f64,
    pub verdict: MovementVerdict,
}

impl MovementCheck {
    pub fn is_valid(&self) -> bool {
        self.verdict != MovementVerdict::ExcessiveSpeed
    }

    pub fn warning(&self) -> Option<String> {
        match self.verdict {
            MovementVerdict::ExcessiveSpeed => Some(SPEED_WARNING.to_string()),
            _ => None,
        }
    }
}

/// Flags physically implausible jumps between consecutive positions.
#[derive(Clone, Debug)]
pub struct MovementValidator {
    pub max_speed_mps: f64,
    pub min_significant_movement_m: f64,
}

impl Default for MovementValidator {
    fn default() -> Self {
        Self {
            max_speed_mps: MAX_SPEED_MPS,
            min_significant_movement_m: MIN_SIGNIFICANT_MOVEMENT_M,
        }
    }
}

impl MovementValidator {
    pub fn validate(&self, previous: &TimedPosition, candidate: &TimedPosition) -> MovementCheck {
        let distance_m = distance_meters(
            previous.latitude,
            previous.longitude,
            candidate.latitude,
            candidate.longitude,
        );
        let elapsed_secs =
            candidate.timestamp_ms.saturating_sub(previous.timestamp_ms) as f64 / 1000.0;
        let speed_mps = if elapsed_secs > 0.0 {
            distance_m / elapsed_secs
        } else {
            0.0
        };

        let verdict = if speed_mps > self.max_speed_mps {
            MovementVerdict::ExcessiveSpeed
        } else if distance_m < self.min_significant_movement_m && elapsed_secs < NOISE_WINDOW_SECS {
            MovementVerdict::GpsNoise
        } else {
            MovementVerdict::Valid
        };

        MovementCheck {
            distance_m,
            elapsed_secs,
            speed_mps,
            verdict,
        }
    }
}
