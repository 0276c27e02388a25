//! Per-fix processing, independent of the platform and the async runtime:
//!
//!   RawFix → AccuracyGate → AxisFilterPair → MovementValidator → throttle
//!          → history / quality window → PositionRecord
//!
//! The filter step runs before the throttle check. A throttled fix has already
//! advanced the axis variances even though nothing else about it is kept.

use crate::config::TrackingConfig;
use crate::filters::axis_kalman::AxisFilterPair;
use crate::history::{BoundedHistory, POSITION_HISTORY_CAPACITY};
use crate::quality::{classify_source, AccuracyGate, GateDecision, QualityScorer};
use crate::types::{PositionRecord, RawFix};
use crate::validation::{MovementValidator, MovementVerdict, TimedPosition};

#[derive(Clone, Debug, PartialEq)]
pub enum FixOutcome {
    Accepted(PositionRecord),
    Rejected(GateDecision),
    Throttled { since_last_ms: i64 },
}

pub struct FixPipeline {
    gate: AccuracyGate,
    filters: AxisFilterPair,
    validator: MovementValidator,
    update_throttle_ms: i64,

    history: BoundedHistory<PositionRecord>,
    quality: QualityScorer,

    /// Anchor for smoothing and movement checks. Cleared by `reset`.
    last_valid: Option<PositionRecord>,
    /// Latest delivered record. Survives `reset`.
    current: Option<PositionRecord>,
    last_accepted_ms: Option<i64>,
}

impl FixPipeline {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            gate: AccuracyGate::new(config.min_accuracy_m, config.max_accuracy_m),
            filters: AxisFilterPair::default(),
            validator: MovementValidator::default(),
            update_throttle_ms: i64::try_from(config.update_throttle_ms).unwrap_or(i64::MAX),
            history: BoundedHistory::new(POSITION_HISTORY_CAPACITY),
            quality: QualityScorer::default(),
            last_valid: None,
            current: None,
            last_accepted_ms: None,
        }
    }

    pub fn process(&mut self, fix: &RawFix, high_accuracy: bool) -> FixOutcome {
        match self.gate.admit(fix) {
            GateDecision::Accepted => {}
            decision => {
                log::debug!(
                    "Discarding fix at {} ({:?}, accuracy {:.1} m, limit {:.1} m)",
                    fix.timestamp_ms,
                    decision,
                    fix.accuracy,
                    self.gate.max_accuracy_m
                );
                return FixOutcome::Rejected(decision);
            }
        }

        // First fix after session start or reset seeds the filters
        let previous_estimate = match &self.last_valid {
            Some(prev) => (prev.latitude, prev.longitude),
            None => {
                self.filters.reset();
                (fix.latitude, fix.longitude)
            }
        };
        let (latitude, longitude) = self
            .filters
            .filter((fix.latitude, fix.longitude), previous_estimate);

        if let Some(last_ms) = self.last_accepted_ms {
            let since_last_ms = fix.timestamp_ms.saturating_sub(last_ms);
            if since_last_ms < self.update_throttle_ms {
                log::debug!(
                    "Throttling fix at {} ({} ms since last, minimum {} ms)",
                    fix.timestamp_ms,
                    since_last_ms,
                    self.update_throttle_ms
                );
                return FixOutcome::Throttled { since_last_ms };
            }
        }

        let check = self.last_valid.as_ref().map(|prev| {
            self.validator.validate(
                &TimedPosition::new(prev.raw_latitude, prev.raw_longitude, prev.timestamp),
                &TimedPosition::new(fix.latitude, fix.longitude, fix.timestamp_ms),
            )
        });

        if let Some(check) = &check {
            match check.verdict {
                MovementVerdict::ExcessiveSpeed => log::warn!(
                    "Implausible movement: {:.1} m in {:.1} s ({:.1} m/s), delivering flagged fix",
                    check.distance_m,
                    check.elapsed_secs,
                    check.speed_mps
                ),
                MovementVerdict::GpsNoise => log::trace!(
                    "Movement {:.1} m below significance threshold, treating as GPS noise",
                    check.distance_m
                ),
                MovementVerdict::Valid => {}
            }
        }

        let record = PositionRecord {
            latitude,
            longitude,
            raw_latitude: fix.latitude,
            raw_longitude: fix.longitude,
            accuracy: fix.accuracy,
            altitude: fix.altitude,
            heading: fix.heading,
            speed: fix.speed,
            timestamp: fix.timestamp_ms,
            source: classify_source(fix.accuracy, high_accuracy),
            distance_from_previous: check.as_ref().map(|c| c.distance_m),
            calculated_speed: check.as_ref().map(|c| c.speed_mps),
            validation_warning: check.as_ref().and_then(|c| c.warning()),
        };

        self.history.push(record.clone());
        self.quality.record(record.accuracy);
        self.last_valid = Some(record.clone());
        self.current = Some(record.clone());
        self.last_accepted_ms = Some(record.timestamp);

        FixOutcome::Accepted(record)
    }

    /// Clear history, the accuracy window and both filters. The next accepted
    /// fix reseeds the filters; the current position stays readable.
    pub fn reset(&mut self) {
        self.history.clear();
        self.quality.clear();
        self.filters.reset();
        self.last_valid = None;
    }

    /// Drop filter state at the end of a session.
    pub fn end_session(&mut self) {
        self.filters.reset();
        self.last_valid = None;
    }

    pub fn current(&self) -> Option<&PositionRecord> {
        self.current.as_ref()
    }

    pub fn history(&self) -> Vec<PositionRecord> {
        self.history.snapshot()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn average_accuracy(&self) -> Option<f64> {
        self.quality.average_accuracy()
    }

    pub fn quality(&self) -> Option<u8> {
        self.quality.quality()
    }

    /// Latitude and longitude position variances
    pub fn filter_variance(&self) -> (f64, f64) {
        (
            self.filters.latitude.variance(),
            self.filters.longitude.variance(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::axis_kalman::DEFAULT_ESTIMATION_ERROR;
    use crate::types::LocationSource;
    use crate::validation::SPEED_WARNING;
    use approx::assert_abs_diff_eq;

    fn pipeline() -> FixPipeline {
        FixPipeline::new(&TrackingConfig::default())
    }

    fn accepted(outcome: FixOutcome) -> PositionRecord {
        match outcome {
            FixOutcome::Accepted(record) => record,
            other => panic!("expected accepted fix, got {:?}", other),
        }
    }

    #[test]
    fn test_first_fix_passes_through_unsmoothed() {
        let mut p = pipeline();
        let record = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true));
        assert_eq!(record.latitude, 37.7749);
        assert_eq!(record.longitude, -122.4194);
        assert_eq!(record.distance_from_previous, None);
        assert_eq!(record.source, LocationSource::Gps);
        assert_eq!(p.history_len(), 1);
        assert_eq!(p.average_accuracy(), Some(8.0));
    }

    #[test]
    fn test_walking_scenario() {
        let mut p = pipeline();
        p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true);
        let record = accepted(p.process(&RawFix::new(37.7750, -122.4195, 9.0, 3_000), true));

        let distance = record.distance_from_previous.unwrap();
        let speed = record.calculated_speed.unwrap();
        assert!((13.0..=14.5).contains(&distance), "distance {}", distance);
        assert!((6.5..=7.5).contains(&speed), "speed {}", speed);
        assert_eq!(record.validation_warning, None);
        assert_eq!(record.source, LocationSource::Gps);

        // Smoothed toward the new measurement but not onto it
        assert!(record.latitude > 37.7749 && record.latitude < 37.7750);
        assert!(record.longitude < -122.4194 && record.longitude > -122.4195);
        assert_eq!(record.raw_latitude, 37.7750);
    }

    #[test]
    fn test_inaccurate_fix_changes_nothing() {
        let mut p = pipeline();
        let first = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true));
        let variance = p.filter_variance();

        let outcome = p.process(&RawFix::new(37.9, -122.0, 150.0, 5_000), true);
        assert_eq!(outcome, FixOutcome::Rejected(GateDecision::TooInaccurate));
        assert_eq!(p.current(), Some(&first));
        assert_eq!(p.history_len(), 1);
        assert_eq!(p.filter_variance(), variance);
        assert_eq!(p.average_accuracy(), Some(8.0));
    }

    #[test]
    fn test_malformed_fix_rejected() {
        let mut p = pipeline();
        let outcome = p.process(&RawFix::new(f64::NAN, -122.4194, 8.0, 1_000), true);
        assert_eq!(outcome, FixOutcome::Rejected(GateDecision::Malformed));
        assert!(p.current().is_none());
    }

    #[test]
    fn test_throttle_drops_delivery_but_advances_filter() {
        let mut p = pipeline();
        let first = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true));
        let variance_after_first = p.filter_variance();

        let outcome = p.process(&RawFix::new(37.7750, -122.4195, 8.0, 1_500), true);
        assert_eq!(outcome, FixOutcome::Throttled { since_last_ms: 500 });
        assert_eq!(p.current(), Some(&first));
        assert_eq!(p.history_len(), 1);
        assert_eq!(p.average_accuracy(), Some(8.0));
        assert!(p.filter_variance().0 < variance_after_first.0);

        // Throttle window measured from the last accepted fix, not the throttled one
        let third = accepted(p.process(&RawFix::new(37.7750, -122.4195, 8.0, 2_000), true));
        assert_eq!(third.timestamp, 2_000);
        assert_eq!(p.history_len(), 2);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut p = pipeline();
        let first = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true));

        // Far in the past: the gap saturates and reads as a throttled fix
        let outcome = p.process(&RawFix::new(37.7750, -122.4195, 8.0, i64::MIN), true);
        assert_eq!(outcome, FixOutcome::Throttled { since_last_ms: i64::MIN });
        assert_eq!(p.current(), Some(&first));

        let mut p = pipeline();
        p.process(&RawFix::new(37.7749, -122.4194, 8.0, i64::MIN), true);
        let late = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, i64::MAX), true));
        assert_eq!(late.timestamp, i64::MAX);
        assert_eq!(late.calculated_speed, Some(0.0));
        assert_eq!(p.history_len(), 2);
    }

    #[test]
    fn test_huge_throttle_saturates_instead_of_wrapping() {
        let config = TrackingConfig {
            update_throttle_ms: u64::MAX,
            ..TrackingConfig::default()
        };
        let mut p = FixPipeline::new(&config);
        accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true));
        let outcome = p.process(&RawFix::new(37.7750, -122.4195, 8.0, 3_600_000), true);
        assert_eq!(outcome, FixOutcome::Throttled { since_last_ms: 3_599_000 });
        assert_eq!(p.history_len(), 1);
    }

    #[test]
    fn test_excessive_speed_is_flagged_and_stored() {
        let mut p = pipeline();
        p.process(&RawFix::new(37.7749, -122.4194, 8.0, 1_000), true);
        let jump = accepted(p.process(&RawFix::new(37.8749, -122.4194, 8.0, 2_000), true));

        assert_eq!(jump.validation_warning.as_deref(), Some(SPEED_WARNING));
        assert!(jump.calculated_speed.unwrap() > 150.0);
        assert_eq!(p.current(), Some(&jump));
        assert_eq!(p.history_len(), 2);

        // The flagged fix becomes the anchor for the next check
        let next = accepted(p.process(&RawFix::new(37.8749, -122.4193, 8.0, 4_000), true));
        assert!(next.distance_from_previous.unwrap() < 10.0);
        assert_eq!(next.validation_warning, None);
    }

    #[test]
    fn test_reset_clears_buffers_and_filters() {
        let mut p = pipeline();
        for i in 0..5 {
            p.process(&RawFix::new(37.7749 + i as f64 * 1e-4, -122.4194, 8.0, i * 2_000), true);
        }
        let current = p.current().cloned();
        assert!(p.filter_variance().0 < DEFAULT_ESTIMATION_ERROR);

        p.reset();
        assert_eq!(p.history_len(), 0);
        assert_eq!(p.average_accuracy(), None);
        assert_eq!(p.quality(), None);
        assert_eq!(p.filter_variance(), (DEFAULT_ESTIMATION_ERROR, DEFAULT_ESTIMATION_ERROR));
        assert_eq!(p.current().cloned(), current);

        // Next fix reseeds instead of smoothing against the old anchor
        let record = accepted(p.process(&RawFix::new(40.0, -100.0, 8.0, 100_000), true));
        assert_eq!(record.latitude, 40.0);
        assert_eq!(record.distance_from_previous, None);
    }

    #[test]
    fn test_history_bounded() {
        let mut p = pipeline();
        for i in 0..60 {
            p.process(&RawFix::new(37.7749, -122.4194, 5.0, i * 1_000), true);
        }
        let history = p.history();
        assert_eq!(history.len(), POSITION_HISTORY_CAPACITY);
        assert_eq!(history[0].timestamp, 10_000);
        assert_eq!(history[49].timestamp, 59_000);
    }

    #[test]
    fn test_network_mode_source() {
        let mut p = pipeline();
        let record = accepted(p.process(&RawFix::new(37.7749, -122.4194, 8.0, 0), false));
        assert_eq!(record.source, LocationSource::Network);
    }

    #[test]
    fn test_noise_not_flagged() {
        let mut p = pipeline();
        p.process(&RawFix::new(37.7749, -122.4194, 8.0, 0), true);
        let record = accepted(p.process(&RawFix::new(37.77491, -122.4194, 8.0, 2_000), true));
        assert_abs_diff_eq!(record.distance_from_previous.unwrap(), 1.11, epsilon = 0.01);
        assert_eq!(record.validation_warning, None);
    }
}
