//! Route recording on top of the position stream.
//!
//! Points are the measured coordinates of each record. The smoothed
//! coordinates trail a moving user and would undercount distance.
//!
//! Applies its own distance sanity filter: flagged records, segments faster
//! than `MAX_SPEED_MPS` and moves shorter than `MIN_SIGNIFICANT_MOVEMENT_M`
//! are skipped without advancing the anchor, so slow drift is only counted
//! once it adds up to a real move.

use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::broadcaster::Subscription;
use crate::geodesy::initial_bearing_deg;
use crate::tracker::LocationTracker;
use crate::types::PositionRecord;
use crate::validation::{MovementValidator, MovementVerdict, TimedPosition};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub accuracy: f64,
}

impl From<&PositionRecord> for RoutePoint {
    fn from(record: &PositionRecord) -> Self {
        Self {
            latitude: record.raw_latitude,
            longitude: record.raw_longitude,
            timestamp: record.timestamp,
            accuracy: record.accuracy,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SegmentOutcome {
    /// First point of the route
    Started,
    Added { distance_m: f64 },
    SkippedFlagged,
    SkippedTooFast,
    SkippedTooShort,
}

#[derive(Debug, Default)]
pub struct RouteRecorder {
    points: Vec<RoutePoint>,
    total_distance_m: f64,
    skipped_segments: usize,
    validator: MovementValidator,
}

impl RouteRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a shared recorder to a tracker's position stream.
    pub fn attach(tracker: &LocationTracker) -> (Arc<Mutex<RouteRecorder>>, Subscription) {
        let recorder = Arc::new(Mutex::new(RouteRecorder::new()));
        let sink = recorder.clone();
        let subscription = tracker.subscribe(move |record| {
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(record);
        });
        (recorder, subscription)
    }

    pub fn record(&mut self, record: &PositionRecord) -> SegmentOutcome {
        if record.is_flagged() {
            self.skipped_segments += 1;
            return SegmentOutcome::SkippedFlagged;
        }

        let Some(anchor) = self.points.last().cloned() else {
            self.points.push(RoutePoint::from(record));
            return SegmentOutcome::Started;
        };

        let check = self.validator.validate(
            &TimedPosition::new(anchor.latitude, anchor.longitude, anchor.timestamp),
            &TimedPosition::new(record.raw_latitude, record.raw_longitude, record.timestamp),
        );
        if check.verdict == MovementVerdict::ExcessiveSpeed {
            self.skipped_segments += 1;
            return SegmentOutcome::SkippedTooFast;
        }
        if check.distance_m < self.validator.min_significant_movement_m {
            self.skipped_segments += 1;
            return SegmentOutcome::SkippedTooShort;
        }

        self.total_distance_m += check.distance_m;
        self.points.push(RoutePoint::from(record));
        SegmentOutcome::Added {
            distance_m: check.distance_m,
        }
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    pub fn total_distance_m(&self) -> f64 {
        self.total_distance_m
    }

    pub fn skipped_segments(&self) -> usize {
        self.skipped_segments
    }

    /// Heading of the most recent counted segment
    pub fn last_bearing_deg(&self) -> Option<f64> {
        match self.points.as_slice() {
            [.., from, to] => Some(initial_bearing_deg(
                from.latitude,
                from.longitude,
                to.latitude,
                to.longitude,
            )),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.total_distance_m = 0.0;
        self.skipped_segments = 0;
    }
}
