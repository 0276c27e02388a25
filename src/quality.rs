use crate::history::{BoundedHistory, ACCURACY_WINDOW};
use crate::types::{LocationSource, RawFix};

/// Accuracy at or below this is attributed to satellite positioning
pub const GPS_ACCURACY_LIMIT_M: f64 = 20.0;
/// Accuracy at or below this (and above the GPS limit) is network positioning
pub const NETWORK_ACCURACY_LIMIT_M: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Accepted,
    Malformed,
    TooInaccurate,
}

/// Drops fixes whose reported accuracy radius exceeds the configured maximum.
#[derive(Clone, Debug)]
pub struct AccuracyGate {
    pub min_accuracy_m: f64,
    pub max_accuracy_m: f64,
}

impl AccuracyGate {
    pub fn new(min_accuracy_m: f64, max_accuracy_m: f64) -> Self {
        Self {
            min_accuracy_m,
            max_accuracy_m,
        }
    }

    pub fn admit(&self, fix: &RawFix) -> GateDecision {
        if !fix.is_well_formed() {
            GateDecision::Malformed
        } else if fix.accuracy > self.max_accuracy_m {
            GateDecision::TooInaccurate
        } else {
            GateDecision::Accepted
        }
    }

    /// Whether a fix reaches the desired tier. Informational only.
    pub fn meets_target(&self, fix: &RawFix) -> bool {
        fix.accuracy <= self.min_accuracy_m
    }
}

/// Attribute a fix to a positioning technology by its accuracy radius.
///
/// In network mode a fix is never labelled better than `Network`.
pub fn classify_source(accuracy: f64, high_accuracy: bool) -> LocationSource {
    let by_accuracy = if accuracy <= GPS_ACCURACY_LIMIT_M {
        LocationSource::Gps
    } else if accuracy <= NETWORK_ACCURACY_LIMIT_M {
        LocationSource::Network
    } else {
        LocationSource::Cell
    };
    if high_accuracy {
        by_accuracy
    } else {
        by_accuracy.max(LocationSource::Network)
    }
}

/// Map an average accuracy radius to a 0-100 signal quality.
///
/// The piecewise score is rounded to the nearest integer, so 12 m
/// (90.67) reports 91 and 100 m reports 50.
pub fn quality_score(avg_accuracy: f64) -> u8 {
    let score = if avg_accuracy < 5.0 {
        100.0
    } else if avg_accuracy <= 20.0 {
        80.0 + (20.0 - avg_accuracy) / 15.0 * 20.0
    } else if avg_accuracy <= 100.0 {
        50.0 + (100.0 - avg_accuracy) / 80.0 * 30.0
    } else {
        (50.0 - (avg_accuracy - 100.0) / 2.0).max(0.0)
    };
    score.round().clamp(0.0, 100.0) as u8
}

/// Rolling accuracy over the most recent accepted fixes
#[derive(Clone, Debug)]
pub struct QualityScorer {
    samples: BoundedHistory<f64>,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(ACCURACY_WINDOW)
    }
}

impl QualityScorer {
    pub fn new(window: usize) -> Self {
        Self {
            samples: BoundedHistory::new(window),
        }
    }

    pub fn record(&mut self, accuracy: f64) {
        self.samples.push(accuracy);
    }

    pub fn average_accuracy(&self) -> Option<f64> {
        self.samples.mean()
    }

    pub fn quality(&self) -> Option<u8> {
        self.average_accuracy().map(quality_score)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
