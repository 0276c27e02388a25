use serde::{Deserialize, Serialize};

pub const DEFAULT_PROCESS_NOISE: f64 = 0.008;
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 25.0;
pub const DEFAULT_ESTIMATION_ERROR: f64 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub position_variance: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub estimation_error: f64,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            position_variance: DEFAULT_ESTIMATION_ERROR,
            process_noise: DEFAULT_PROCESS_NOISE,
            measurement_noise: DEFAULT_MEASUREMENT_NOISE,
            estimation_error: DEFAULT_ESTIMATION_ERROR,
        }
    }
}

/// Scalar random-walk Kalman filter for a single coordinate axis.
///
/// Predict: `P' = P + Q`
/// Update:  `K = P' / (P' + R)`, `x = x_prev + K * (z - x_prev)`, `P = (1 - K) * P'`
///
/// The previous estimate is passed in rather than stored, so the caller owns
/// the position and this type owns only the variance.
#[derive(Clone, Debug)]
pub struct AxisKalmanFilter {
    state: FilterState,
    update_count: u64,
}

impl AxisKalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64, estimation_error: f64) -> Self {
        Self {
            state: FilterState {
                position_variance: estimation_error,
                process_noise,
                measurement_noise,
                estimation_error,
            },
            update_count: 0,
        }
    }

    pub fn filter(&mut self, measurement: f64, previous_estimate: f64) -> f64 {
        let predicted_variance = self.state.position_variance + self.state.process_noise;
        let gain = predicted_variance / (predicted_variance + self.state.measurement_noise);
        let estimate = previous_estimate + gain * (measurement - previous_estimate);
        self.state.position_variance = (1.0 - gain) * predicted_variance;
        self.update_count += 1;
        estimate
    }

    pub fn reset(&mut self) {
        self.state.position_variance = self.state.estimation_error;
        self.update_count = 0;
    }

    pub fn variance(&self) -> f64 {
        self.state.position_variance
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Fixed point of the variance recursion for this filter's noise constants.
    pub fn steady_state_variance(&self) -> f64 {
        let q = self.state.process_noise;
        let r = self.state.measurement_noise;
        (-q + (q * q + 4.0 * q * r).sqrt()) / 2.0
    }
}

impl Default for AxisKalmanFilter {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROCESS_NOISE,
            DEFAULT_MEASUREMENT_NOISE,
            DEFAULT_ESTIMATION_ERROR,
        )
    }
}

/// Latitude and longitude filters for one tracking session
#[derive(Clone, Debug, Default)]
pub struct AxisFilterPair {
    pub latitude: AxisKalmanFilter,
    pub longitude: AxisKalmanFilter,
}

impl AxisFilterPair {
    /// Smooth a measurement against the previous filtered position.
    pub fn filter(&mut self, measurement: (f64, f64), previous: (f64, f64)) -> (f64, f64) {
        (
            self.latitude.filter(measurement.0, previous.0),
            self.longitude.filter(measurement.1, previous.1),
        )
    }

    pub fn reset(&mut self) {
        self.latitude.reset();
        self.longitude.reset();
    }
}
