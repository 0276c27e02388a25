pub mod axis_kalman;

pub use axis_kalman::{AxisFilterPair, AxisKalmanFilter, FilterState};
