//! Distance and bearing between WGS-84 coordinates.
//!
//! On-device checks use the spherical haversine formula. The backend compares
//! distances with an ellipsoidal method; `vincenty_distance` reproduces that
//! for cross-checks, and the two may disagree at the sub-meter to meter level.

use geo::{Point, VincentyDistance};
use serde::{Deserialize, Serialize};

use crate::error::{LResult, LocationError};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Validated latitude/longitude pair in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> LResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(LocationError::InvalidCoordinate(format!(
                "latitude must be between -90 and 90, got {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::InvalidCoordinate(format!(
                "longitude must be between -180 and 180, got {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance_meters(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    fn to_point(self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

/// Great-circle distance in meters (haversine, spherical Earth).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Forward azimuth from the first point to the second, degrees in `[0, 360)`.
pub fn initial_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let numerator = d_lon.sin() * lat2_rad.cos();
    let denominator =
        lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * d_lon.cos();
    numerator.atan2(denominator).to_degrees().rem_euclid(360.0)
}

/// Ellipsoidal distance in meters. Falls back to haversine when the
/// iteration does not converge (nearly antipodal points).
pub fn vincenty_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    match a.to_point().vincenty_distance(&b.to_point()) {
        Ok(distance) => distance,
        Err(_) => {
            log::debug!(
                "Vincenty failed to converge for ({}, {}) -> ({}, {}), using haversine",
                a.latitude,
                a.longitude,
                b.latitude,
                b.longitude
            );
            a.distance_to(b)
        }
    }
}

/// Whether `point` lies within `radius_m` of `center`, with the measured distance.
pub fn is_within_radius(center: &Coordinate, point: &Coordinate, radius_m: f64) -> (bool, f64) {
    let distance = vincenty_distance(center, point);
    (distance <= radius_m, distance)
}

/// Closest `max_results` points to `center`, nearest first.
pub fn nearest<'a, K>(
    center: &Coordinate,
    points: &'a [(K, Coordinate)],
    max_results: usize,
) -> Vec<(&'a K, Coordinate, f64)> {
    let mut ranked: Vec<(&K, Coordinate, f64)> = points
        .iter()
        .map(|(key, coord)| (key, *coord, vincenty_distance(center, coord)))
        .collect();
    ranked.sort_by(|a, b| a.2.total_cmp(&b.2));
    ranked.truncate(max_results);
    ranked
}
