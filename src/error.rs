use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the tracking controller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    Unavailable(String),

    #[error("Position request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tracking already active")]
    AlreadyActive,

    #[error("Tracking stopped before a position was acquired")]
    Stopped,

    #[error("Invalid tracking config: {0}")]
    InvalidConfig(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

impl LocationError {
    /// Permission denial ends the session and is never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LocationError::PermissionDenied)
    }

    /// Unavailable and timeout errors go down the network fallback path.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            LocationError::Unavailable(_) | LocationError::Timeout(_)
        )
    }
}

/// Failures reported by the platform geolocation capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("timeout")]
    Timeout,
}

impl PlatformError {
    /// Convert with the timeout that was in force for the failed request.
    pub fn into_location_error(self, timeout: Duration) -> LocationError {
        match self {
            PlatformError::PermissionDenied => LocationError::PermissionDenied,
            PlatformError::PositionUnavailable(msg) => LocationError::Unavailable(msg),
            PlatformError::Timeout => LocationError::Timeout(timeout),
        }
    }
}

impl From<PlatformError> for LocationError {
    fn from(err: PlatformError) -> Self {
        err.into_location_error(Duration::ZERO)
    }
}

/// Result type for tracking operations
pub type LResult<T> = Result<T, LocationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(LocationError::PermissionDenied.is_fatal());
        assert!(!LocationError::PermissionDenied.should_retry());

        let unavailable = LocationError::Unavailable("no signal".to_string());
        assert!(!unavailable.is_fatal());
        assert!(unavailable.should_retry());

        let timeout = LocationError::Timeout(Duration::from_secs(10));
        assert!(timeout.should_retry());
        assert!(!LocationError::AlreadyActive.should_retry());
    }

    #[test]
    fn test_platform_error_conversion() {
        let err = PlatformError::Timeout.into_location_error(Duration::from_millis(500));
        assert_eq!(err, LocationError::Timeout(Duration::from_millis(500)));

        let err: LocationError = PlatformError::PermissionDenied.into();
        assert_eq!(err, LocationError::PermissionDenied);

        let err: LocationError = PlatformError::PositionUnavailable("indoors".into()).into();
        assert_eq!(err.to_string(), "Position unavailable: indoors");
    }
}
