//! Precision location pipeline: per-axis Kalman smoothing, accuracy gating,
//! movement validation and throttling of platform position fixes, driven by a
//! tracking controller that falls back to network positioning when
//! high-accuracy acquisition fails.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod filters;
pub mod geodesy;
pub mod history;
pub mod pipeline;
pub mod platform;
pub mod quality;
pub mod route;
pub mod tracker;
pub mod types;
pub mod validation;

pub use broadcaster::{PositionBroadcaster, Subscription};
pub use config::TrackingConfig;
pub use error::{LResult, LocationError, PlatformError};
pub use platform::{GeolocationPlatform, PermissionState, PositionOptions, ScriptedPlatform, WatchId};
pub use route::RouteRecorder;
pub use tracker::{LocationTracker, WatchSink};
pub use types::{LocationSource, PositionRecord, RawFix, TrackingState, TrackingStatus};
