//! Tracking controller.
//!
//! State machine:
//!
//! ```text
//!   Idle ──start──▶ Acquiring(high) ──fix──▶ Tracking(source) ──stop──▶ Stopped
//!                        │                       │   ▲
//!                unavailable/timeout     watch error, no fix yet
//!                        ▼                       ▼   │ fix
//!                  Acquiring(network)          Degraded
//!                        │
//!                     failure ──▶ Idle
//! ```
//!
//! Every session carries a generation number. `stop()` bumps it, and any
//! platform callback or pending acquisition holding an older generation is
//! ignored, so nothing is delivered after `stop()` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

use crate::broadcaster::{PositionBroadcaster, Subscription};
use crate::config::TrackingConfig;
use crate::error::{LResult, LocationError, PlatformError};
use crate::pipeline::{FixOutcome, FixPipeline};
use crate::platform::{GeolocationPlatform, PermissionState, PositionOptions, WatchId};
use crate::types::{LocationSource, PositionRecord, RawFix, TrackingState, TrackingStatus};

struct Session {
    state: TrackingState,
    config: TrackingConfig,
    pipeline: FixPipeline,
    watch: Option<WatchId>,
    restart_timer: Option<JoinHandle<()>>,
    source: Option<LocationSource>,
}

struct Shared {
    platform: Arc<dyn GeolocationPlatform>,
    broadcaster: PositionBroadcaster,
    session: Mutex<Session>,
    /// Serializes process-then-deliver for watch fixes
    processing: Mutex<()>,
    generation: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = session.restart_timer.take() {
            timer.abort();
        }
        if let Some(id) = session.watch.take() {
            self.platform.clear_watch(id);
        }
    }
}

/// Location tracking service. One instance per consumer graph; clones share
/// the same session.
#[derive(Clone)]
pub struct LocationTracker {
    shared: Arc<Shared>,
}

/// Callback endpoint handed to `GeolocationPlatform::watch`.
///
/// Bound to the session that opened the watch. Calls arriving after that
/// session ended, or after the tracker was dropped, are ignored.
#[derive(Clone)]
pub struct WatchSink {
    shared: Weak<Shared>,
    generation: u64,
}

impl WatchSink {
    pub fn deliver(&self, fix: RawFix) {
        if let Some(tracker) = self.tracker() {
            tracker.on_watch_fix(self.generation, fix);
        }
    }

    pub fn fail(&self, error: PlatformError) {
        if let Some(tracker) = self.tracker() {
            tracker.on_watch_error(self.generation, error);
        }
    }

    /// False once the owning session has ended
    pub fn is_live(&self) -> bool {
        self.tracker()
            .map(|tracker| tracker.is_current(self.generation))
            .unwrap_or(false)
    }

    fn tracker(&self) -> Option<LocationTracker> {
        self.shared.upgrade().map(|shared| LocationTracker { shared })
    }
}

impl std::fmt::Debug for WatchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSink")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl LocationTracker {
    pub fn new(platform: Arc<dyn GeolocationPlatform>) -> Self {
        let config = TrackingConfig::default();
        let pipeline = FixPipeline::new(&config);
        Self {
            shared: Arc::new(Shared {
                platform,
                broadcaster: PositionBroadcaster::new(),
                session: Mutex::new(Session {
                    state: TrackingState::Idle,
                    config,
                    pipeline,
                    watch: None,
                    restart_timer: None,
                    source: None,
                }),
                processing: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a first position, then keep a continuous watch open.
    ///
    /// Resolves with the first accepted position. A failed high-accuracy
    /// request is retried once in network mode before giving up.
    pub async fn start(&self, config: TrackingConfig) -> LResult<PositionRecord> {
        config.validate()?;
        let generation = self.begin_session(&config)?;
        log::info!(
            "Starting location tracking (high accuracy: {}, max accuracy {} m)",
            config.enable_high_accuracy,
            config.max_accuracy_m
        );

        if self.shared.platform.query_permission() == PermissionState::Denied {
            return Err(self.fail(generation, LocationError::PermissionDenied));
        }

        let first = match self.acquire(generation, PositionOptions::from_config(&config)).await {
            Ok(record) => record,
            Err(err) if err.should_retry() => {
                log::warn!("Position request failed ({}), retrying with network positioning", err);
                self.emit_error(generation, &err);
                self.enter_fallback(generation)?;

                match self
                    .acquire(generation, PositionOptions::network_fallback(&config))
                    .await
                {
                    Ok(record) => record,
                    Err(err) if err.should_retry() => {
                        log::warn!("Network fallback failed: {}", err);
                        self.emit_error(generation, &err);
                        self.abandon_acquisition(generation);
                        return Err(err);
                    }
                    Err(err) => return Err(self.fail(generation, err)),
                }
            }
            Err(err) => return Err(self.fail(generation, err)),
        };

        if !self.begin_tracking(generation, first.source) {
            return Err(LocationError::Stopped);
        }
        self.deliver(generation, &first);
        self.open_watch(generation);
        Ok(first)
    }

    /// End the session. Idempotent.
    pub fn stop(&self) {
        let (watch, timer) = {
            let mut session = self.lock_session();
            if session.state == TrackingState::Stopped {
                return;
            }
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            session.state = TrackingState::Stopped;
            session.source = None;
            session.pipeline.end_session();
            (session.watch.take(), session.restart_timer.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(id) = watch {
            self.shared.platform.clear_watch(id);
        }
        log::info!("Location tracking stopped");
    }

    /// Clear history, the accuracy window and filter state. The watch stays open.
    pub fn reset(&self) {
        self.lock_session().pipeline.reset();
        log::info!("Tracking history reset");
    }

    /// Listen for positions. Replays the current position before returning.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PositionRecord) + Send + Sync + 'static,
    {
        self.shared.broadcaster.subscribe(callback)
    }

    pub fn subscribe_to_errors<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LocationError) + Send + Sync + 'static,
    {
        self.shared.broadcaster.subscribe_to_errors(callback)
    }

    pub fn current_position(&self) -> Option<PositionRecord> {
        self.lock_session().pipeline.current().cloned()
    }

    /// Oldest-first copy of the last 50 accepted positions
    pub fn history(&self) -> Vec<PositionRecord> {
        self.lock_session().pipeline.history()
    }

    pub fn average_accuracy(&self) -> Option<f64> {
        self.lock_session().pipeline.average_accuracy()
    }

    /// 0-100, `None` until a fix has been accepted
    pub fn gps_quality(&self) -> Option<u8> {
        self.lock_session().pipeline.quality()
    }

    pub fn state(&self) -> TrackingState {
        self.lock_session().state
    }

    /// Effective config of the current session, including any fallback downgrade
    pub fn config(&self) -> TrackingConfig {
        self.lock_session().config.clone()
    }

    pub fn filter_variance(&self) -> (f64, f64) {
        self.lock_session().pipeline.filter_variance()
    }

    pub fn status(&self) -> TrackingStatus {
        let gps_available = self.shared.platform.is_available();
        let session = self.lock_session();
        TrackingStatus {
            is_tracking: session.state.is_tracking(),
            location_source: session.source,
            gps_available,
            current_position: session.pipeline.current().cloned(),
            average_accuracy: session.pipeline.average_accuracy(),
            gps_quality: session.pipeline.quality(),
            history_size: session.pipeline.history_len(),
        }
    }

    // ── Session lifecycle ──

    fn begin_session(&self, config: &TrackingConfig) -> LResult<u64> {
        let mut session = self.lock_session();
        match session.state {
            TrackingState::Idle | TrackingState::Stopped => {}
            _ => return Err(LocationError::AlreadyActive),
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.state = TrackingState::Acquiring {
            high_accuracy: config.enable_high_accuracy,
        };
        session.config = config.clone();
        session.pipeline = FixPipeline::new(config);
        session.source = None;
        self.shared.broadcaster.clear_replay();
        Ok(generation)
    }

    fn enter_fallback(&self, generation: u64) -> LResult<()> {
        let mut session = self.lock_session();
        if !self.is_current(generation) {
            return Err(LocationError::Stopped);
        }
        session.config.enable_high_accuracy = false;
        session.state = TrackingState::Acquiring {
            high_accuracy: false,
        };
        Ok(())
    }

    fn abandon_acquisition(&self, generation: u64) {
        let mut session = self.lock_session();
        if self.is_current(generation) {
            session.state = TrackingState::Idle;
            session.source = None;
            session.pipeline.end_session();
        }
    }

    fn begin_tracking(&self, generation: u64, source: LocationSource) -> bool {
        let mut session = self.lock_session();
        if !self.is_current(generation) {
            return false;
        }
        session.source = Some(source);
        session.state = TrackingState::Tracking(source);
        log::info!("Tracking via {}", source);
        true
    }

    /// Fatal errors end the session; `Stopped` passes through untouched.
    fn fail(&self, generation: u64, err: LocationError) -> LocationError {
        if err.is_fatal() {
            log::error!("Location tracking failed: {}", err);
            self.emit_error(generation, &err);
            self.stop();
        }
        err
    }

    async fn acquire(&self, generation: u64, options: PositionOptions) -> LResult<PositionRecord> {
        let timeout = options.timeout;
        let high_accuracy = options.enable_high_accuracy;
        let request = self.shared.platform.request_once(options);
        let result = tokio::time::timeout(timeout, request).await;

        if !self.is_current(generation) {
            return Err(LocationError::Stopped);
        }
        let fix = match result {
            Ok(Ok(fix)) => fix,
            Ok(Err(err)) => return Err(err.into_location_error(timeout)),
            Err(_) => return Err(LocationError::Timeout(timeout)),
        };

        let outcome = {
            let _serial = self.lock_processing();
            let mut session = self.lock_session();
            if !self.is_current(generation) {
                return Err(LocationError::Stopped);
            }
            session.pipeline.process(&fix, high_accuracy)
        };

        match outcome {
            FixOutcome::Accepted(record) => Ok(record),
            FixOutcome::Rejected(decision) => Err(LocationError::Unavailable(format!(
                "one-shot fix rejected ({:?}, accuracy {:.1} m)",
                decision, fix.accuracy
            ))),
            FixOutcome::Throttled { .. } => Err(LocationError::Unavailable(
                "one-shot fix throttled".to_string(),
            )),
        }
    }

    // ── Watch management ──

    fn open_watch(&self, generation: u64) {
        let options = {
            let session = self.lock_session();
            if !self.is_current(generation) {
                return;
            }
            PositionOptions::from_config(&session.config)
        };

        let sink = WatchSink {
            shared: Arc::downgrade(&self.shared),
            generation,
        };
        let id = self.shared.platform.watch(options, sink);

        let stale = {
            let mut session = self.lock_session();
            if self.is_current(generation) {
                session.watch = Some(id);
                false
            } else {
                true
            }
        };
        if stale {
            self.shared.platform.clear_watch(id);
        }
    }

    fn on_watch_fix(&self, generation: u64, fix: RawFix) {
        let _serial = self.lock_processing();
        let record = {
            let mut session = self.lock_session();
            if !self.is_current(generation) || !session.state.is_tracking() {
                log::debug!("Ignoring fix at {} from an inactive watch", fix.timestamp_ms);
                return;
            }
            let high_accuracy = session.config.enable_high_accuracy;
            match session.pipeline.process(&fix, high_accuracy) {
                FixOutcome::Accepted(record) => {
                    if session.state == TrackingState::Degraded {
                        log::info!("Network-mode watch delivered a fix, tracking resumed");
                    }
                    session.source = Some(record.source);
                    session.state = TrackingState::Tracking(record.source);
                    record
                }
                _ => return,
            }
        };
        self.deliver(generation, &record);
    }

    fn on_watch_error(&self, generation: u64, error: PlatformError) {
        let err = {
            let session = self.lock_session();
            if !self.is_current(generation) {
                return;
            }
            error.into_location_error(session.config.timeout())
        };

        if err.is_fatal() {
            log::error!("Watch failed with {}, stopping", err);
            self.emit_error(generation, &err);
            self.stop();
            return;
        }

        log::warn!("Watch error: {}", err);
        self.emit_error(generation, &err);

        let downgraded = {
            let mut session = self.lock_session();
            let downgrade = self.is_current(generation)
                && session.pipeline.history_len() == 0
                && session.config.enable_high_accuracy;
            if downgrade {
                session.config.enable_high_accuracy = false;
                session.state = TrackingState::Degraded;
            }
            downgrade
        };
        if downgraded {
            log::info!("No position accepted yet, reopening watch in network mode");
            self.schedule_watch_restart(generation);
        }
    }

    fn schedule_watch_restart(&self, generation: u64) {
        let delay = self.lock_session().config.watch_restart_delay();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !delay.is_zero() => runtime,
            _ => {
                self.restart_watch(generation);
                return;
            }
        };

        let weak = Arc::downgrade(&self.shared);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                LocationTracker { shared }.restart_watch(generation);
            }
        });

        let mut session = self.lock_session();
        if self.is_current(generation) {
            if let Some(previous) = session.restart_timer.replace(timer) {
                previous.abort();
            }
        } else {
            timer.abort();
        }
    }

    fn restart_watch(&self, generation: u64) {
        let previous = {
            let mut session = self.lock_session();
            if !self.is_current(generation) || session.state != TrackingState::Degraded {
                return;
            }
            session.restart_timer = None;
            session.watch.take()
        };
        if let Some(id) = previous {
            self.shared.platform.clear_watch(id);
        }
        self.open_watch(generation);
    }

    // ── Delivery ──

    fn deliver(&self, generation: u64, record: &PositionRecord) {
        self.shared
            .broadcaster
            .publish_position(record, || self.is_current(generation));
    }

    fn emit_error(&self, generation: u64, err: &LocationError) {
        self.shared
            .broadcaster
            .publish_error(err, || self.is_current(generation));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == generation
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.shared.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_processing(&self) -> MutexGuard<'_, ()> {
        self.shared.processing.lock().unwrap_or_else(|e| e.into_inner())
    }
}
