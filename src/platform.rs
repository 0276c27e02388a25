//! Platform geolocation capability and a scripted implementation for tests
//! and log replay.

use futures::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::TrackingConfig;
use crate::error::PlatformError;
use crate::tracker::WatchSink;
use crate::types::RawFix;

/// Options for a one-shot request or a continuous watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the platform may return
    pub maximum_age: Duration,
}

impl PositionOptions {
    pub fn from_config(config: &TrackingConfig) -> Self {
        Self {
            enable_high_accuracy: config.enable_high_accuracy,
            timeout: config.timeout(),
            maximum_age: Duration::from_millis(config.maximum_age_ms),
        }
    }

    /// Low-power retry after the primary request failed
    pub fn network_fallback(config: &TrackingConfig) -> Self {
        Self {
            enable_high_accuracy: false,
            timeout: config.fallback_timeout(),
            maximum_age: Duration::from_millis(config.fallback_maximum_age_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    /// The platform cannot report permission ahead of a request
    Unknown,
}

/// Geolocation capability the controller drives.
///
/// Watch callbacks go through the `WatchSink`; implementations may call it
/// from any thread, including synchronously inside `watch`.
pub trait GeolocationPlatform: Send + Sync {
    fn request_once(&self, options: PositionOptions) -> BoxFuture<'static, Result<RawFix, PlatformError>>;

    fn watch(&self, options: PositionOptions, sink: WatchSink) -> WatchId;

    fn clear_watch(&self, id: WatchId);

    fn query_permission(&self) -> PermissionState {
        PermissionState::Unknown
    }

    /// Whether positioning hardware or services exist at all
    fn is_available(&self) -> bool {
        true
    }
}

/// Canned answer for the next one-shot request
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Fix(RawFix),
    Fail(PlatformError),
    /// Never resolves; the controller's timeout fires instead
    Hang,
}

struct ScriptState {
    responses: VecDeque<ScriptedResponse>,
    requests: Vec<PositionOptions>,
    next_watch: u64,
    active: BTreeMap<WatchId, (PositionOptions, WatchSink)>,
    opened: Vec<PositionOptions>,
    permission: PermissionState,
    available: bool,
}

/// In-memory platform driven by the caller.
///
/// One-shot requests pop queued responses in order; an empty queue answers
/// `PositionUnavailable`. Watches stay open until cleared and receive
/// whatever `emit_fix` / `emit_error` push at them.
pub struct ScriptedPlatform {
    state: Mutex<ScriptState>,
}

impl Default for ScriptedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                responses: VecDeque::new(),
                requests: Vec::new(),
                next_watch: 1,
                active: BTreeMap::new(),
                opened: Vec::new(),
                permission: PermissionState::Granted,
                available: true,
            }),
        }
    }

    pub fn queue_fix(&self, fix: RawFix) {
        self.lock().responses.push_back(ScriptedResponse::Fix(fix));
    }

    pub fn queue_error(&self, error: PlatformError) {
        self.lock().responses.push_back(ScriptedResponse::Fail(error));
    }

    pub fn queue_hang(&self) {
        self.lock().responses.push_back(ScriptedResponse::Hang);
    }

    pub fn set_permission(&self, permission: PermissionState) {
        self.lock().permission = permission;
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Push a fix to the most recently opened active watch.
    /// Returns false when no watch is open.
    pub fn emit_fix(&self, fix: RawFix) -> bool {
        match self.current_sink() {
            Some(sink) => {
                sink.deliver(fix);
                true
            }
            None => false,
        }
    }

    pub fn emit_error(&self, error: PlatformError) -> bool {
        match self.current_sink() {
            Some(sink) => {
                sink.fail(error);
                true
            }
            None => false,
        }
    }

    /// Options of every one-shot request made so far
    pub fn requests(&self) -> Vec<PositionOptions> {
        self.lock().requests.clone()
    }

    /// Options of every watch opened so far, cleared or not
    pub fn watches_opened(&self) -> Vec<PositionOptions> {
        self.lock().opened.clone()
    }

    pub fn active_watch_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn active_watch_options(&self) -> Option<PositionOptions> {
        self.lock()
            .active
            .values()
            .next_back()
            .map(|(options, _)| options.clone())
    }

    // Sink is cloned out so delivery runs without the platform lock held;
    // the controller calls back into clear_watch/watch from inside delivery.
    fn current_sink(&self) -> Option<WatchSink> {
        self.lock()
            .active
            .values()
            .next_back()
            .map(|(_, sink)| sink.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GeolocationPlatform for ScriptedPlatform {
    fn request_once(&self, options: PositionOptions) -> BoxFuture<'static, Result<RawFix, PlatformError>> {
        let response = {
            let mut state = self.lock();
            state.requests.push(options);
            state.responses.pop_front()
        };
        match response {
            Some(ScriptedResponse::Fix(fix)) => future::ready(Ok(fix)).boxed(),
            Some(ScriptedResponse::Fail(err)) => future::ready(Err(err)).boxed(),
            Some(ScriptedResponse::Hang) => future::pending::<Result<RawFix, PlatformError>>().boxed(),
            None => future::ready(Err(PlatformError::PositionUnavailable(
                "no scripted response".to_string(),
            )))
            .boxed(),
        }
    }

    fn watch(&self, options: PositionOptions, sink: WatchSink) -> WatchId {
        let mut state = self.lock();
        let id = WatchId(state.next_watch);
        state.next_watch += 1;
        state.opened.push(options.clone());
        state.active.insert(id, (options, sink));
        id
    }

    fn clear_watch(&self, id: WatchId) {
        self.lock().active.remove(&id);
    }

    fn query_permission(&self) -> PermissionState {
        self.lock().permission
    }

    fn is_available(&self) -> bool {
        self.lock().available
    }
}
