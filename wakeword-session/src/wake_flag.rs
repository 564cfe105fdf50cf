/// Process-wide wake flag
///
/// A boolean "wake word just fired" flag plus the text of the most recent
/// detection. Each pulse sets the flag and (re)starts a single reset timer;
/// when it elapses the flag drops back to false and the text stays.
///
/// The store is created by the host and shared as `Arc<WakeFlagStore>`.
/// The session controller is the only writer; any number of readers can
/// `subscribe` to changes or take a `snapshot`.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Delay before a pulsed flag resets
pub const WAKE_FLAG_RESET: Duration = Duration::from_millis(500);

/// Observable wake flag value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WakeFlagState {
    pub detected: bool,
    pub last_detection_text: Option<String>,
}

#[derive(Default)]
struct PendingReset {
    /// Bumped by every pulse; a timer only resets the flag it set
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct WakeFlagStore {
    state: Arc<watch::Sender<WakeFlagState>>,
    pending: Arc<Mutex<PendingReset>>,
    reset_after: Duration,
}

impl WakeFlagStore {
    /// Store with the standard 500ms reset delay
    pub fn new() -> Self {
        Self::with_reset_delay(WAKE_FLAG_RESET)
    }

    pub fn with_reset_delay(reset_after: Duration) -> Self {
        let (state, _) = watch::channel(WakeFlagState::default());

        Self {
            state: Arc::new(state),
            pending: Arc::new(Mutex::new(PendingReset::default())),
            reset_after,
        }
    }

    /// Set the flag, record `detection_text`, and restart the reset timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn pulse(&self, detection_text: impl Into<String>) {
        let text = detection_text.into();
        let mut pending = self.pending.lock();

        pending.generation = pending.generation.wrapping_add(1);
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        self.state.send_modify(|state| {
            state.detected = true;
            state.last_detection_text = Some(text);
        });

        let generation = pending.generation;
        let delay = self.reset_after;
        let state = Arc::clone(&self.state);
        let shared = Arc::clone(&self.pending);

        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut pending = shared.lock();
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            state.send_modify(|state| state.detected = false);
            trace!("Wake flag reset");
        }));
    }

    /// Current value
    pub fn snapshot(&self) -> WakeFlagState {
        self.state.borrow().clone()
    }

    pub fn is_detected(&self) -> bool {
        self.state.borrow().detected
    }

    pub fn last_detection_text(&self) -> Option<String> {
        self.state.borrow().last_detection_text.clone()
    }

    /// Receive every change from now on
    pub fn subscribe(&self) -> watch::Receiver<WakeFlagState> {
        self.state.subscribe()
    }

    /// True while a reset timer is outstanding
    pub fn has_pending_reset(&self) -> bool {
        self.pending.lock().timer.is_some()
    }

    /// Cancel any pending reset and clear the state
    pub fn shutdown(&self) {
        let mut pending = self.pending.lock();
        pending.generation = pending.generation.wrapping_add(1);
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        self.state.send_replace(WakeFlagState::default());
        debug!("Wake flag store shut down");
    }
}

impl Default for WakeFlagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WakeFlagStore {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.lock().timer.take() {
            timer.abort();
        }
    }
}
