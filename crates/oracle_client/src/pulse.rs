use std::{sync::Arc, time::Duration};

use shared::domain::Stage;
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use crate::lock;

pub const DEFAULT_PULSE_DECAY: Duration = Duration::from_millis(1000);

struct DecayTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct PulseShared {
    timer: std::sync::Mutex<DecayTimer>,
    value: watch::Sender<Option<Stage>>,
}

impl PulseShared {
    fn expire(&self, generation: u64) {
        let mut timer = lock(&self.timer);
        // A newer pulse (or a clear) owns the slot now.
        if timer.generation != generation {
            return;
        }
        timer.handle = None;
        let previous = self.value.send_replace(None);
        debug!(stage = ?previous, "pulse decayed");
    }
}

/// Holds the single "currently pulsing" stage and its decay timer.
///
/// Every [`PulseController::start`] cancels the outstanding timer before arming
/// a new one, so the pulse clears exactly one decay interval after the latest
/// start. Timer tasks carry the generation they were armed for and only clear
/// the slot when that generation is still current.
pub struct PulseController {
    decay: Duration,
    shared: Arc<PulseShared>,
}

impl PulseController {
    pub fn new(decay: Duration) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            decay,
            shared: Arc::new(PulseShared {
                timer: std::sync::Mutex::new(DecayTimer {
                    generation: 0,
                    handle: None,
                }),
                value,
            }),
        }
    }

    pub fn decay(&self) -> Duration {
        self.decay
    }

    pub fn current(&self) -> Option<Stage> {
        *self.shared.value.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Stage>> {
        self.shared.value.subscribe()
    }

    /// Must be called from within a Tokio runtime.
    pub fn start(&self, stage: Stage) {
        let mut timer = lock(&self.shared.timer);
        timer.generation = timer.generation.wrapping_add(1);
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        self.shared.value.send_replace(Some(stage));

        let generation = timer.generation;
        let shared = Arc::clone(&self.shared);
        let decay = self.decay;
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(decay).await;
            shared.expire(generation);
        }));
        debug!(stage = %stage, generation, "pulse started");
    }

    /// Forces the controller back to idle and cancels any pending decay.
    pub fn clear(&self) {
        let mut timer = lock(&self.shared.timer);
        timer.generation = timer.generation.wrapping_add(1);
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        self.shared.value.send_replace(None);
    }

    pub fn has_pending_timer(&self) -> bool {
        lock(&self.shared.timer).handle.is_some()
    }
}

impl Drop for PulseController {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.shared.timer).handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/pulse_tests.rs"]
mod tests;
