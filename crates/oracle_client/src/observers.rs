use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use shared::domain::Stage;

use crate::lock;

pub type StageCallback = Arc<dyn Fn(Stage) + Send + Sync>;

struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    callback: StageCallback,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    entries: Vec<Registration>,
}

/// Instance-owned set of stage transition callbacks.
#[derive(Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Stage) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let mut state = lock(&self.inner);
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Registration {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });

        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes every callback registered when the broadcast begins, in
    /// registration order, and returns how many ran.
    ///
    /// The registry lock is released before any callback runs, so callbacks
    /// may subscribe or unsubscribe freely. A registration unsubscribed before
    /// its turn is skipped; one added during the broadcast waits for the next.
    pub fn broadcast(&self, stage: Stage) -> usize {
        let targets: Vec<(Arc<AtomicBool>, StageCallback)> = lock(&self.inner)
            .entries
            .iter()
            .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.callback)))
            .collect();

        let mut invoked = 0;
        for (active, callback) in targets {
            if active.load(Ordering::SeqCst) {
                callback(stage);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registration; outstanding [`Subscription`]s become inert.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut lock(&self.inner).entries);
        for entry in &entries {
            entry.active.store(false, Ordering::SeqCst);
        }
    }
}

/// Handle returned by [`ObserverRegistry::subscribe`].
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<RegistryState>>,
}

impl Subscription {
    /// Removes exactly this registration. Repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|entry| entry.id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "tests/observers_tests.rs"]
mod tests;
