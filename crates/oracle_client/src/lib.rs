use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use shared::{
    domain::{ReasoningStep, ScoutData, Stage, StrategyDraft, ToolInvocation},
    protocol::{ReasoningState, StateUpdate},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

pub mod error;
mod local_binding;
pub mod observers;
pub mod pulse;

pub use local_binding::{LocalAgentBinding, RunHandler, DEFAULT_UPDATE_CAPACITY};
pub use observers::{ObserverRegistry, Subscription};
pub use pulse::{PulseController, DEFAULT_PULSE_DECAY};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport side of the controller: owns the canonical snapshot remotely and
/// starts runs.
#[async_trait]
pub trait AgentBinding: Send + Sync {
    /// Overwrites the remote snapshot. Never merges.
    fn set_state(&self, snapshot: ReasoningState);
    /// Starts remote execution with whatever `query` is currently set.
    async fn run(&self) -> Result<()>;
}

pub struct DetachedAgentBinding;

#[async_trait]
impl AgentBinding for DetachedAgentBinding {
    fn set_state(&self, _snapshot: ReasoningState) {}

    async fn run(&self) -> Result<()> {
        Err(anyhow!("reasoning agent binding is unavailable"))
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub pulse_decay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            pulse_decay: DEFAULT_PULSE_DECAY,
        }
    }
}

/// Derived read-only view handed to the rendering side.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningView {
    pub state: ReasoningState,
    pub is_loading: bool,
    pub is_active: bool,
    pub current_node: Stage,
    pub pulsing_node: Option<Stage>,
}

impl ReasoningView {
    pub fn reasoning_trace(&self) -> &[ReasoningStep] {
        &self.state.reasoning_trace
    }

    pub fn tool_calls(&self) -> &[ToolInvocation] {
        &self.state.tool_calls
    }

    pub fn scout_data(&self) -> Option<&ScoutData> {
        self.state.scout_data.as_ref()
    }

    pub fn strategy_draft(&self) -> Option<&StrategyDraft> {
        self.state.strategy_draft.as_ref()
    }

    pub fn risk_score(&self) -> f64 {
        self.state.risk_score
    }

    pub fn final_recommendation(&self) -> Option<&str> {
        self.state.final_recommendation.as_deref()
    }

    pub fn requires_backtrack(&self) -> bool {
        self.state.requires_backtrack
    }

    pub fn backtrack_reason(&self) -> Option<&str> {
        self.state.backtrack_reason.as_deref()
    }

    pub fn backtrack_count(&self) -> u32 {
        self.state.backtrack_count
    }
}

struct StateMirror {
    snapshot: Option<ReasoningState>,
    running: bool,
    previous_stage: Stage,
    /// Detected transitions not yet delivered, in detection order.
    pending: VecDeque<Stage>,
    /// Set while one caller is delivering `pending`.
    dispatching: bool,
    torn_down: bool,
}

impl StateMirror {
    fn current_stage(&self) -> Stage {
        self.snapshot
            .as_ref()
            .map(|snapshot| snapshot.active_node)
            .unwrap_or_default()
    }

    /// Returns the new stage when it differs from the retained one.
    fn detect_transition(&mut self) -> Option<Stage> {
        let current = self.current_stage();
        if current == self.previous_stage {
            return None;
        }
        self.previous_stage = current;
        Some(current)
    }

    /// Queues a detected transition. Returns true when the caller must
    /// deliver the queue; false when another caller is already doing so.
    fn enqueue_transition(&mut self) -> bool {
        if let Some(stage) = self.detect_transition() {
            self.pending.push_back(stage);
        }
        if self.dispatching || self.pending.is_empty() {
            return false;
        }
        self.dispatching = true;
        true
    }
}

/// Releases the delivery slot when a callback panics mid-delivery.
struct DispatchGuard<'a> {
    mirror: &'a Mutex<StateMirror>,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(self.mirror).dispatching = false;
        }
    }
}

/// Mirrors the remote reasoning pipeline and notifies on stage transitions.
pub struct ReasoningController {
    binding: Arc<dyn AgentBinding>,
    mirror: Mutex<StateMirror>,
    pulse: PulseController,
    observers: ObserverRegistry,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReasoningController {
    pub fn new(binding: Arc<dyn AgentBinding>) -> Arc<Self> {
        Self::new_with_options(binding, ControllerOptions::default())
    }

    pub fn new_with_options(
        binding: Arc<dyn AgentBinding>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            binding,
            mirror: Mutex::new(StateMirror {
                snapshot: None,
                running: false,
                previous_stage: Stage::Idle,
                pending: VecDeque::new(),
                dispatching: false,
                torn_down: false,
            }),
            pulse: PulseController::new(options.pulse_decay),
            observers: ObserverRegistry::new(),
            sync_task: Mutex::new(None),
        })
    }

    /// Current snapshot, or the canonical default before the first remote one.
    pub fn state(&self) -> ReasoningState {
        lock(&self.mirror).snapshot.clone().unwrap_or_default()
    }

    pub fn current_stage(&self) -> Stage {
        lock(&self.mirror).current_stage()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.mirror).running
    }

    pub fn pulsing_stage(&self) -> Option<Stage> {
        self.pulse.current()
    }

    pub fn watch_pulse(&self) -> watch::Receiver<Option<Stage>> {
        self.pulse.subscribe()
    }

    pub fn view(&self) -> ReasoningView {
        let (state, running) = {
            let mirror = lock(&self.mirror);
            (mirror.snapshot.clone().unwrap_or_default(), mirror.running)
        };
        let current_node = state.active_node;
        ReasoningView {
            state,
            is_loading: running,
            is_active: current_node.is_active(),
            current_node,
            pulsing_node: self.pulse.current(),
        }
    }

    pub fn on_stage_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Stage) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Applies one inbound message from the remote side.
    ///
    /// The snapshot replaces the mirror wholesale. Pulse and observers only
    /// react when the active stage differs from the retained previous stage,
    /// so redelivering an unchanged snapshot has no side effects.
    ///
    /// Transitions reach observers in the order their snapshots were applied,
    /// also when updates race in from several threads or from inside a
    /// callback. A caller that finds another delivery in progress hands its
    /// transition to that delivery and returns without waiting for it.
    ///
    /// Must be called from within a Tokio runtime: a transition arms the
    /// pulse decay timer with `tokio::spawn`.
    pub fn apply_update(&self, update: StateUpdate) {
        let deliver = {
            let mut mirror = lock(&self.mirror);
            if mirror.torn_down {
                debug!("ignoring snapshot after teardown");
                return;
            }
            mirror.snapshot = update.snapshot;
            mirror.running = update.running;
            mirror.enqueue_transition()
        };

        if deliver {
            self.deliver_transitions();
        }
    }

    /// Optimistic local overwrite, forwarded to the binding.
    ///
    /// Same ordering and runtime requirements as [`Self::apply_update`].
    pub fn set_state(&self, snapshot: ReasoningState) {
        let deliver = {
            let mut mirror = lock(&self.mirror);
            if mirror.torn_down {
                debug!("ignoring local write after teardown");
                return;
            }
            mirror.snapshot = Some(snapshot.clone());
            mirror.enqueue_transition()
        };

        self.binding.set_state(snapshot);

        if deliver {
            self.deliver_transitions();
        }
    }

    /// Resets to a clean snapshot carrying `text`, then starts one remote run.
    ///
    /// Blank input is ignored. Errors from the binding's run are returned as is.
    pub async fn send_query(&self, text: &str) -> Result<()> {
        let query = text.trim();
        if query.is_empty() {
            debug!("ignoring blank query");
            return Ok(());
        }
        if lock(&self.mirror).torn_down {
            warn!("query submitted after teardown; ignoring");
            return Ok(());
        }

        self.set_state(ReasoningState::for_query(query));
        info!(query, "starting reasoning run");
        self.binding.run().await
    }

    /// Restores the canonical snapshot and clears all transient local state.
    pub fn reset(&self) {
        {
            let mut mirror = lock(&self.mirror);
            if mirror.torn_down {
                return;
            }
            mirror.snapshot = Some(ReasoningState::default());
            mirror.previous_stage = Stage::Idle;
            mirror.pending.clear();
            self.pulse.clear();
        }
        self.binding.set_state(ReasoningState::default());
        info!("reasoning state reset");
    }

    /// Feeds an ordered snapshot stream into [`Self::apply_update`].
    ///
    /// Replaces any previously attached stream. The driver holds only a weak
    /// reference and stops when the controller goes away.
    pub fn attach<S>(self: &Arc<Self>, updates: S)
    where
        S: Stream<Item = StateUpdate> + Send + 'static,
    {
        let controller: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut updates = Box::pin(updates);
            while let Some(update) = updates.next().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.apply_update(update);
            }
            debug!("snapshot stream ended");
        });

        if let Some(previous) = lock(&self.sync_task).replace(task) {
            previous.abort();
        }
    }

    /// Ends the controller's lifetime: stops the sync driver, cancels the
    /// decay timer and drops all subscriptions.
    pub fn teardown(&self) {
        {
            let mut mirror = lock(&self.mirror);
            mirror.torn_down = true;
            mirror.pending.clear();
        }
        if let Some(task) = lock(&self.sync_task).take() {
            task.abort();
        }
        self.pulse.clear();
        self.observers.clear();
        info!("reasoning controller torn down");
    }

    /// Drains the pending queue. Only the caller that claimed the
    /// `dispatching` slot runs this, so broadcasts never interleave.
    fn deliver_transitions(&self) {
        let _slot = DispatchGuard {
            mirror: &self.mirror,
        };
        loop {
            let stage = {
                let mut mirror = lock(&self.mirror);
                let Some(stage) = mirror.pending.pop_front() else {
                    mirror.dispatching = false;
                    return;
                };
                // Pulse follows the same order as the broadcasts.
                self.pulse.start(stage);
                stage
            };
            info!(stage = %stage, "stage transition");
            let notified = self.observers.broadcast(stage);
            debug!(stage = %stage, notified, "stage change broadcast");
        }
    }
}

impl Drop for ReasoningController {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.sync_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
