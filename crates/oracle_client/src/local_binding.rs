use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use shared::protocol::{ReasoningState, StateUpdate};
use tokio::sync::broadcast;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::warn;

use crate::{error::AgentError, lock, AgentBinding};

pub const DEFAULT_UPDATE_CAPACITY: usize = 256;

/// Pipeline side of a [`LocalAgentBinding`]; receives the query of each run.
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn run(&self, binding: LocalAgentBinding, query: String) -> Result<()>;
}

struct LocalBindingInner {
    latest: Mutex<StateUpdate>,
    updates: broadcast::Sender<StateUpdate>,
    handler: Option<Arc<dyn RunHandler>>,
}

/// In-process binding: publishes every snapshot, in order, to its subscribers.
#[derive(Clone)]
pub struct LocalAgentBinding {
    inner: Arc<LocalBindingInner>,
}

impl Default for LocalAgentBinding {
    fn default() -> Self {
        Self::build(None, DEFAULT_UPDATE_CAPACITY)
    }
}

impl LocalAgentBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Arc<dyn RunHandler>) -> Self {
        Self::build(Some(handler), DEFAULT_UPDATE_CAPACITY)
    }

    /// Binding without a run handler whose subscribers may fall at most
    /// `capacity` updates behind. Zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(None, capacity)
    }

    fn build(handler: Option<Arc<dyn RunHandler>>, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(LocalBindingInner {
                latest: Mutex::new(StateUpdate::default()),
                updates,
                handler,
            }),
        }
    }

    pub fn current(&self) -> StateUpdate {
        lock(&self.inner.latest).clone()
    }

    /// Ordered update stream, starting with the current value.
    ///
    /// Every published update is delivered in order while the subscriber
    /// keeps within the channel capacity. A subscriber that falls further
    /// behind loses the oldest unread updates: a warning is logged and the
    /// stream resumes at the oldest update still buffered. Transitions that
    /// only existed in the lost updates are never observed, but the newest
    /// update is always buffered, so the mirrored snapshot still converges.
    pub fn updates(&self) -> impl Stream<Item = StateUpdate> + Send + 'static {
        let receiver = self.inner.updates.subscribe();
        let current = self.current();
        tokio_stream::once(current).chain(BroadcastStream::new(receiver).filter_map(
            |item| match item {
                Ok(update) => Some(update),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "snapshot subscriber lagged behind");
                    None
                }
            },
        ))
    }

    /// Replaces the snapshot, keeping the running flag.
    pub fn publish(&self, snapshot: ReasoningState) {
        self.emit(|update| update.snapshot = Some(snapshot));
    }

    pub fn set_running(&self, running: bool) {
        self.emit(|update| update.running = running);
    }

    fn emit(&self, change: impl FnOnce(&mut StateUpdate)) {
        let update = {
            let mut latest = lock(&self.inner.latest);
            change(&mut latest);
            latest.clone()
        };
        let _ = self.inner.updates.send(update);
    }
}

#[async_trait]
impl AgentBinding for LocalAgentBinding {
    fn set_state(&self, snapshot: ReasoningState) {
        self.publish(snapshot);
    }

    async fn run(&self) -> Result<()> {
        let Some(handler) = self.inner.handler.clone() else {
            return Err(AgentError::NoRunHandler.into());
        };
        let query = self
            .current()
            .snapshot
            .map(|snapshot| snapshot.query)
            .unwrap_or_default();
        handler.run(self.clone(), query).await
    }
}

#[cfg(test)]
#[path = "tests/local_binding_tests.rs"]
mod tests;
