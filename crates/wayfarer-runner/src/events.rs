//! Execution events published by a navigator.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use wayfarer_agent::SurfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StepStarted,
    ActionStarted,
    ActionOk,
    ActionFailed,
    StepOk,
    StepFailed,
    StepCancelled,
    SurfaceCreated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StepStarted => "step-started",
            EventKind::ActionStarted => "action-started",
            EventKind::ActionOk => "action-ok",
            EventKind::ActionFailed => "action-failed",
            EventKind::StepOk => "step-ok",
            EventKind::StepFailed => "step-failed",
            EventKind::StepCancelled => "step-cancelled",
            EventKind::SurfaceCreated => "surface-created",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    /// Id of the navigator that emitted the event.
    pub navigator: String,
    pub step: usize,
    pub surface_id: Option<SurfaceId>,
    pub message: String,
}

/// Fan-out channel for [`ExecutionEvent`]s. Sends never block; slow
/// subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        debug!(
            "[{}] step {} {}: {}",
            event.navigator,
            event.step,
            event.kind.as_str(),
            event.message
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
