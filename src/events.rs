//! Synchronous publish/subscribe bus for session events.

use crate::exercise::{CatalogStatus, ProgressSummary};
use crate::session::Panel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionReady,
    SessionDestroyed,
    PanelToggled,
    TerminalCommand,
    ExercisesLoaded,
    ExerciseSelected,
    ExerciseAttempted,
    ExerciseCompleted,
    StateSaved,
    StateLoaded,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::SessionReady,
        EventKind::SessionDestroyed,
        EventKind::PanelToggled,
        EventKind::TerminalCommand,
        EventKind::ExercisesLoaded,
        EventKind::ExerciseSelected,
        EventKind::ExerciseAttempted,
        EventKind::ExerciseCompleted,
        EventKind::StateSaved,
        EventKind::StateLoaded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionReady => "session:ready",
            EventKind::SessionDestroyed => "session:destroyed",
            EventKind::PanelToggled => "panel:toggled",
            EventKind::TerminalCommand => "terminal:command",
            EventKind::ExercisesLoaded => "exercises:loaded",
            EventKind::ExerciseSelected => "exercise:selected",
            EventKind::ExerciseAttempted => "exercise:attempted",
            EventKind::ExerciseCompleted => "exercise:completed",
            EventKind::StateSaved => "state:saved",
            EventKind::StateLoaded => "state:loaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum LabEvent {
    #[serde(rename = "session:ready")]
    SessionReady { session_id: String },
    #[serde(rename = "session:destroyed")]
    SessionDestroyed { session_id: String },
    #[serde(rename = "panel:toggled")]
    PanelToggled { panel: Panel, visible: bool },
    #[serde(rename = "terminal:command")]
    TerminalCommand {
        command: String,
        output: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "exercises:loaded")]
    ExercisesLoaded { count: usize, status: CatalogStatus },
    #[serde(rename = "exercise:selected")]
    ExerciseSelected { exercise_id: String },
    #[serde(rename = "exercise:attempted")]
    ExerciseAttempted { exercise_id: String, attempts: u32 },
    #[serde(rename = "exercise:completed")]
    ExerciseCompleted {
        exercise_id: String,
        summary: ProgressSummary,
    },
    #[serde(rename = "state:saved")]
    StateSaved { key: String, cached_locally: bool },
    #[serde(rename = "state:loaded")]
    StateLoaded { session_id: String },
}

impl LabEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LabEvent::SessionReady { .. } => EventKind::SessionReady,
            LabEvent::SessionDestroyed { .. } => EventKind::SessionDestroyed,
            LabEvent::PanelToggled { .. } => EventKind::PanelToggled,
            LabEvent::TerminalCommand { .. } => EventKind::TerminalCommand,
            LabEvent::ExercisesLoaded { .. } => EventKind::ExercisesLoaded,
            LabEvent::ExerciseSelected { .. } => EventKind::ExerciseSelected,
            LabEvent::ExerciseAttempted { .. } => EventKind::ExerciseAttempted,
            LabEvent::ExerciseCompleted { .. } => EventKind::ExerciseCompleted,
            LabEvent::StateSaved { .. } => EventKind::StateSaved,
            LabEvent::StateLoaded { .. } => EventKind::StateLoaded,
        }
    }
}

pub type Handler = Arc<dyn Fn(&LabEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every event.
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&mut self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription { id, kind, handler });
        id
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LabEvent) + Send + Sync + 'static,
    {
        self.subscribe(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event kind.
    pub fn on_any<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&LabEvent) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler))
    }

    /// Returns false when `id` was not subscribed to `kind`.
    pub fn off(&mut self, kind: EventKind, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|s| !(s.id == id && s.kind.map_or(true, |k| k == kind)));
        self.subscriptions.len() != before
    }

    /// Deliver `event` to matching handlers in subscription order. A
    /// panicking handler is logged and skipped.
    pub fn emit(&self, event: &LabEvent) {
        let kind = event.kind();
        for sub in &self.subscriptions {
            if sub.kind.is_some_and(|k| k != kind) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))).is_err() {
                warn!(event = kind.as_str(), subscription = sub.id.0, "Event handler panicked");
            }
        }
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
