//! Event Recorder Adapters
//!
//! Implements the `EventRecorder` port with logging, in-memory and fan-out
//! backends.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::events::{ControllerEvent, EventKind, EventReason};
use crate::domain::ports::EventRecorder;
use crate::error::Result;

/// Logging-based event recorder.
///
/// Writes events to the tracing system. Warnings are always logged at warn
/// level; normal events at info or debug.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventRecorder {
    /// Whether to log normal events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder that logs normal events at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

#[async_trait]
impl EventRecorder for LoggingEventRecorder {
    async fn record(&self, event: ControllerEvent) -> Result<()> {
        let object = event.object_name();
        let kind = event.regarding.kind.as_deref().unwrap_or_default();
        match event.kind {
            EventKind::Warning => {
                warn!(reason = %event.reason, %kind, %object, "{}", event.message)
            }
            EventKind::Normal if self.info_level => {
                info!(reason = %event.reason, %kind, %object, "{}", event.message)
            }
            EventKind::Normal => {
                debug!(reason = %event.reason, %kind, %object, "{}", event.message)
            }
        }
        Ok(())
    }
}

/// In-memory event collector for testing.
///
/// Collects events in memory for later inspection during tests.
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    events: parking_lot::RwLock<Vec<ControllerEvent>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events with a specific reason.
    pub fn with_reason(&self, reason: EventReason) -> Vec<ControllerEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    pub fn warnings(&self) -> Vec<ControllerEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.is_warning())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for InMemoryEventRecorder {
    async fn record(&self, event: ControllerEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

/// Fans events out to several recorders.
///
/// Every recorder sees every event; the first error is returned after all
/// have been tried.
#[derive(Default)]
pub struct CompositeEventRecorder {
    recorders: Vec<Arc<dyn EventRecorder>>,
}

impl CompositeEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }
}

impl std::fmt::Debug for CompositeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventRecorder")
            .field("recorders", &self.recorders.len())
            .finish()
    }
}

#[async_trait]
impl EventRecorder for CompositeEventRecorder {
    async fn record(&self, event: ControllerEvent) -> Result<()> {
        let mut first_error = None;
        for recorder in &self.recorders {
            if let Err(e) = recorder.record(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
