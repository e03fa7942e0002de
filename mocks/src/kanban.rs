//! Recording Kanban sink double with failure injection.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::contracts::KanbanSink;
use marcus_core::error::{MarcusError, Result};
use marcus_core::models::Event;

/// Sink that records every applied event and can be told to fail the next
/// N calls with a retryable error.
#[derive(Default)]
pub struct RecordingKanban {
    applied: Mutex<Vec<Event>>,
    fail_next: AtomicUsize,
}

impl RecordingKanban {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with an integration error
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Events successfully applied, in order
    pub fn applied(&self) -> Vec<Event> {
        self.applied.lock().clone()
    }

    pub fn applied_types(&self) -> Vec<String> {
        self.applied.lock().iter().map(|e| e.event_type.clone()).collect()
    }
}

#[async_trait]
impl KanbanSink for RecordingKanban {
    async fn apply(&self, event: &Event) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(MarcusError::integration("injected board failure"));
        }
        // Idempotent by event id
        let mut applied = self.applied.lock();
        if !applied.iter().any(|e| e.event_id == event.event_id) {
            applied.push(event.clone());
        }
        Ok(())
    }

    fn provider(&self) -> &str {
        "recording"
    }
}
