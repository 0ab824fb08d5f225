//! In-memory dead-letter sink.

use staffing_views_core::dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterSink, DeadLetterStatus,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Entry {
    id: i64,
    letter: DeadLetter,
    status: DeadLetterStatus,
}

/// Captures dead letters for assertions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dead letter received, in arrival order.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|entry| entry.letter.clone())
            .collect()
    }

    /// Number of dead letters still pending.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|entry| entry.status == DeadLetterStatus::Pending)
            .count()
    }

    /// Mark a dead letter resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id.
    pub fn mark_resolved(&self, id: i64) -> Result<(), DeadLetterError> {
        self.set_status(id, DeadLetterStatus::Resolved)
    }

    /// Mark a dead letter discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id.
    pub fn mark_discarded(&self, id: i64) -> Result<(), DeadLetterError> {
        self.set_status(id, DeadLetterStatus::Discarded)
    }

    fn set_status(&self, id: i64, status: DeadLetterStatus) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(DeadLetterError::NotFound(id))?;
        entry.status = status;
        Ok(())
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap();
            let id = i64::try_from(entries.len()).unwrap_or(i64::MAX).saturating_add(1);
            entries.push(Entry {
                id,
                letter,
                status: DeadLetterStatus::Pending,
            });
            Ok(id)
        })
    }
}
