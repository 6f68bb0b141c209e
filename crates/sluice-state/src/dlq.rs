use crate::StateError;
use async_trait::async_trait;
use sluice_core::model::DeadLetterEntry;
use std::sync::Mutex;
use uuid::Uuid;

/// Append-only dead-letter log. Entries leave only through explicit
/// operator deletes.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push(&self, entry: &DeadLetterEntry) -> Result<(), StateError>;

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StateError>;

    async fn count(&self) -> Result<usize, StateError>;

    async fn delete(&self, entry_id: Uuid) -> Result<bool, StateError>;
}

#[derive(Default)]
pub struct MemoryDlqStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn push(&self, entry: &DeadLetterEntry) -> Result<(), StateError> {
        self.entries
            .lock()
            .expect("dlq mutex poisoned")
            .push(entry.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StateError> {
        let entries = self.entries.lock().expect("dlq mutex poisoned");
        Ok(entries.iter().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<usize, StateError> {
        Ok(self.entries.lock().expect("dlq mutex poisoned").len())
    }

    async fn delete(&self, entry_id: Uuid) -> Result<bool, StateError> {
        let mut entries = self.entries.lock().expect("dlq mutex poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.entry_id != entry_id);
        Ok(entries.len() < before)
    }
}
