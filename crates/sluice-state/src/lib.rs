pub mod definitions;
pub mod dlq;
pub mod keys;
mod memory;
mod store;

pub use definitions::{
    DefinitionStore, LocalFsDefinitionStore, MemoryDefinitionStore, TerminalRecord,
};
pub use dlq::{DlqStore, MemoryDlqStore};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use store::{Fields, RateLimitDecision, StateStore, StreamMessage};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("state store error: {0}")]
    Other(String),
}
