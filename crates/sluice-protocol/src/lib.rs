mod fields;
mod messages;

pub use fields::{FieldMap, field, require_field};
pub use messages::{CompletionMessage, CompletionStatus, ProtocolError, TaskMessage};

/// Version stamped on every stream message. Consumers that see a higher
/// version must leave the message un-acknowledged for the reaper and
/// human intervention.
pub const SCHEMA_VERSION: u32 = 1;

/// Stream carrying dispatched tasks to workers.
pub const TASKS_STREAM: &str = "workflow:tasks";
/// Stream carrying task completions back to orchestrators.
pub const COMPLETIONS_STREAM: &str = "workflow:completions";
/// Dead-letter log.
pub const DLQ_STREAM: &str = "workflow:dlq";

/// Consumer group of orchestrator replicas on the completions stream.
pub const ORCHESTRATOR_GROUP: &str = "g:orchestrator";
/// Consumer group of worker replicas on the tasks stream.
pub const WORKER_GROUP: &str = "g:worker";
