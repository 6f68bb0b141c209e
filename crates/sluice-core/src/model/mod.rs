mod dag;
mod dead_letter;
mod error_detail;
mod execution;
mod status;

pub use dag::{DagGraph, NodeSpec, WorkflowDefinition};
pub use dead_letter::DeadLetterEntry;
pub use error_detail::{ErrorCategory, ErrorDetail, MAX_TRACEBACK_LEN};
pub use execution::{ExecutionRecord, NodeRecord, NodeUpdate};
pub use status::{ExecutionStatus, NodeStatus};
