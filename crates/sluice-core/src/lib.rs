pub mod breaker;
pub mod errors;
pub mod model;
pub mod retry;
pub mod template;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use errors::{DagValidationError, TemplateError};
pub use model::{
    DagGraph, DeadLetterEntry, ErrorCategory, ErrorDetail, ExecutionRecord, ExecutionStatus,
    NodeRecord, NodeSpec, NodeStatus, NodeUpdate, WorkflowDefinition,
};
pub use retry::{RetryPolicy, backoff_delay, backoff_delay_with_rng, base_backoff_delay};
pub use template::{evaluate_condition, resolve_config, resolve_text};

/// Node id of the synthetic completion published when an execution is
/// triggered. Never present in a workflow definition; the underscore
/// prefix is reserved for exactly this kind of virtual node.
pub const TRIGGER_NODE_ID: &str = "_trigger";

/// Node id under which trigger parameters are exposed as an output, so
/// root node configs can reference `{{_params.key}}`.
pub const PARAMS_NODE_ID: &str = "_params";
