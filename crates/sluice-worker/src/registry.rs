use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Failure surface a handler can signal. Everything except
/// `Validation` and `NonRetryable` re-enters the retry loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    NonRetryable(String),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// An opaque task handler: resolved config in, JSON output out.
pub type TaskHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a registrable handler.
pub fn handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |config| Box::pin(f(config)))
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, TaskHandler>,
    fallback: Option<TaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: TaskHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn register_fallback(&mut self, handler: TaskHandler) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, name: &str) -> Option<&TaskHandler> {
        self.handlers.get(name).or(self.fallback.as_ref())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
