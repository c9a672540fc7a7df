use std::time;

use thiserror::Error;

use crate::envelope::ModelType;
use crate::status::{ProcessingStatus, TransitionError};

/// Caller input is malformed. Never retried: redelivering the same input fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("failed to parse request: {0}")]
    Malformed(String),
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("fields with invalid type: {}", .0.join(", "))]
    InvalidTypes(Vec<String>),
    #[error("invalid value {value:?} for {field}, expected one of: {}", .allowed.join(", "))]
    InvalidValue {
        field: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("{0}")]
    Constraint(String),
}

/// Enumeration of errors for operations with a `DurableStore`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(String),
    #[error("{command} query failed with: {message}")]
    Query {
        command: &'static str,
        message: String,
    },
    #[error("conditional update rejected for {table}/{key}: status is not {expected}")]
    ConditionFailed {
        table: String,
        key: String,
        expected: ProcessingStatus,
    },
}

/// Errors raised by the routing bus and the durable queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("failed to publish to the bus: {0}")]
    Bus(String),
    #[error("message exceeds the maximum size accepted by the bus")]
    MessageTooBig,
    #[error("failed to enqueue message: {0}")]
    Queue(String),
    #[error("failed to serialize message: {0}")]
    Serialization(String),
}

/// Errors raised while consuming a durable queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("connection failed with: {0}")]
    Connection(String),
    #[error("{command} query failed with: {message}")]
    Query {
        command: &'static str,
        message: String,
    },
    #[error("message {0} is not running")]
    NotRunning(i64),
    #[error("{0} is not a valid MessageStatus")]
    ParseMessageStatus(String),
}

/// Errors raised while invoking a model backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no backend configured for model type {0}")]
    NotConfigured(ModelType),
    #[error("{model_type} backend request failed: {message}")]
    Request {
        model_type: ModelType,
        message: String,
    },
    #[error("{model_type} backend responded with status {status}: {body}")]
    Status {
        model_type: ModelType,
        status: u16,
        body: String,
    },
    #[error("{model_type} backend returned an unsuccessful result")]
    Unsuccessful { model_type: ModelType },
}

/// The best-effort notification could not be published. Logged by the caller, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification request failed: {0}")]
    Request(String),
    #[error("notification endpoint responded with status {0}")]
    Status(u16),
}

/// A single batch item failed. Recorded in the batch report, never aborts the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("item {index} failed: {message}")]
pub struct ItemError {
    pub index: usize,
    pub message: String,
}

impl ItemError {
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Everything that can fail an invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        stage: &'static str,
        after: time::Duration,
    },
}

impl PipelineError {
    /// Validation failures and invalid transitions fail identically on redelivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation(_) | PipelineError::Transition(_)
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Store(_) => "store",
            PipelineError::Dispatch(DispatchError::Queue(_)) => "queue",
            PipelineError::Dispatch(_) => "bus",
            PipelineError::Backend(_) => "backend",
            PipelineError::Transition(_) => "transition",
            PipelineError::Timeout { .. } => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let error = PipelineError::from(ValidationError::MissingFields(vec!["payload".into()]));
        assert!(!error.is_retryable());
        assert_eq!(error.kind(), "validation");
        assert_eq!(error.to_string(), "missing required fields: payload");
    }

    #[test]
    fn dependency_errors_are_retryable() {
        let error = PipelineError::from(DispatchError::Queue("connection reset".into()));
        assert!(error.is_retryable());
        assert_eq!(error.kind(), "queue");

        let error = PipelineError::Timeout {
            stage: "persist",
            after: time::Duration::from_millis(50),
        };
        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "persist timed out after 50ms");
    }

    #[test]
    fn invalid_value_lists_allowed_values() {
        let error = ValidationError::InvalidValue {
            field: "modelType".into(),
            value: "unknown".into(),
            allowed: vec!["bedrock".into(), "sagemaker".into()],
        };
        assert_eq!(
            error.to_string(),
            "invalid value \"unknown\" for modelType, expected one of: bedrock, sagemaker"
        );
    }
}
