//! Error types for registration, step execution, and engine operations.

use flowrun_types::error::RepositoryError;
use flowrun_types::execution::{ErrorKind, ExecutionError, ExecutionStatus};
use thiserror::Error;
use uuid::Uuid;

use super::expression::ExpressionError;
use super::invoker::InvokeError;

/// Every reason a flow definition was rejected at registration.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid flow definition: {}", .reasons.join("; "))]
pub struct ValidationErrors {
    pub reasons: Vec<String>,
}

/// Failure of a single step attempt; the retry/on-error policy decides
/// what happens next.
#[derive(Debug, Error)]
pub enum StepError {
    /// Missing or unusable step configuration.
    #[error("step configuration error: {0}")]
    Config(String),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("action failed: {0}")]
    Action(#[from] InvokeError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("subprocess failed: {0}")]
    Subprocess(String),

    #[error("parallel branches failed: {0}")]
    Branches(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("engine error: {0}")]
    Engine(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Config(_)
            | StepError::Expression(_)
            | StepError::Subprocess(_)
            | StepError::Branches(_)
            | StepError::Transform(_) => ErrorKind::Step,
            StepError::Action(_) => ErrorKind::Action,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Engine(_) => ErrorKind::Engine,
        }
    }

    pub fn to_execution_error(&self, step_id: &str) -> ExecutionError {
        ExecutionError {
            message: self.to_string(),
            step_id: Some(step_id.to_string()),
            kind: self.kind(),
        }
    }
}

/// Why a step list stopped early.
#[derive(Debug, Clone, PartialEq)]
pub enum Abort {
    /// `on_error: stop` (or an engine limit) failed the execution.
    Failed(ExecutionError),
    /// Cancellation or timeout was observed at a step boundary.
    Interrupted(ExecutionStatus),
}

/// Errors returned by `FlowEngine` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("flow '{id}' version '{version}' is already registered")]
    FlowVersionExists { id: String, version: String },

    #[error("flow '{0}' not found")]
    FlowNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("timed out waiting for execution {0}")]
    WaitTimeout(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_joins_reasons() {
        let err = ValidationErrors {
            reasons: vec!["flow id is required".into(), "flow has no steps".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalid flow definition: flow id is required; flow has no steps"
        );
    }

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(StepError::Config("x".into()).kind(), ErrorKind::Step);
        assert_eq!(
            StepError::Action(InvokeError::Failed("boom".into())).kind(),
            ErrorKind::Action
        );
        assert_eq!(StepError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        let exec_err = StepError::Engine("flow gone".into()).to_execution_error("call");
        assert_eq!(exec_err.step_id.as_deref(), Some("call"));
        assert_eq!(exec_err.kind, ErrorKind::Engine);
    }
}
