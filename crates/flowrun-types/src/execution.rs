//! Execution-time types: executions, per-step state, metrics, trace entries,
//! and scheduled flows.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::FlowSchedule;

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of a flow execution.
///
/// `pending -> running -> {completed, failed, cancelled, timeout}`. A pending
/// execution may also go straight to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    /// True once the execution can no longer change status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: '{other}'")),
        }
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

// ---------------------------------------------------------------------------
// Errors recorded on executions
// ---------------------------------------------------------------------------

/// Category of an execution-time error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Step,
    Action,
    Timeout,
    Engine,
    Cancelled,
}

/// Structured error attached to an execution (or collected from a step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: ErrorKind,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{step}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Flow Execution
// ---------------------------------------------------------------------------

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: Uuid,
    pub flow_id: String,
    pub flow_version: String,
    pub status: ExecutionStatus,
    /// Trigger source: "manual", "scheduler", "event", "subprocess", ...
    pub triggered_by: String,
    pub variables: HashMap<String, Value>,
    pub step_states: HashMap<String, StepExecutionState>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Errors absorbed by `on_error: collect`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collected_errors: Vec<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_execution_ids: Vec<Uuid>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

impl FlowExecution {
    /// A fresh pending execution with an empty variable table.
    pub fn new(flow_id: impl Into<String>, flow_version: impl Into<String>, triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id: flow_id.into(),
            flow_version: flow_version.into(),
            status: ExecutionStatus::Pending,
            triggered_by: triggered_by.into(),
            variables: HashMap::new(),
            step_states: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outputs: HashMap::new(),
            error: None,
            collected_errors: Vec::new(),
            parent_execution_id: None,
            child_execution_ids: Vec::new(),
            metrics: ExecutionMetrics::default(),
            trace: Vec::new(),
        }
    }

    /// Wall-clock duration between start and completion, if both are set.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as u64)
    }

    /// Mark the execution terminal with `status`, stamping completion time
    /// and the duration metric.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionError>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.completed_at = Some(Utc::now());
        self.metrics.duration_ms = self.duration_ms();
    }
}

/// Per-execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub steps_executed: u32,
    pub steps_skipped: u32,
    pub steps_failed: u32,
    pub retries: u32,
    pub actions_invoked: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Live state of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionState {
    pub step_id: String,
    pub status: StepStatus,
    /// Attempts made so far, including the first.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<RetryRecord>,
}

impl StepExecutionState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            inputs: None,
            outputs: None,
            error: None,
            retry_history: Vec::new(),
        }
    }
}

/// One retry of a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Retry number, starting at 1.
    pub attempt: u32,
    pub error: String,
    pub delay_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trace log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One step-level lifecycle event in an execution's trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Scheduled flows
// ---------------------------------------------------------------------------

/// A flow bound to its recurring schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledFlow {
    pub flow_id: String,
    pub schedule: FlowSchedule,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_execution_status_from_str() {
        assert_eq!("timeout".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Timeout));
        assert!("done".parse::<ExecutionStatus>().is_err());
        assert_eq!(ExecutionStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_finish_sets_duration() {
        let mut exec = FlowExecution::new("f", "1", "manual");
        let start = Utc::now();
        exec.started_at = Some(start - chrono::Duration::milliseconds(250));
        exec.finish(ExecutionStatus::Completed, None);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.metrics.duration_ms.unwrap() >= 250);
        assert!(exec.error.is_none());
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError {
            message: "agent unavailable".into(),
            step_id: Some("fetch".into()),
            kind: ErrorKind::Action,
        };
        assert_eq!(err.to_string(), "[fetch] agent unavailable");
    }

    #[test]
    fn test_execution_json_uses_snake_case() {
        let exec = FlowExecution::new("f", "1", "scheduler");
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["triggered_by"], "scheduler");
        assert_eq!(json["metrics"]["steps_executed"], 0);
        let back: FlowExecution = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, exec.id);
    }
}
