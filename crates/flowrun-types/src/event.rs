//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast to external subscribers (metrics, audit, CLI
//! progress). All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionStatus, TraceEntry};

/// Events emitted by the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A flow version passed validation and was added to the registry.
    FlowRegistered { flow_id: String, version: String },

    /// A flow was removed from the registry (every version).
    FlowUnregistered { flow_id: String },

    /// An execution was created in `pending` status.
    ExecutionCreated {
        execution_id: Uuid,
        flow_id: String,
        triggered_by: String,
    },

    /// An execution was admitted past the concurrency gate.
    ExecutionStarted { execution_id: Uuid, flow_id: String },

    /// An execution reached a terminal status.
    ExecutionCompleted {
        execution_id: Uuid,
        flow_id: String,
        status: ExecutionStatus,
        duration_ms: Option<u64>,
    },

    /// An execution was cancelled by a caller or by forced shutdown.
    ExecutionCancelled { execution_id: Uuid, flow_id: String },

    /// A step-level trace entry was appended to an execution's trace log.
    StepTrace { execution_id: Uuid, entry: TraceEntry },
}

impl EngineEvent {
    /// The execution this event concerns, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::FlowRegistered { .. } | EngineEvent::FlowUnregistered { .. } => None,
            EngineEvent::ExecutionCreated { execution_id, .. }
            | EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id, .. }
            | EngineEvent::StepTrace { execution_id, .. } => Some(*execution_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let id = Uuid::now_v7();
        let event = EngineEvent::ExecutionCompleted {
            execution_id: id,
            flow_id: "orders".into(),
            status: ExecutionStatus::Failed,
            duration_ms: Some(12),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_completed");
        assert_eq!(json["status"], "failed");
        assert_eq!(event.execution_id(), Some(id));

        let registered = EngineEvent::FlowRegistered {
            flow_id: "orders".into(),
            version: "1".into(),
        };
        assert_eq!(registered.execution_id(), None);
    }
}
