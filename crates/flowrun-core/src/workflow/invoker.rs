//! Collaborator seams used by the step executor.
//!
//! `AgentInvoker` is the external target of `action` steps. `SubflowLauncher`
//! lets `subprocess` steps start and observe child executions without the
//! executor depending on the runner facade.
//!
//! Both traits are dyn-compatible (boxed futures rather than RPITIT) so the
//! executor can hold them as `Arc<dyn ...>`.

use std::collections::HashMap;

use flowrun_types::execution::FlowExecution;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    #[error("agent '{0}' not found")]
    UnknownAgent(String),

    #[error("agent '{agent_id}' does not support action '{action}'")]
    UnknownAction { agent_id: String, action: String },

    #[error("{0}")]
    Failed(String),
}

/// Executes `action` steps: `invoke(agent_id, action, inputs) -> result`.
pub trait AgentInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        agent_id: &'a str,
        action: &'a str,
        inputs: HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<Value, InvokeError>>;
}

/// Starts child executions for `subprocess` steps.
pub trait SubflowLauncher: Send + Sync {
    /// Start a child execution of `flow_id`, linked to `parent`.
    fn launch(
        &self,
        flow_id: &str,
        inputs: HashMap<String, Value>,
        parent: Uuid,
    ) -> Result<Uuid, String>;

    /// Current snapshot of an execution.
    fn snapshot(&self, execution_id: Uuid) -> Option<FlowExecution>;
}
