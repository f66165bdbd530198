//! Simulated agent invoker for local runs and demos.
//!
//! [`SimulatedAgentInvoker`] implements the `AgentInvoker` port from
//! flowrun-core without talking to any real agent. A few actions have
//! built-in behaviour; every other action is acknowledged as assigned.
//!
//! | action  | behaviour |
//! |---------|-----------|
//! | `echo`  | returns the inputs unchanged |
//! | `sleep` | waits `duration_ms` (default 100), then returns `{ slept_ms }` |
//! | `fail`  | fails with the `message` input |
//! | other   | returns `{ agent_id, task, parameters, status: "assigned", assigned_at }` |

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use flowrun_core::workflow::invoker::{AgentInvoker, InvokeError};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

const BUILTIN_ACTIONS: [&str; 3] = ["echo", "sleep", "fail"];

#[derive(Debug, Clone)]
struct SimulatedAgent {
    /// Empty means every action is accepted.
    capabilities: HashSet<String>,
}

/// In-process stand-in for real agents.
#[derive(Debug)]
pub struct SimulatedAgentInvoker {
    agents: RwLock<HashMap<String, SimulatedAgent>>,
    /// Accept agent ids that were never registered.
    permissive: bool,
}

impl SimulatedAgentInvoker {
    /// Only registered agents are accepted.
    pub fn strict() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            permissive: false,
        }
    }

    /// Any agent id is accepted and supports every action.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::strict()
        }
    }

    /// Register an agent. An empty capability list accepts every action.
    pub fn register_agent(&self, agent_id: impl Into<String>, capabilities: &[&str]) {
        let agent = SimulatedAgent {
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        };
        self.agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(agent_id.into(), agent);
    }

    fn check(&self, agent_id: &str, action: &str) -> Result<(), InvokeError> {
        let agents = self.agents.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match agents.get(agent_id) {
            None if self.permissive => Ok(()),
            None => Err(InvokeError::UnknownAgent(agent_id.to_string())),
            Some(agent)
                if agent.capabilities.is_empty()
                    || agent.capabilities.contains(action)
                    || BUILTIN_ACTIONS.contains(&action) =>
            {
                Ok(())
            }
            Some(_) => Err(InvokeError::UnknownAction {
                agent_id: agent_id.to_string(),
                action: action.to_string(),
            }),
        }
    }
}

impl AgentInvoker for SimulatedAgentInvoker {
    fn invoke<'a>(
        &'a self,
        agent_id: &'a str,
        action: &'a str,
        inputs: HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<Value, InvokeError>> {
        Box::pin(async move {
            self.check(agent_id, action)?;
            tracing::debug!(agent_id, action, "simulated agent invoked");

            match action {
                "echo" => Ok(Value::Object(inputs.into_iter().collect())),
                "sleep" => {
                    let ms = inputs.get("duration_ms").and_then(Value::as_u64).unwrap_or(100);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({ "slept_ms": ms }))
                }
                "fail" => {
                    let message = inputs
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("simulated failure");
                    Err(InvokeError::Failed(message.to_string()))
                }
                task => Ok(json!({
                    "agent_id": agent_id,
                    "task": task,
                    "parameters": inputs,
                    "status": "assigned",
                    "assigned_at": Utc::now().to_rfc3339(),
                })),
            }
        })
    }
}
