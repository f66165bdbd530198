//! Flow and execution persistence port.
//!
//! The engine touches storage only at startup (`load_all_*`) and at shutdown
//! (`save_all_*`). There is no per-step durability.

use std::sync::Mutex;

use flowrun_types::error::RepositoryError;
use flowrun_types::execution::FlowExecution;
use flowrun_types::flow::FlowDefinition;

/// Bulk persistence for flow definitions and executions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// `save_all_*` replaces whatever was stored before.
pub trait FlowStore: Send + Sync + 'static {
    fn load_all_flows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowDefinition>, RepositoryError>> + Send;

    fn save_all_flows(
        &self,
        flows: &[FlowDefinition],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_all_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    fn save_all_executions(
        &self,
        executions: &[FlowExecution],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

impl<T: FlowStore> FlowStore for std::sync::Arc<T> {
    fn load_all_flows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowDefinition>, RepositoryError>> + Send {
        (**self).load_all_flows()
    }

    fn save_all_flows(
        &self,
        flows: &[FlowDefinition],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_all_flows(flows)
    }

    fn load_all_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send {
        (**self).load_all_executions()
    }

    fn save_all_executions(
        &self,
        executions: &[FlowExecution],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_all_executions(executions)
    }
}

/// Process-local store for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: Mutex<Vec<FlowDefinition>>,
    executions: Mutex<Vec<FlowExecution>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with state, as if left by an earlier run.
    pub fn with_state(flows: Vec<FlowDefinition>, executions: Vec<FlowExecution>) -> Self {
        Self {
            flows: Mutex::new(flows),
            executions: Mutex::new(executions),
        }
    }

    fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FlowStore for InMemoryFlowStore {
    async fn load_all_flows(&self) -> Result<Vec<FlowDefinition>, RepositoryError> {
        Ok(Self::guard(&self.flows).clone())
    }

    async fn save_all_flows(&self, flows: &[FlowDefinition]) -> Result<(), RepositoryError> {
        *Self::guard(&self.flows) = flows.to_vec();
        Ok(())
    }

    async fn load_all_executions(&self) -> Result<Vec<FlowExecution>, RepositoryError> {
        Ok(Self::guard(&self.executions).clone())
    }

    async fn save_all_executions(&self, executions: &[FlowExecution]) -> Result<(), RepositoryError> {
        *Self::guard(&self.executions) = executions.to_vec();
        Ok(())
    }
}
