//! Shared setup for commands: engine config and bulk flow registration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flowrun_core::repository::FlowStore;
use flowrun_core::workflow::{EngineError, FlowEngine};
use flowrun_infra::config::load_engine_config;
use flowrun_infra::flow_files::load_flow_dir;
use flowrun_types::config::EngineConfig;
use flowrun_types::flow::FlowDefinition;

pub async fn engine_config(path: Option<&Path>) -> EngineConfig {
    match path {
        Some(path) => load_engine_config(path).await,
        None => EngineConfig::default(),
    }
}

/// Flow definitions found in `dir`, or none when no directory was given.
pub async fn flows_in(dir: Option<&Path>) -> Result<Vec<(PathBuf, FlowDefinition)>> {
    match dir {
        Some(dir) => load_flow_dir(dir)
            .await
            .with_context(|| format!("failed to read flow directory {}", dir.display())),
        None => Ok(Vec::new()),
    }
}

/// Register `flows`, retrying rejected ones until no more succeed.
///
/// A flow may reference another flow through a subprocess step, so the
/// order of files on disk does not have to match dependency order. Flow
/// versions already in the registry count as registered. Returns the flows
/// that could not be registered.
pub fn register_all<S: FlowStore>(
    engine: &FlowEngine<S>,
    flows: Vec<(PathBuf, FlowDefinition)>,
) -> Vec<(PathBuf, EngineError)> {
    let mut remaining = flows;
    loop {
        let before = remaining.len();
        let mut rejected = Vec::new();
        for (path, flow) in remaining {
            let flow_id = flow.id.clone();
            match engine.register_flow(flow.clone()) {
                Ok(()) => tracing::debug!(flow_id = %flow_id, path = %path.display(), "flow file loaded"),
                Err(EngineError::FlowVersionExists { .. }) => {
                    tracing::debug!(flow_id = %flow_id, "flow version already registered");
                }
                Err(e) => rejected.push((path, flow, e)),
            }
        }

        if rejected.is_empty() || rejected.len() == before {
            return rejected.into_iter().map(|(path, _, e)| (path, e)).collect();
        }
        remaining = rejected.into_iter().map(|(path, flow, _)| (path, flow)).collect();
    }
}
