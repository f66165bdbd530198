//! `flowrun run`: execute one flow on an in-memory engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use flowrun_core::repository::InMemoryFlowStore;
use flowrun_core::workflow::{ExecuteOptions, FlowEngine};
use flowrun_infra::agent::SimulatedAgentInvoker;
use flowrun_infra::flow_files::load_flow_file;
use flowrun_types::execution::ExecutionStatus;
use serde_json::Value;

use super::display::print_execution;
use super::loader::{engine_config, flows_in, register_all};

pub struct RunArgs {
    pub file: PathBuf,
    pub inputs: Vec<(String, Value)>,
    pub flows: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub timeout_secs: u64,
}

pub async fn run(args: RunArgs, json: bool) -> Result<ExitCode> {
    let flow = load_flow_file(&args.file).await?;
    let flow_id = flow.id.clone();

    let config = engine_config(args.config.as_deref()).await;
    let engine = FlowEngine::new(
        config,
        InMemoryFlowStore::new(),
        Arc::new(SimulatedAgentInvoker::permissive()),
    );

    let mut flows = flows_in(args.flows.as_deref()).await?;
    flows.retain(|(_, f)| f.id != flow_id);
    flows.push((args.file.clone(), flow));
    for (path, error) in register_all(&engine, flows) {
        if path == args.file {
            bail!("{}: {error}", path.display());
        }
        tracing::warn!(path = %path.display(), error = %error, "flow not registered");
    }

    let inputs: HashMap<String, Value> = args.inputs.into_iter().collect();
    let id = engine.execute_flow(&flow_id, inputs, ExecuteOptions::default())?;
    let wait = engine
        .wait_for_execution(id, Duration::from_secs(args.timeout_secs))
        .await;

    if let Err(e) = wait {
        tracing::warn!(error = %e, "gave up waiting for execution, cancelling");
        engine.cancel_execution(id)?;
    }
    let exec = engine
        .get_execution(id)
        .with_context(|| format!("execution {id} is no longer tracked"))?;
    engine.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
    } else {
        print_execution(&exec);
    }

    Ok(if exec.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
