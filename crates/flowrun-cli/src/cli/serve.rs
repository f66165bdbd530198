//! `flowrun serve`: long-running engine driven by flow schedules.
//!
//! Registers every flow file in a directory on top of whatever the SQLite
//! store already holds, logs engine events, and on Ctrl+C (or SIGTERM)
//! shuts the engine down gracefully so state is persisted.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use flowrun_core::workflow::FlowEngine;
use flowrun_infra::agent::SimulatedAgentInvoker;
use flowrun_infra::sqlite::pool::default_database_url;
use flowrun_infra::sqlite::store::SqliteFlowStore;
use flowrun_types::event::EngineEvent;
use tokio::sync::broadcast::error::RecvError;

use super::display::{print_schedules, print_stats};
use super::loader::{engine_config, flows_in, register_all};

pub async fn serve(flows_dir: &Path, db: Option<&str>, config: Option<&Path>, json: bool) -> Result<ExitCode> {
    let database_url = db.map(str::to_string).unwrap_or_else(default_database_url);
    ensure_database_dir(&database_url).await?;

    let store = SqliteFlowStore::connect(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;
    let engine = FlowEngine::new(
        engine_config(config).await,
        store,
        Arc::new(SimulatedAgentInvoker::permissive()),
    );
    engine.initialize().await?;

    let flows = flows_in(Some(flows_dir)).await?;
    let mut failures = 0usize;
    for (path, error) in register_all(&engine, flows) {
        failures += 1;
        tracing::error!(path = %path.display(), error = %error, "flow not registered");
    }

    let events = tokio::spawn(log_events(engine.subscribe()));

    if !json {
        println!();
        println!(
            "  {} flowrun serving {} flows ({} rejected)",
            style("⚡").bold(),
            engine.list_flows().len(),
            failures
        );
        print_schedules(&engine.list_schedules());
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    engine.shutdown().await?;
    events.abort();

    let stats = engine.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!();
        print_stats(&stats);
        println!("\n  Engine stopped.");
    }
    Ok(ExitCode::SUCCESS)
}

/// Create the directory holding a file-backed SQLite database.
async fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::ExecutionCompleted {
                execution_id,
                flow_id,
                status,
                duration_ms,
            }) => {
                tracing::info!(%execution_id, flow_id = %flow_id, %status, ?duration_ms, "execution finished");
            }
            Ok(EngineEvent::StepTrace { .. }) => {}
            Ok(event) => tracing::debug!(?event, "engine event"),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")
    }
}
