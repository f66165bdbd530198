//! Runner facade: the flow registry, the execution table, and the engine
//! lifecycle.
//!
//! `FlowEngine` owns every piece of process-wide state. Executions are
//! created by `execute_flow`, admitted through the `ExecutionQueue`, and run
//! as tracked tasks; each termination releases a slot and re-drains the
//! queue.
//!
//! # Lifecycle
//!
//! 1. `initialize` loads persisted flows and executions and starts the
//!    scheduler tick loop.
//! 2. `shutdown` stops admitting work, cancels queued executions, waits up to
//!    the grace period for running ones, then force-cancels the rest and
//!    persists everything.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowrun_types::config::EngineConfig;
use flowrun_types::event::EngineEvent;
use flowrun_types::execution::{
    ErrorKind, ExecutionError, ExecutionStatus, FlowExecution, ScheduledFlow, StepStatus,
};
use flowrun_types::flow::FlowDefinition;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::FlowStore;

use super::context::{ExecutionContext, ExecutionControl, lock_record};
use super::definition::validate_flow;
use super::error::{Abort, EngineError};
use super::executor::StepExecutor;
use super::invoker::{AgentInvoker, SubflowLauncher};
use super::scheduler::ExecutionQueue;
use super::trigger::TriggerScheduler;

// ---------------------------------------------------------------------------
// Public option / query types
// ---------------------------------------------------------------------------

/// Options for `execute_flow`.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub triggered_by: String,
    /// Run a specific registered version instead of the current one.
    pub version: Option<String>,
    pub parent_execution_id: Option<Uuid>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            triggered_by: "manual".to_string(),
            version: None,
            parent_execution_id: None,
        }
    }
}

impl ExecuteOptions {
    pub fn triggered_by(source: impl Into<String>) -> Self {
        Self {
            triggered_by: source.into(),
            ..Self::default()
        }
    }
}

/// Filter for `list_executions`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub triggered_by: Option<String>,
    /// Only executions created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    fn matches(&self, exec: &FlowExecution) -> bool {
        self.flow_id.as_deref().is_none_or(|id| exec.flow_id == id)
            && self.status.is_none_or(|s| exec.status == s)
            && self.triggered_by.as_deref().is_none_or(|t| exec.triggered_by == t)
            && self.since.is_none_or(|since| exec.created_at >= since)
    }
}

/// Aggregate counters across the execution table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_flows: usize,
    pub total_executions: usize,
    pub active_executions: usize,
    pub queued_executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub average_duration_ms: f64,
    /// Executions that terminated within the last 60 seconds.
    pub throughput_per_minute: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Every registered version of one flow id.
struct FlowVersions {
    current: String,
    versions: HashMap<String, Arc<FlowDefinition>>,
}

#[derive(Clone)]
struct ExecutionHandle {
    record: Arc<Mutex<FlowExecution>>,
    control: Arc<ExecutionControl>,
}

impl ExecutionHandle {
    fn new(record: FlowExecution) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
            control: Arc::new(ExecutionControl::new()),
        }
    }

    fn snapshot(&self) -> FlowExecution {
        lock_record(&self.record).clone()
    }
}

struct EngineInner<S> {
    config: Arc<EngineConfig>,
    store: S,
    invoker: Arc<dyn AgentInvoker>,
    flows: DashMap<String, FlowVersions>,
    executions: DashMap<Uuid, ExecutionHandle>,
    queue: ExecutionQueue,
    triggers: TriggerScheduler,
    bus: EventBus,
    tracker: TaskTracker,
    /// Cancelled when shutdown begins; stops the tick loop.
    stopping: CancellationToken,
    /// Cancelled when the grace period runs out; interrupts sleeps and polls.
    force: CancellationToken,
    accepting: AtomicBool,
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// The workflow engine facade.
///
/// Generic over `S: FlowStore` for storage flexibility. Cheap to clone; all
/// clones share one engine. Methods that start executions must be called
/// from within a Tokio runtime.
pub struct FlowEngine<S: FlowStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: FlowStore> Clone for FlowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: FlowStore> FlowEngine<S> {
    pub fn new(mut config: EngineConfig, store: S, invoker: Arc<dyn AgentInvoker>) -> Self {
        config.max_concurrent_executions = config.max_concurrent_executions.max(1);
        let inner = EngineInner {
            queue: ExecutionQueue::new(config.max_concurrent_executions),
            triggers: TriggerScheduler::new(config.placeholder_schedule_offset_secs),
            bus: EventBus::new(config.event_bus_capacity),
            config: Arc::new(config),
            store,
            invoker,
            flows: DashMap::new(),
            executions: DashMap::new(),
            tracker: TaskTracker::new(),
            stopping: CancellationToken::new(),
            force: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Validate and register a flow version, making it the current version.
    pub fn register_flow(&self, flow: FlowDefinition) -> Result<(), EngineError> {
        validate_flow(&flow, &|id| self.inner.flows.contains_key(id))?;

        let flow_id = flow.id.clone();
        let version = flow.version.clone();
        let schedule = flow.schedule.clone();
        {
            let mut entry = self
                .inner
                .flows
                .entry(flow_id.clone())
                .or_insert_with(|| FlowVersions {
                    current: version.clone(),
                    versions: HashMap::new(),
                });
            if entry.versions.contains_key(&version) {
                return Err(EngineError::FlowVersionExists {
                    id: flow_id,
                    version,
                });
            }
            entry.versions.insert(version.clone(), Arc::new(flow));
            entry.current = version.clone();
        }

        match schedule {
            Some(schedule) => self.inner.triggers.upsert(&flow_id, &schedule, Utc::now()),
            None => {
                self.inner.triggers.remove(&flow_id);
            }
        }

        info!(flow_id = %flow_id, version = %version, "flow registered");
        self.inner
            .bus
            .publish(EngineEvent::FlowRegistered { flow_id, version });
        Ok(())
    }

    /// Remove every version of `flow_id` and its schedule.
    pub fn unregister_flow(&self, flow_id: &str) -> bool {
        let existed = self.inner.flows.remove(flow_id).is_some();
        self.inner.triggers.remove(flow_id);
        if existed {
            info!(flow_id, "flow unregistered");
            self.inner.bus.publish(EngineEvent::FlowUnregistered {
                flow_id: flow_id.to_string(),
            });
        }
        existed
    }

    /// Current version of `flow_id`.
    pub fn get_flow(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.resolve_flow(flow_id, None)
    }

    pub fn get_flow_version(&self, flow_id: &str, version: &str) -> Option<Arc<FlowDefinition>> {
        self.resolve_flow(flow_id, Some(version))
    }

    /// Current versions of every flow, sorted by id.
    pub fn list_flows(&self) -> Vec<Arc<FlowDefinition>> {
        let mut flows: Vec<Arc<FlowDefinition>> = self
            .inner
            .flows
            .iter()
            .filter_map(|entry| entry.versions.get(&entry.current).cloned())
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    fn resolve_flow(&self, flow_id: &str, version: Option<&str>) -> Option<Arc<FlowDefinition>> {
        let entry = self.inner.flows.get(flow_id)?;
        let version = version.unwrap_or(&entry.current);
        entry.versions.get(version).cloned()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Create a pending execution and queue it. Never blocks on capacity.
    pub fn execute_flow(
        &self,
        flow_id: &str,
        inputs: HashMap<String, Value>,
        options: ExecuteOptions,
    ) -> Result<Uuid, EngineError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let flow = self
            .resolve_flow(flow_id, options.version.as_deref())
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

        let mut record = FlowExecution::new(&flow.id, &flow.version, &options.triggered_by);
        record.parent_execution_id = options.parent_execution_id;
        for param in &flow.inputs {
            if let Some(default) = &param.default {
                record.variables.insert(param.name.clone(), default.clone());
            }
        }
        record.variables.extend(inputs);
        let system = [
            ("_execution_id", Value::String(record.id.to_string())),
            ("_flow_id", Value::String(flow.id.clone())),
            ("_flow_version", Value::String(flow.version.clone())),
            ("_start_time", Value::String(record.created_at.to_rfc3339())),
            ("_triggered_by", Value::String(options.triggered_by.clone())),
        ];
        for (name, value) in system {
            record.variables.insert(name.to_string(), value);
        }

        let id = record.id;
        self.inner.executions.insert(id, ExecutionHandle::new(record));

        if let Some(parent_id) = options.parent_execution_id {
            let parent = self.inner.executions.get(&parent_id).map(|h| h.record.clone());
            if let Some(parent) = parent {
                lock_record(&parent).child_execution_ids.push(id);
            }
        }

        debug!(execution_id = %id, flow_id = %flow.id, triggered_by = %options.triggered_by, "execution created");
        self.inner.bus.publish(EngineEvent::ExecutionCreated {
            execution_id: id,
            flow_id: flow.id.clone(),
            triggered_by: options.triggered_by,
        });

        self.inner.queue.enqueue(id);
        self.drain();
        Ok(id)
    }

    /// Dispatch queued executions while the concurrency gate allows.
    fn drain(&self) {
        for id in self.inner.queue.drain() {
            let engine = self.clone();
            self.inner
                .tracker
                .spawn(async move { engine.run_execution(id).await });
        }
    }

    async fn run_execution(&self, id: Uuid) {
        let handle = self.inner.executions.get(&id).map(|h| h.clone());
        let Some(handle) = handle else {
            self.release(id);
            return;
        };

        let started = {
            let mut record = lock_record(&handle.record);
            if record.status == ExecutionStatus::Pending {
                record.status = ExecutionStatus::Running;
                record.started_at = Some(Utc::now());
                Some((record.flow_id.clone(), record.flow_version.clone()))
            } else {
                None
            }
        };
        let Some((flow_id, version)) = started else {
            // Cancelled between admission and start.
            if handle.control.interrupted().is_some() && !handle.control.is_settled() {
                self.finalize(&handle, None, Err(Abort::Interrupted(ExecutionStatus::Cancelled)));
            }
            self.release(id);
            return;
        };

        let Some(flow) = self.resolve_flow(&flow_id, Some(&version)) else {
            let error = ExecutionError {
                message: format!("flow '{flow_id}' version '{version}' is no longer registered"),
                step_id: None,
                kind: ErrorKind::Engine,
            };
            self.finalize(&handle, None, Err(Abort::Failed(error)));
            self.release(id);
            return;
        };

        info!(execution_id = %id, flow_id = %flow_id, "execution started");
        self.inner.bus.publish(EngineEvent::ExecutionStarted {
            execution_id: id,
            flow_id: flow_id.clone(),
        });

        let timer = flow.config.timeout_ms.map(|ms| {
            let control = handle.control.clone();
            let record = handle.record.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if control.interrupt(ExecutionStatus::Timeout) {
                    let mut record = lock_record(&record);
                    if !record.status.is_terminal() {
                        record.status = ExecutionStatus::Timeout;
                    }
                }
            })
        });

        let ctx = ExecutionContext::new(
            handle.record.clone(),
            handle.control.clone(),
            flow.clone(),
            self.inner.bus.clone(),
            self.inner.config.max_trace_entries,
        );
        let launcher: Arc<dyn SubflowLauncher> = Arc::new(EngineLauncher {
            inner: Arc::downgrade(&self.inner),
        });
        let executor = StepExecutor::new(
            self.inner.invoker.clone(),
            launcher,
            self.inner.config.clone(),
            self.inner.force.clone(),
        );

        let run = executor
            .run(&ctx)
            .instrument(info_span!("execution", execution_id = %id, flow_id = %flow_id));
        let outcome = AssertUnwindSafe(run).catch_unwind().await.unwrap_or_else(|payload| {
            let message = format!("step panicked: {}", panic_message(&*payload));
            let step_id = fail_running_steps(&mut lock_record(&handle.record), &message);
            error!(execution_id = %id, flow_id = %flow_id, step_id = ?step_id, %message, "execution panicked");
            Err(Abort::Failed(ExecutionError {
                message,
                step_id,
                kind: ErrorKind::Engine,
            }))
        });
        if let Some(timer) = timer {
            timer.abort();
        }

        self.finalize(&handle, Some(&flow), outcome);
        self.release(id);
    }

    /// Record the terminal status of an execution and notify waiters.
    fn finalize(&self, handle: &ExecutionHandle, flow: Option<&FlowDefinition>, outcome: Result<(), Abort>) {
        let (status, error) = match (handle.control.interrupted(), outcome) {
            (Some(status), _) | (None, Err(Abort::Interrupted(status))) => {
                let timeout_ms = flow.and_then(|f| f.config.timeout_ms);
                (status, Some(interrupt_error(status, timeout_ms)))
            }
            (None, Ok(())) => (ExecutionStatus::Completed, None),
            (None, Err(Abort::Failed(error))) => (ExecutionStatus::Failed, Some(error)),
        };

        let (id, flow_id, duration_ms) = {
            let mut record = lock_record(&handle.record);
            if let (ExecutionStatus::Completed, Some(flow)) = (status, flow) {
                for param in &flow.outputs {
                    let value = record
                        .variables
                        .get(&param.name)
                        .cloned()
                        .or_else(|| param.default.clone());
                    if let Some(value) = value {
                        record.outputs.insert(param.name.clone(), value);
                    }
                }
            }
            record.finish(status, error);
            (record.id, record.flow_id.clone(), record.metrics.duration_ms)
        };

        match status {
            ExecutionStatus::Completed => {
                info!(execution_id = %id, flow_id = %flow_id, duration_ms, "execution completed");
            }
            _ => warn!(execution_id = %id, flow_id = %flow_id, status = %status, "execution did not complete"),
        }
        self.inner.bus.publish(EngineEvent::ExecutionCompleted {
            execution_id: id,
            flow_id,
            status,
            duration_ms,
        });
        handle.control.settle();
    }

    /// Free the slot held by `id`, prune history, and admit more work.
    fn release(&self, id: Uuid) {
        self.inner.queue.complete(id);
        self.prune_history();
        self.drain();
    }

    /// Cancel an execution.
    ///
    /// Pending executions leave the queue and finish immediately. Running ones
    /// are marked `cancelled` and stop at their next step boundary. Returns
    /// `false` for executions that already terminated.
    pub fn cancel_execution(&self, id: Uuid) -> Result<bool, EngineError> {
        let handle = self
            .inner
            .executions
            .get(&id)
            .map(|h| h.clone())
            .ok_or(EngineError::ExecutionNotFound(id))?;
        let (status, flow_id) = {
            let record = lock_record(&handle.record);
            (record.status, record.flow_id.clone())
        };

        match status {
            ExecutionStatus::Pending if self.inner.queue.remove_pending(id) => {
                self.cancel_pending(&handle, flow_id);
                self.prune_history();
                Ok(true)
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                if !handle.control.interrupt(ExecutionStatus::Cancelled) {
                    return Ok(false);
                }
                {
                    let mut record = lock_record(&handle.record);
                    if !record.status.is_terminal() {
                        record.status = ExecutionStatus::Cancelled;
                    }
                }
                info!(execution_id = %id, flow_id = %flow_id, "execution cancellation requested");
                self.inner.bus.publish(EngineEvent::ExecutionCancelled {
                    execution_id: id,
                    flow_id,
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Finish an execution that was removed from the queue before running.
    fn cancel_pending(&self, handle: &ExecutionHandle, flow_id: String) {
        handle.control.interrupt(ExecutionStatus::Cancelled);
        let id = lock_record(&handle.record).id;
        info!(execution_id = %id, flow_id = %flow_id, "pending execution cancelled");
        self.inner.bus.publish(EngineEvent::ExecutionCancelled {
            execution_id: id,
            flow_id,
        });
        self.finalize(handle, None, Err(Abort::Interrupted(ExecutionStatus::Cancelled)));
    }

    /// Drop expired terminal executions, then the oldest terminal ones beyond
    /// the history cap.
    fn prune_history(&self) {
        let now = Utc::now();
        let retention = i64::try_from(self.inner.config.execution_retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(36_500));

        let mut terminal: Vec<(Uuid, DateTime<Utc>)> = self
            .inner
            .executions
            .iter()
            .filter_map(|entry| {
                let record = lock_record(&entry.record);
                record
                    .status
                    .is_terminal()
                    .then(|| (record.id, record.completed_at.unwrap_or(record.created_at)))
            })
            .collect();

        let mut removed = 0usize;
        terminal.retain(|(id, finished)| {
            let expired = now.signed_duration_since(*finished) > retention;
            if expired {
                self.inner.executions.remove(id);
                removed += 1;
            }
            !expired
        });

        let cap = self.inner.config.max_execution_history;
        if terminal.len() > cap {
            terminal.sort_by_key(|(_, finished)| *finished);
            let excess = terminal.len() - cap;
            for (id, _) in terminal.iter().take(excess) {
                self.inner.executions.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "pruned execution history");
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_execution(&self, id: Uuid) -> Option<FlowExecution> {
        let handle = self.inner.executions.get(&id).map(|h| h.clone())?;
        Some(handle.snapshot())
    }

    /// Executions matching `filter`, newest first.
    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<FlowExecution> {
        let handles: Vec<ExecutionHandle> = self.inner.executions.iter().map(|e| e.clone()).collect();
        let mut matched: Vec<FlowExecution> = handles
            .iter()
            .map(ExecutionHandle::snapshot)
            .filter(|exec| filter.matches(exec))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn stats(&self) -> EngineStats {
        let now = Utc::now();
        let window = chrono::Duration::seconds(60);
        let mut stats = EngineStats {
            total_flows: self.inner.flows.len(),
            active_executions: self.inner.queue.running_count(),
            queued_executions: self.inner.queue.pending_count(),
            ..EngineStats::default()
        };

        let mut total_duration = 0u64;
        let mut timed = 0u64;
        for entry in self.inner.executions.iter() {
            let record = lock_record(&entry.record);
            stats.total_executions += 1;
            match record.status {
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
                ExecutionStatus::Timeout => stats.timed_out += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running => {}
            }
            if !record.status.is_terminal() {
                continue;
            }
            if let Some(ms) = record.metrics.duration_ms {
                total_duration += ms;
                timed += 1;
            }
            if record.completed_at.is_some_and(|at| now.signed_duration_since(at) <= window) {
                stats.throughput_per_minute += 1;
            }
        }
        if timed > 0 {
            stats.average_duration_ms = total_duration as f64 / timed as f64;
        }
        stats
    }

    /// Wait until `id` reaches its final state and return that snapshot.
    pub async fn wait_for_execution(&self, id: Uuid, timeout: Duration) -> Result<FlowExecution, EngineError> {
        let handle = self
            .inner
            .executions
            .get(&id)
            .map(|h| h.clone())
            .ok_or(EngineError::ExecutionNotFound(id))?;
        let mut settled = handle.control.subscribe_settled();
        let waited = tokio::time::timeout(timeout, async move {
            // The sender lives in `handle`, so this only fails if it was dropped.
            let _ = settled.wait_for(|done| *done).await;
        })
        .await;
        match waited {
            Ok(()) => Ok(handle.snapshot()),
            Err(_) => Err(EngineError::WaitTimeout(id)),
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Start every scheduled flow that is due at `now`.
    pub fn run_due_schedules(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due = self.inner.triggers.take_due(now);
        self.start_triggered(due, HashMap::new(), "scheduler")
    }

    /// Start every enabled flow scheduled on `event`, with `payload` as inputs.
    ///
    /// An object payload becomes the input map; anything else is bound to
    /// the `payload` input.
    pub fn emit_event(&self, event: &str, payload: Value) -> Vec<Uuid> {
        let inputs: HashMap<String, Value> = match payload {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => HashMap::new(),
            other => HashMap::from([("payload".to_string(), other)]),
        };
        let flows = self.inner.triggers.event_flows(event, Utc::now());
        debug!(event, matched = flows.len(), "event emitted");
        self.start_triggered(flows, inputs, "event")
    }

    fn start_triggered(&self, flow_ids: Vec<String>, inputs: HashMap<String, Value>, source: &str) -> Vec<Uuid> {
        flow_ids
            .into_iter()
            .filter_map(|flow_id| {
                match self.execute_flow(&flow_id, inputs.clone(), ExecuteOptions::triggered_by(source)) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(flow_id = %flow_id, source, error = %e, "triggered execution not started");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn set_schedule_enabled(&self, flow_id: &str, enabled: bool) -> bool {
        self.inner.triggers.set_enabled(flow_id, enabled)
    }

    pub fn list_schedules(&self) -> Vec<ScheduledFlow> {
        self.inner.triggers.list()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load persisted state and start the scheduler tick loop.
    ///
    /// Loaded flows are trusted and not re-validated. Executions left
    /// unfinished by a previous process are marked failed.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let flows = self.inner.store.load_all_flows().await?;
        let flow_count = flows.len();
        for flow in flows {
            self.insert_loaded_flow(flow);
        }

        let executions = self.inner.store.load_all_executions().await?;
        let mut interrupted = 0usize;
        for mut exec in executions {
            if !exec.status.is_terminal() {
                exec.finish(
                    ExecutionStatus::Failed,
                    Some(ExecutionError {
                        message: "interrupted by engine restart".to_string(),
                        step_id: None,
                        kind: ErrorKind::Engine,
                    }),
                );
                interrupted += 1;
            }
            let handle = ExecutionHandle::new(exec);
            handle.control.settle();
            let id = lock_record(&handle.record).id;
            self.inner.executions.insert(id, handle);
        }
        self.prune_history();

        info!(flows = flow_count, interrupted, "engine initialized");
        self.spawn_tick_loop();
        Ok(())
    }

    fn insert_loaded_flow(&self, flow: FlowDefinition) {
        let flow_id = flow.id.clone();
        let version = flow.version.clone();
        if let Some(schedule) = &flow.schedule {
            self.inner.triggers.upsert(&flow_id, schedule, Utc::now());
        }
        let mut entry = self.inner.flows.entry(flow_id).or_insert_with(|| FlowVersions {
            current: version.clone(),
            versions: HashMap::new(),
        });
        entry.versions.insert(version.clone(), Arc::new(flow));
        entry.current = version;
    }

    fn spawn_tick_loop(&self) {
        let engine = self.clone();
        let stopping = self.inner.stopping.clone();
        let period = self.inner.config.scheduler_tick();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => break,
                    _ = ticker.tick() => {
                        let started = engine.run_due_schedules(Utc::now());
                        if !started.is_empty() {
                            debug!(count = started.len(), "scheduled executions started");
                        }
                    }
                }
            }
            debug!("scheduler tick loop stopped");
        });
    }

    /// Stop the engine: drain running executions for up to the grace
    /// period, force-cancel what is left, then persist all state.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            running = self.inner.queue.running_count(),
            queued = self.inner.queue.pending_count(),
            "engine shutting down"
        );
        self.inner.stopping.cancel();

        for id in self.inner.queue.take_pending() {
            let handle = self.inner.executions.get(&id).map(|h| h.clone());
            if let Some(handle) = handle {
                let flow_id = lock_record(&handle.record).flow_id.clone();
                self.cancel_pending(&handle, flow_id);
            }
        }

        self.inner.tracker.close();
        let grace = self.inner.config.shutdown_grace();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!(
                running = self.inner.queue.running_count(),
                "shutdown grace period elapsed, forcing cancellation"
            );
            self.force_cancel_running();
            self.inner.force.cancel();
            if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
                warn!("executions still running after forced cancellation");
            }
        }

        self.persist().await?;
        info!("engine stopped");
        Ok(())
    }

    fn force_cancel_running(&self) {
        let handles: Vec<ExecutionHandle> = self.inner.executions.iter().map(|e| e.clone()).collect();
        for handle in handles {
            let (id, flow_id) = {
                let mut record = lock_record(&handle.record);
                if record.status != ExecutionStatus::Running
                    || !handle.control.interrupt(ExecutionStatus::Cancelled)
                {
                    continue;
                }
                record.status = ExecutionStatus::Cancelled;
                (record.id, record.flow_id.clone())
            };
            self.inner.bus.publish(EngineEvent::ExecutionCancelled {
                execution_id: id,
                flow_id,
            });
        }
    }

    /// Write every flow version and execution to the store.
    pub async fn persist(&self) -> Result<(), EngineError> {
        let mut flows = Vec::new();
        for entry in self.inner.flows.iter() {
            // Current version last, so reloading restores it as current.
            let mut versions: Vec<&Arc<FlowDefinition>> = entry
                .versions
                .iter()
                .filter(|(version, _)| **version != entry.current)
                .map(|(_, flow)| flow)
                .collect();
            versions.extend(entry.versions.get(&entry.current));
            flows.extend(versions.into_iter().map(|f| (**f).clone()));
        }

        let handles: Vec<ExecutionHandle> = self.inner.executions.iter().map(|e| e.clone()).collect();
        let mut executions: Vec<FlowExecution> = handles.iter().map(ExecutionHandle::snapshot).collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        self.inner.store.save_all_flows(&flows).await?;
        self.inner.store.save_all_executions(&executions).await?;
        info!(flows = flows.len(), executions = executions.len(), "engine state persisted");
        Ok(())
    }
}

fn interrupt_error(status: ExecutionStatus, timeout_ms: Option<u64>) -> ExecutionError {
    match status {
        ExecutionStatus::Timeout => ExecutionError {
            message: match timeout_ms {
                Some(ms) => format!("execution exceeded its timeout of {ms}ms"),
                None => "execution timed out".to_string(),
            },
            step_id: None,
            kind: ErrorKind::Timeout,
        },
        _ => ExecutionError {
            message: "execution cancelled".to_string(),
            step_id: None,
            kind: ErrorKind::Cancelled,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Fail every step a panic left running. Returns the innermost one, which is
/// the step that started last.
fn fail_running_steps(record: &mut FlowExecution, message: &str) -> Option<String> {
    let now = Utc::now();
    let mut innermost: Option<(DateTime<Utc>, String)> = None;
    for (step_id, state) in record.step_states.iter_mut() {
        if !matches!(state.status, StepStatus::Running | StepStatus::Retrying) {
            continue;
        }
        state.status = StepStatus::Failed;
        state.completed_at = Some(now);
        state.error = Some(message.to_string());
        let started = state.started_at.unwrap_or(now);
        if innermost.as_ref().is_none_or(|(at, _)| started >= *at) {
            innermost = Some((started, step_id.clone()));
        }
    }
    if innermost.is_some() {
        record.metrics.steps_failed += 1;
    }
    innermost.map(|(_, id)| id)
}

// ---------------------------------------------------------------------------
// Subflow launcher
// ---------------------------------------------------------------------------

/// Lets subprocess steps start child executions on the owning engine.
struct EngineLauncher<S: FlowStore> {
    inner: Weak<EngineInner<S>>,
}

impl<S: FlowStore> EngineLauncher<S> {
    fn engine(&self) -> Option<FlowEngine<S>> {
        self.inner.upgrade().map(|inner| FlowEngine { inner })
    }
}

impl<S: FlowStore> SubflowLauncher for EngineLauncher<S> {
    fn launch(&self, flow_id: &str, inputs: HashMap<String, Value>, parent: Uuid) -> Result<Uuid, String> {
        let engine = self.engine().ok_or_else(|| EngineError::ShuttingDown.to_string())?;
        let options = ExecuteOptions {
            parent_execution_id: Some(parent),
            ..ExecuteOptions::triggered_by("subprocess")
        };
        engine
            .execute_flow(flow_id, inputs, options)
            .map_err(|e| e.to_string())
    }

    fn snapshot(&self, execution_id: Uuid) -> Option<FlowExecution> {
        self.engine()?.get_execution(execution_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryFlowStore;
    use crate::workflow::definition::parse_flow_yaml;
    use crate::workflow::invoker::InvokeError;
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// `work` sleeps for `ms` (default 20) while tracking how many calls
    /// overlap; `record` appends its `tag` input to the call log; `boom`
    /// panics.
    #[derive(Default)]
    struct TestAgent {
        active: AtomicUsize,
        peak: AtomicUsize,
        log: Mutex<Vec<Value>>,
    }

    impl AgentInvoker for TestAgent {
        fn invoke<'a>(
            &'a self,
            _agent_id: &'a str,
            action: &'a str,
            inputs: HashMap<String, Value>,
        ) -> BoxFuture<'a, Result<Value, InvokeError>> {
            Box::pin(async move {
                match action {
                    "work" => {
                        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                        self.peak.fetch_max(now, Ordering::SeqCst);
                        let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(20);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!({ "ok": true }))
                    }
                    "record" => {
                        let tag = inputs.get("tag").cloned().unwrap_or(Value::Null);
                        self.log.lock().unwrap().push(tag);
                        Ok(json!({ "recorded": true }))
                    }
                    "boom" => panic!("agent blew up"),
                    other => Err(InvokeError::UnknownAction {
                        agent_id: "test".into(),
                        action: other.into(),
                    }),
                }
            })
        }
    }

    fn engine_with(config: EngineConfig) -> (FlowEngine<Arc<InMemoryFlowStore>>, Arc<TestAgent>, Arc<InMemoryFlowStore>) {
        let agent = Arc::new(TestAgent::default());
        let store = Arc::new(InMemoryFlowStore::new());
        let engine = FlowEngine::new(config, store.clone(), agent.clone());
        (engine, agent, store)
    }

    fn engine(max_concurrent: usize) -> (FlowEngine<Arc<InMemoryFlowStore>>, Arc<TestAgent>) {
        let (engine, agent, _) = engine_with(EngineConfig {
            max_concurrent_executions: max_concurrent,
            ..EngineConfig::default()
        });
        (engine, agent)
    }

    fn flow(yaml: &str) -> FlowDefinition {
        parse_flow_yaml(yaml).unwrap()
    }

    const WORK_FLOW: &str = r#"
id: work
name: Work
version: "1"
steps:
  - id: log
    type: action
    agent_id: test
    action: record
    inputs:
      tag: "${tag}"
  - id: busy
    type: action
    agent_id: test
    action: work
    inputs:
      ms: "${ms}"
"#;

    fn inputs(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound_never_exceeded() {
        let (engine, agent) = engine(2);
        engine.register_flow(flow(WORK_FLOW)).unwrap();

        let ids: Vec<Uuid> = (0..6)
            .map(|i| {
                engine
                    .execute_flow("work", inputs(json!({ "tag": i, "ms": 30 })), ExecuteOptions::default())
                    .unwrap()
            })
            .collect();
        assert!(engine.stats().active_executions <= 2);

        for id in &ids {
            let exec = engine.wait_for_execution(*id, WAIT).await.unwrap();
            assert_eq!(exec.status, ExecutionStatus::Completed);
        }
        assert_eq!(agent.peak.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().active_executions, 0);
    }

    #[tokio::test]
    async fn test_fifo_dispatch_order() {
        let (engine, agent) = engine(1);
        engine.register_flow(flow(WORK_FLOW)).unwrap();

        let ids: Vec<Uuid> = (0..4)
            .map(|i| {
                engine
                    .execute_flow("work", inputs(json!({ "tag": i, "ms": 5 })), ExecuteOptions::default())
                    .unwrap()
            })
            .collect();
        assert_eq!(engine.stats().queued_executions, 3);

        for id in &ids {
            engine.wait_for_execution(*id, WAIT).await.unwrap();
        }
        assert_eq!(*agent.log.lock().unwrap(), vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_cancel_pending_never_runs() {
        let (engine, _) = engine(1);
        engine.register_flow(flow(WORK_FLOW)).unwrap();
        let mut events = engine.subscribe();

        let first = engine
            .execute_flow("work", inputs(json!({ "tag": "a", "ms": 50 })), ExecuteOptions::default())
            .unwrap();
        let second = engine
            .execute_flow("work", inputs(json!({ "tag": "b" })), ExecuteOptions::default())
            .unwrap();

        assert!(engine.cancel_execution(second).unwrap());
        let cancelled = engine.get_execution(second).unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));

        engine.wait_for_execution(first, WAIT).await.unwrap();
        let after = engine.get_execution(second).unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert!(after.started_at.is_none());
        assert!(!engine.cancel_execution(second).unwrap(), "terminal executions cannot be cancelled");

        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ExecutionStarted { execution_id, .. } = event {
                assert_ne!(execution_id, second);
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_running_stops_at_step_boundary() {
        let (engine, agent) = engine(1);
        engine
            .register_flow(flow(
                r#"
id: slow
name: Slow
version: "1"
steps:
  - id: busy
    type: action
    agent_id: test
    action: work
    inputs:
      ms: 40
  - id: log
    type: action
    agent_id: test
    action: record
    inputs:
      tag: after
"#,
            ))
            .unwrap();
        let id = engine.execute_flow("slow", HashMap::new(), ExecuteOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.cancel_execution(id).unwrap());

        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.step_states["busy"].status, flowrun_types::execution::StepStatus::Completed);
        assert!(!exec.step_states.contains_key("log"));
        assert!(agent.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_condition_scenario_metrics() {
        let (engine, _) = engine(4);
        engine
            .register_flow(flow(
                r#"
id: branchy
name: Branchy
version: "1"
steps:
  - id: check
    type: condition
    expression: "5 > 3"
    on_true:
      - id: wait_true
        type: wait
        wait_type: duration
        duration_ms: 10
    on_false:
      - id: wait_false
        type: wait
        wait_type: duration
        duration_ms: 10
"#,
            ))
            .unwrap();
        let id = engine.execute_flow("branchy", HashMap::new(), ExecuteOptions::default()).unwrap();
        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.metrics.steps_executed, 2);
        assert_eq!(exec.metrics.steps_skipped, 0);
        assert!(exec.step_states.contains_key("wait_true"));
        assert!(!exec.step_states.contains_key("wait_false"));
    }

    #[tokio::test]
    async fn test_for_loop_scenario_and_outputs() {
        let (engine, _) = engine(4);
        engine
            .register_flow(flow(
                r#"
id: looper
name: Looper
version: "1"
inputs:
  - name: items
    type: array
outputs:
  - name: output
  - name: note
    default: "none"
steps:
  - id: each
    type: loop
    loop_type: for
    iterable: "${items}"
    steps:
      - id: set
        type: transform
        input: "${loop_item}"
        output: output
"#,
            ))
            .unwrap();
        let id = engine
            .execute_flow("looper", inputs(json!({ "items": [1, 2, 3] })), ExecuteOptions::default())
            .unwrap();
        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_states["each"].outputs.as_ref().unwrap()["iterations"], 3);
        assert_eq!(exec.outputs["output"], json!(3));
        assert_eq!(exec.outputs["note"], json!("none"));
        assert_eq!(exec.variables["_flow_id"], json!("looper"));
        assert_eq!(exec.variables["_triggered_by"], json!("manual"));
    }

    #[tokio::test]
    async fn test_registration_rejects_dangling_reference() {
        let (engine, _) = engine(1);
        let err = engine
            .register_flow(flow(
                r#"
id: broken
name: Broken
version: "1"
steps:
  - id: check
    type: condition
    expression: "true"
    on_true: missing
"#,
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.list_flows().is_empty());
        assert!(matches!(
            engine.execute_flow("broken", HashMap::new(), ExecuteOptions::default()),
            Err(EngineError::FlowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_versions_are_immutable_and_addressable() {
        let (engine, _) = engine(2);
        let v1 = flow(WORK_FLOW);
        let mut v2 = v1.clone();
        v2.version = "2".into();

        engine.register_flow(v1.clone()).unwrap();
        engine.register_flow(v2).unwrap();
        assert!(matches!(
            engine.register_flow(v1),
            Err(EngineError::FlowVersionExists { .. })
        ));
        assert_eq!(engine.get_flow("work").unwrap().version, "2");
        assert_eq!(engine.list_flows().len(), 1);

        let options = ExecuteOptions {
            version: Some("1".into()),
            ..ExecuteOptions::default()
        };
        let id = engine.execute_flow("work", inputs(json!({ "ms": 1 })), options).unwrap();
        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();
        assert_eq!(exec.flow_version, "1");

        assert!(engine.unregister_flow("work"));
        assert!(engine.get_flow_version("work", "1").is_none());
        assert!(!engine.unregister_flow("work"));
    }

    #[tokio::test]
    async fn test_execution_timeout_observed_between_steps() {
        let (engine, agent) = engine(1);
        engine
            .register_flow(flow(
                r#"
id: timed
name: Timed
version: "1"
config:
  timeout_ms: 20
steps:
  - id: busy
    type: action
    agent_id: test
    action: work
    inputs:
      ms: 60
  - id: log
    type: action
    agent_id: test
    action: record
    inputs:
      tag: late
"#,
            ))
            .unwrap();
        let id = engine.execute_flow("timed", HashMap::new(), ExecuteOptions::default()).unwrap();
        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert_eq!(exec.error.unwrap().kind, ErrorKind::Timeout);
        assert!(agent.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_recorded_with_step_id() {
        let (engine, _) = engine(1);
        engine
            .register_flow(flow(
                r#"
id: failing
name: Failing
version: "1"
steps:
  - id: bad
    type: action
    agent_id: test
    action: unsupported
"#,
            ))
            .unwrap();
        let id = engine.execute_flow("failing", HashMap::new(), ExecuteOptions::default()).unwrap();
        let exec = engine.wait_for_execution(id, WAIT).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let error = exec.error.unwrap();
        assert_eq!(error.step_id.as_deref(), Some("bad"));
        assert_eq!(error.kind, ErrorKind::Action);
        assert_eq!(exec.metrics.steps_failed, 1);
    }

    #[tokio::test]
    async fn test_subprocess_links_parent_and_child() {
        let (engine, _) = engine(2);
        engine
            .register_flow(flow(
                r#"
id: child
name: Child
version: "1"
outputs:
  - name: doubled
steps:
  - id: double
    type: transform
    input: "${value}${value}"
    output: doubled
"#,
            ))
            .unwrap();
        engine
            .register_flow(flow(
                r#"
id: parent
name: Parent
version: "1"
steps:
  - id: call_child
    type: subprocess
    flow_id: child
    poll_interval_ms: 5
    inputs:
      value: "ab"
    outputs:
      outputs.doubled: result
"#,
            ))
            .unwrap();

        let id = engine.execute_flow("parent", HashMap::new(), ExecuteOptions::default()).unwrap();
        let parent = engine.wait_for_execution(id, WAIT).await.unwrap();
        assert_eq!(parent.status, ExecutionStatus::Completed);
        assert_eq!(parent.variables["result"], json!("abab"));
        assert_eq!(parent.child_execution_ids.len(), 1);

        let child = engine.get_execution(parent.child_execution_ids[0]).unwrap();
        assert_eq!(child.parent_execution_id, Some(id));
        assert_eq!(child.triggered_by, "subprocess");
    }

    const SLOW_CHILD: &str = r#"
id: slow_child
name: Slow child
version: "1"
steps:
  - id: busy
    type: action
    agent_id: test
    action: work
    inputs:
      ms: "${ms}"
"#;

    #[tokio::test]
    async fn test_subprocess_without_wait_reports_pending_child() {
        let (engine, _) = engine(2);
        engine.register_flow(flow(SLOW_CHILD)).unwrap();
        engine
            .register_flow(flow(
                r#"
id: fire_and_forget
name: Fire and forget
version: "1"
steps:
  - id: spawn
    type: subprocess
    flow_id: slow_child
    wait: false
    inputs:
      ms: 50
    outputs:
      execution_id: child_id
      status: child_status
"#,
            ))
            .unwrap();

        let id = engine
            .execute_flow("fire_and_forget", HashMap::new(), ExecuteOptions::default())
            .unwrap();
        let parent = engine.wait_for_execution(id, WAIT).await.unwrap();
        assert_eq!(parent.status, ExecutionStatus::Completed);
        assert_eq!(parent.variables["child_status"], json!("pending"));

        let child_id = parent.child_execution_ids[0];
        assert_eq!(parent.variables["child_id"], json!(child_id.to_string()));
        let child = engine.wait_for_execution(child_id, WAIT).await.unwrap();
        assert_eq!(child.status, ExecutionStatus::Completed);
        assert!(child.completed_at.unwrap() >= parent.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_subprocess_timeout_fails_parent_step() {
        let (engine, _) = engine(2);
        engine.register_flow(flow(SLOW_CHILD)).unwrap();
        engine
            .register_flow(flow(
                r#"
id: impatient
name: Impatient
version: "1"
steps:
  - id: call_child
    type: subprocess
    flow_id: slow_child
    poll_interval_ms: 5
    timeout_ms: 50
    inputs:
      ms: 2000
"#,
            ))
            .unwrap();

        let started = std::time::Instant::now();
        let id = engine.execute_flow("impatient", HashMap::new(), ExecuteOptions::default()).unwrap();
        let parent = engine.wait_for_execution(id, WAIT).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500), "waited for the child");

        assert_eq!(parent.status, ExecutionStatus::Failed);
        let error = parent.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.step_id.as_deref(), Some("call_child"));
        assert!(error.message.contains("did not finish within 50ms"));

        let child = engine.get_execution(parent.child_execution_ids[0]).unwrap();
        assert!(!child.status.is_terminal());
    }

    #[tokio::test]
    async fn test_panicking_step_fails_execution_and_frees_slot() {
        let (engine, _) = engine(1);
        engine
            .register_flow(flow(
                r#"
id: explosive
name: Explosive
version: "1"
steps:
  - id: explode
    type: action
    agent_id: test
    action: boom
"#,
            ))
            .unwrap();
        engine.register_flow(flow(WORK_FLOW)).unwrap();

        let first = engine.execute_flow("explosive", HashMap::new(), ExecuteOptions::default()).unwrap();
        let second = engine
            .execute_flow("work", inputs(json!({ "tag": "after", "ms": 5 })), ExecuteOptions::default())
            .unwrap();

        let exec = engine.wait_for_execution(first, WAIT).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let error = exec.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Engine);
        assert_eq!(error.step_id.as_deref(), Some("explode"));
        assert!(error.message.contains("agent blew up"));
        assert_eq!(exec.step_states["explode"].status, StepStatus::Failed);

        let next = engine.wait_for_execution(second, WAIT).await.unwrap();
        assert_eq!(next.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_event_and_scheduled_triggers() {
        let (engine, _) = engine(4);
        engine
            .register_flow(flow(
                r#"
id: on_order
name: On order
version: "1"
schedule:
  type: event
  event: order.created
steps:
  - id: keep
    type: transform
    input: "${order}"
    output: seen
"#,
            ))
            .unwrap();
        engine
            .register_flow(flow(
                r#"
id: ticker
name: Ticker
version: "1"
schedule:
  type: interval
  interval_ms: 1000
steps:
  - id: noop
    type: wait
    wait_type: duration
    duration_ms: 1
"#,
            ))
            .unwrap();

        let fired = engine.emit_event("order.created", json!({ "order": 7 }));
        assert_eq!(fired.len(), 1);
        let exec = engine.wait_for_execution(fired[0], WAIT).await.unwrap();
        assert_eq!(exec.variables["seen"], json!(7));
        assert_eq!(exec.triggered_by, "event");

        assert!(engine.run_due_schedules(Utc::now()).is_empty());
        let due = engine.run_due_schedules(Utc::now() + chrono::Duration::seconds(2));
        assert_eq!(due.len(), 1);
        let exec = engine.wait_for_execution(due[0], WAIT).await.unwrap();
        assert_eq!(exec.flow_id, "ticker");
        assert_eq!(exec.triggered_by, "scheduler");

        // Event schedules also come due on the placeholder offset.
        assert!(engine.set_schedule_enabled("ticker", false));
        let late = engine.run_due_schedules(Utc::now() + chrono::Duration::hours(2));
        assert_eq!(late.len(), 1);
        assert_eq!(engine.get_execution(late[0]).unwrap().flow_id, "on_order");
        assert_eq!(engine.list_schedules().len(), 2);
    }

    #[tokio::test]
    async fn test_list_filter_and_stats() {
        let (engine, _) = engine(4);
        engine.register_flow(flow(WORK_FLOW)).unwrap();
        let a = engine.execute_flow("work", inputs(json!({ "ms": 1 })), ExecuteOptions::default()).unwrap();
        let b = engine
            .execute_flow("work", inputs(json!({ "ms": 1 })), ExecuteOptions::triggered_by("api"))
            .unwrap();
        engine.wait_for_execution(a, WAIT).await.unwrap();
        engine.wait_for_execution(b, WAIT).await.unwrap();

        let all = engine.list_executions(&ExecutionFilter::default());
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b, a]);

        let filter = ExecutionFilter {
            triggered_by: Some("api".into()),
            ..ExecutionFilter::default()
        };
        assert_eq!(engine.list_executions(&filter).len(), 1);
        let filter = ExecutionFilter {
            limit: Some(1),
            status: Some(ExecutionStatus::Completed),
            ..ExecutionFilter::default()
        };
        assert_eq!(engine.list_executions(&filter)[0].id, b);

        let stats = engine.stats();
        assert_eq!(stats.total_flows, 1);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.throughput_per_minute, 2);
        assert_eq!(stats.active_executions, 0);
    }

    #[tokio::test]
    async fn test_history_capped() {
        let (engine, _, _) = engine_with(EngineConfig {
            max_execution_history: 2,
            ..EngineConfig::default()
        });
        engine.register_flow(flow(WORK_FLOW)).unwrap();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = engine.execute_flow("work", inputs(json!({ "ms": 1 })), ExecuteOptions::default()).unwrap();
            engine.wait_for_execution(id, WAIT).await.unwrap();
            ids.push(id);
        }
        assert_eq!(engine.stats().total_executions, 2);
        assert!(engine.get_execution(ids[0]).is_none());
        assert!(engine.get_execution(ids[3]).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_forces_and_persists() {
        let (engine, _, store) = engine_with(EngineConfig {
            max_concurrent_executions: 1,
            shutdown_grace_ms: 30,
            ..EngineConfig::default()
        });
        engine
            .register_flow(flow(
                r#"
id: sleepy
name: Sleepy
version: "1"
steps:
  - id: nap
    type: wait
    wait_type: duration
    duration_ms: 10000
"#,
            ))
            .unwrap();
        let running = engine.execute_flow("sleepy", HashMap::new(), ExecuteOptions::default()).unwrap();
        let queued = engine.execute_flow("sleepy", HashMap::new(), ExecuteOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.shutdown().await.unwrap();

        assert_eq!(engine.get_execution(running).unwrap().status, ExecutionStatus::Cancelled);
        let queued = engine.get_execution(queued).unwrap();
        assert_eq!(queued.status, ExecutionStatus::Cancelled);
        assert!(queued.started_at.is_none());
        assert!(matches!(
            engine.execute_flow("sleepy", HashMap::new(), ExecuteOptions::default()),
            Err(EngineError::ShuttingDown)
        ));

        assert_eq!(store.load_all_flows().await.unwrap().len(), 1);
        assert_eq!(store.load_all_executions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_marks_unfinished_executions_failed() {
        let stored_flow = flow(WORK_FLOW);
        let mut unfinished = FlowExecution::new("work", "1", "manual");
        unfinished.status = ExecutionStatus::Running;
        unfinished.started_at = Some(Utc::now());
        let mut done = FlowExecution::new("work", "1", "manual");
        done.finish(ExecutionStatus::Completed, None);

        let store = InMemoryFlowStore::with_state(vec![stored_flow], vec![unfinished.clone(), done.clone()]);
        let engine = FlowEngine::new(EngineConfig::default(), store, Arc::new(TestAgent::default()));
        engine.initialize().await.unwrap();

        let restored = engine.get_execution(unfinished.id).unwrap();
        assert_eq!(restored.status, ExecutionStatus::Failed);
        let error = restored.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Engine);
        assert_eq!(error.message, "interrupted by engine restart");
        assert_eq!(engine.get_execution(done.id).unwrap().status, ExecutionStatus::Completed);
        assert_eq!(engine.get_flow("work").unwrap().version, "1");

        // Settled executions can be awaited immediately.
        engine.wait_for_execution(done.id, Duration::from_millis(10)).await.unwrap();
        engine.shutdown().await.unwrap();
    }
}
