//! Live execution state shared between the runner and the step executor.
//!
//! `ExecutionContext` wraps one execution's record (variables, step states,
//! metrics, trace) behind a cloneable handle so parallel branches can write
//! into the same execution. The record lock is synchronous and never held
//! across an `.await`.
//!
//! `ExecutionControl` carries the interrupt flag (cancel or timeout) that
//! the executor observes at step boundaries, plus a settled signal for
//! callers waiting on completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use flowrun_types::event::EngineEvent;
use flowrun_types::execution::{
    ExecutionError, ExecutionMetrics, ExecutionStatus, FlowExecution, StepExecutionState,
    TraceEntry, TraceLevel,
};
use flowrun_types::flow::FlowDefinition;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::event::EventBus;

/// Lock an execution record, recovering the data if a writer panicked.
pub fn lock_record(record: &Mutex<FlowExecution>) -> MutexGuard<'_, FlowExecution> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ExecutionControl
// ---------------------------------------------------------------------------

/// Interrupt and completion signalling for one execution.
#[derive(Debug)]
pub struct ExecutionControl {
    interrupt: OnceLock<ExecutionStatus>,
    settled: watch::Sender<bool>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            interrupt: OnceLock::new(),
            settled,
        }
    }

    /// Request an interrupt. The first request wins; returns whether this
    /// call set it.
    pub fn interrupt(&self, status: ExecutionStatus) -> bool {
        self.interrupt.set(status).is_ok()
    }

    pub fn interrupted(&self) -> Option<ExecutionStatus> {
        self.interrupt.get().copied()
    }

    /// Signal that the execution reached its final state.
    pub fn settle(&self) {
        self.settled.send_replace(true);
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    pub fn subscribe_settled(&self) -> watch::Receiver<bool> {
        self.settled.subscribe()
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Cloneable handle onto one running execution.
#[derive(Clone)]
pub struct ExecutionContext {
    execution_id: Uuid,
    record: Arc<Mutex<FlowExecution>>,
    control: Arc<ExecutionControl>,
    flow: Arc<FlowDefinition>,
    bus: EventBus,
    max_trace_entries: usize,
    goto_jumps: Arc<AtomicU32>,
}

impl ExecutionContext {
    pub fn new(
        record: Arc<Mutex<FlowExecution>>,
        control: Arc<ExecutionControl>,
        flow: Arc<FlowDefinition>,
        bus: EventBus,
        max_trace_entries: usize,
    ) -> Self {
        let execution_id = lock_record(&record).id;
        Self {
            execution_id,
            record,
            control,
            flow,
            bus,
            max_trace_entries,
            goto_jumps: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn flow(&self) -> &Arc<FlowDefinition> {
        &self.flow
    }

    /// Cancel or timeout requested for this execution, if any.
    pub fn interrupted(&self) -> Option<ExecutionStatus> {
        self.control.interrupted()
    }

    /// Run `f` with exclusive access to the execution record.
    pub fn with_record<R>(&self, f: impl FnOnce(&mut FlowExecution) -> R) -> R {
        f(&mut lock_record(&self.record))
    }

    /// Run `f` against the variable table.
    pub fn with_vars<R>(&self, f: impl FnOnce(&HashMap<String, Value>) -> R) -> R {
        f(&lock_record(&self.record).variables)
    }

    pub fn set_var(&self, name: impl Into<String>, value: Value) {
        self.with_record(|r| {
            r.variables.insert(name.into(), value);
        });
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.with_vars(|vars| vars.get(name).cloned())
    }

    /// Update (creating if needed) the state entry for `step_id`.
    pub fn update_step<R>(&self, step_id: &str, f: impl FnOnce(&mut StepExecutionState) -> R) -> R {
        self.with_record(|r| {
            let state = r
                .step_states
                .entry(step_id.to_string())
                .or_insert_with(|| StepExecutionState::new(step_id));
            f(state)
        })
    }

    pub fn metrics(&self, f: impl FnOnce(&mut ExecutionMetrics)) {
        self.with_record(|r| f(&mut r.metrics));
    }

    /// Preserve an absorbed error on the execution (`on_error: collect`).
    pub fn collect_error(&self, error: ExecutionError) {
        self.with_record(|r| r.collected_errors.push(error));
    }

    /// Count a goto jump, returning the total so far.
    pub fn record_goto(&self) -> u32 {
        self.goto_jumps.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append a trace entry and publish it on the event bus.
    ///
    /// Debug/info entries are dropped when the flow disables tracing; the log
    /// keeps at most `max_trace_entries`, oldest dropped first.
    pub fn trace(&self, level: TraceLevel, step_id: Option<&str>, event: &str, message: impl Into<String>) {
        if level < TraceLevel::Warn && !self.flow.config.tracing {
            return;
        }
        let entry = TraceEntry {
            timestamp: Utc::now(),
            level,
            step_id: step_id.map(str::to_string),
            event: event.to_string(),
            message: message.into(),
        };
        self.with_record(|r| {
            r.trace.push(entry.clone());
            if r.trace.len() > self.max_trace_entries {
                let excess = r.trace.len() - self.max_trace_entries;
                r.trace.drain(..excess);
            }
        });
        self.bus.publish(EngineEvent::StepTrace {
            execution_id: self.execution_id,
            entry,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(tracing: bool, cap: usize) -> ExecutionContext {
        let mut flow: FlowDefinition = serde_json::from_value(json!({
            "id": "f", "name": "F", "version": "1", "steps": []
        }))
        .unwrap();
        flow.config.tracing = tracing;
        let record = Arc::new(Mutex::new(FlowExecution::new("f", "1", "manual")));
        ExecutionContext::new(
            record,
            Arc::new(ExecutionControl::new()),
            Arc::new(flow),
            EventBus::new(16),
            cap,
        )
    }

    #[test]
    fn test_trace_cap_drops_oldest() {
        let ctx = context(true, 3);
        for i in 0..5 {
            ctx.trace(TraceLevel::Info, Some("s"), "tick", format!("entry {i}"));
        }
        let messages: Vec<String> = ctx.with_record(|r| r.trace.iter().map(|t| t.message.clone()).collect());
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn test_tracing_disabled_keeps_warnings_only() {
        let ctx = context(false, 10);
        ctx.trace(TraceLevel::Info, None, "started", "ignored");
        ctx.trace(TraceLevel::Error, Some("s"), "step_failed", "kept");
        let levels: Vec<TraceLevel> = ctx.with_record(|r| r.trace.iter().map(|t| t.level).collect());
        assert_eq!(levels, vec![TraceLevel::Error]);
    }

    #[tokio::test]
    async fn test_trace_published_on_bus() {
        let ctx = context(true, 10);
        let mut rx = ctx.bus.subscribe();
        ctx.trace(TraceLevel::Debug, Some("a"), "step_started", "go");
        match rx.recv().await.unwrap() {
            EngineEvent::StepTrace { entry, .. } => assert_eq!(entry.event, "step_started"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_first_wins() {
        let control = ExecutionControl::new();
        assert!(control.interrupt(ExecutionStatus::Timeout));
        assert!(!control.interrupt(ExecutionStatus::Cancelled));
        assert_eq!(control.interrupted(), Some(ExecutionStatus::Timeout));
        assert!(!control.is_settled());
        control.settle();
        assert!(control.is_settled());
    }

    #[test]
    fn test_step_state_and_variables() {
        let ctx = context(true, 10);
        ctx.set_var("x", json!(1));
        assert_eq!(ctx.get_var("x"), Some(json!(1)));
        ctx.update_step("s1", |s| s.attempts += 1);
        ctx.update_step("s1", |s| s.attempts += 1);
        assert_eq!(ctx.with_record(|r| r.step_states["s1"].attempts), 2);
        assert_eq!(ctx.record_goto(), 1);
        assert_eq!(ctx.record_goto(), 2);
    }
}
