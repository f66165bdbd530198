//! Step executor: recursive interpretation of a flow's step tree.
//!
//! # Execution flow
//!
//! 1. `run` walks the top-level step list in order.
//! 2. Before each step the execution's interrupt flag is checked; a cancel or
//!    timeout stops the list there (never inside a running step).
//! 3. Each step goes through `execute_step`: disabled steps are skipped,
//!    otherwise the step's kind handler runs, retrying per the effective
//!    retry policy with exponential back-off.
//! 4. Once retries are exhausted, the on-error action decides: `continue` and
//!    `collect` absorb the failure, `goto` jumps, `stop` aborts the execution.
//!
//! Nested lists (condition branches, loop bodies, parallel branches) re-enter
//! `execute_steps`, which is the boxed recursion point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowrun_types::config::EngineConfig;
use flowrun_types::execution::{
    ErrorKind, ExecutionError, ExecutionStatus, RetryRecord, StepStatus, TraceLevel,
};
use flowrun_types::flow::{BranchTarget, FlowStep, LoopType, OnErrorAction, StepKind, WaitType};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::error::{Abort, StepError};
use super::expression;
use super::invoker::{AgentInvoker, SubflowLauncher};
use super::resolver;
use super::retry::{EffectivePolicy, RetryHandler};
use super::transform;

// ---------------------------------------------------------------------------
// Internal control-flow types
// ---------------------------------------------------------------------------

/// Where execution continues after a step or a step list.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Continue,
    Goto(String),
}

/// Successful result of one kind handler.
enum StepOutput {
    Value(Value),
    /// A nested list requested a jump it could not resolve itself.
    Goto(String),
}

/// Failure of one kind handler.
enum StepFault {
    /// The attempt failed; subject to retry and on-error policy.
    Error(StepError),
    /// A nested step aborted the execution; bypasses this step's policy.
    Abort(Abort),
}

impl From<StepError> for StepFault {
    fn from(err: StepError) -> Self {
        StepFault::Error(err)
    }
}

impl From<Abort> for StepFault {
    fn from(abort: Abort) -> Self {
        StepFault::Abort(abort)
    }
}

/// A step list together with its enclosing lists, for goto resolution.
struct Scope<'a> {
    steps: &'a [FlowStep],
    parent: Option<&'a Scope<'a>>,
    /// Step lists entered above this one, standalone goto targets included.
    depth: usize,
}

impl<'a> Scope<'a> {
    fn root(steps: &'a [FlowStep], depth: usize) -> Self {
        Self { steps, parent: None, depth }
    }

    fn nested(&'a self, steps: &'a [FlowStep]) -> Self {
        Self {
            steps,
            parent: Some(self),
            depth: self.depth + 1,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    fn contains(&self, id: &str) -> bool {
        self.position(id).is_some() || self.parent.is_some_and(|p| p.contains(id))
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Interprets step trees against an `ExecutionContext`.
///
/// Cheap to clone: parallel branches each get their own clone.
#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<dyn AgentInvoker>,
    launcher: Arc<dyn SubflowLauncher>,
    config: Arc<EngineConfig>,
    /// Forced-shutdown token; interrupts sleeps and polls.
    shutdown: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        launcher: Arc<dyn SubflowLauncher>,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            launcher,
            config,
            shutdown,
        }
    }

    /// Execute the flow's top-level steps to completion.
    pub async fn run(&self, ctx: &ExecutionContext) -> Result<(), Abort> {
        let flow = ctx.flow().clone();
        let scope = Scope::root(&flow.steps, 0);
        self.execute_steps(&scope, ctx).await.map(|_| ())
    }

    fn execute_steps<'a>(
        &'a self,
        scope: &'a Scope<'a>,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Flow, Abort>> {
        Box::pin(async move {
            if scope.depth > self.config.max_nesting_depth {
                return Err(Abort::Failed(ExecutionError {
                    message: format!(
                        "step nesting exceeded {} levels",
                        self.config.max_nesting_depth
                    ),
                    step_id: scope.steps.first().map(|s| s.id.clone()),
                    kind: ErrorKind::Engine,
                }));
            }
            let mut index = 0;
            while index < scope.steps.len() {
                check_interrupt(ctx)?;
                let step = &scope.steps[index];
                match self.execute_step(step, scope, ctx).await? {
                    Flow::Continue => index += 1,
                    Flow::Goto(target) => {
                        if let Some(position) = scope.position(&target) {
                            index = position;
                        } else if scope.parent.is_some_and(|p| p.contains(&target)) {
                            return Ok(Flow::Goto(target));
                        } else {
                            // Not reachable from this list: run the target on
                            // its own, then carry on after the failed step.
                            let flow = ctx.flow().clone();
                            let Some(target_step) = flow.find_step(&target) else {
                                return Err(Abort::Failed(ExecutionError {
                                    message: format!("goto target '{target}' not found"),
                                    step_id: Some(step.id.clone()),
                                    kind: ErrorKind::Engine,
                                }));
                            };
                            let standalone =
                                Scope::root(std::slice::from_ref(target_step), scope.depth + 1);
                            self.execute_steps(&standalone, ctx).await?;
                            index += 1;
                        }
                    }
                }
            }
            Ok(Flow::Continue)
        })
    }

    /// Run one step under its retry and on-error policy.
    async fn execute_step(
        &self,
        step: &FlowStep,
        scope: &Scope<'_>,
        ctx: &ExecutionContext,
    ) -> Result<Flow, Abort> {
        let step_id = step.id.as_str();

        if !step.enabled {
            ctx.update_step(step_id, |s| {
                s.status = StepStatus::Skipped;
                s.completed_at = Some(Utc::now());
            });
            ctx.metrics(|m| m.steps_skipped += 1);
            ctx.trace(TraceLevel::Debug, Some(step_id), "step_skipped", "step is disabled");
            return Ok(Flow::Continue);
        }

        let policy = RetryHandler::effective_policy(step, ctx.flow());
        ctx.metrics(|m| m.steps_executed += 1);
        ctx.trace(
            TraceLevel::Info,
            Some(step_id),
            "step_started",
            format!("{} step '{}' started", step.kind.name(), step.display_name()),
        );

        let mut retries = 0u32;
        loop {
            ctx.update_step(step_id, |s| {
                s.status = StepStatus::Running;
                s.attempts += 1;
                s.started_at.get_or_insert_with(Utc::now);
            });

            match self.run_kind(step, scope, ctx).await {
                Ok(output) => {
                    let (result, flow) = match output {
                        StepOutput::Value(value) => {
                            self.map_outputs(step, &value, ctx);
                            (Some(value), Flow::Continue)
                        }
                        StepOutput::Goto(target) => (None, Flow::Goto(target)),
                    };
                    ctx.update_step(step_id, |s| {
                        s.status = StepStatus::Completed;
                        s.completed_at = Some(Utc::now());
                        s.error = None;
                        s.outputs = result;
                    });
                    ctx.trace(TraceLevel::Debug, Some(step_id), "step_completed", "step completed");
                    return Ok(flow);
                }
                Err(StepFault::Abort(abort)) => {
                    let message = match &abort {
                        Abort::Failed(err) => err.message.clone(),
                        Abort::Interrupted(status) => format!("interrupted: execution {status}"),
                    };
                    ctx.update_step(step_id, |s| {
                        s.status = StepStatus::Failed;
                        s.completed_at = Some(Utc::now());
                        s.error = Some(message);
                    });
                    return Err(abort);
                }
                Err(StepFault::Error(err)) => {
                    let message = err.to_string();
                    let delay = policy
                        .retry
                        .as_ref()
                        .and_then(|p| RetryHandler::next_delay(p, retries));
                    let Some(delay_ms) = delay else {
                        return self.apply_on_error(step, &policy, err, ctx);
                    };

                    retries += 1;
                    ctx.update_step(step_id, |s| {
                        s.status = StepStatus::Retrying;
                        s.error = Some(message.clone());
                        s.retry_history.push(RetryRecord {
                            attempt: retries,
                            error: message.clone(),
                            delay_ms,
                            timestamp: Utc::now(),
                        });
                    });
                    ctx.metrics(|m| m.retries += 1);
                    ctx.trace(
                        TraceLevel::Warn,
                        Some(step_id),
                        "step_retrying",
                        format!("retry {retries} in {delay_ms}ms after: {message}"),
                    );
                    debug!(execution_id = %ctx.execution_id(), step_id, retries, delay_ms, "retrying step");

                    let resumed = match self.sleep(Duration::from_millis(delay_ms)).await {
                        Ok(()) => check_interrupt(ctx),
                        Err(abort) => Err(abort),
                    };
                    if let Err(abort) = resumed {
                        ctx.update_step(step_id, |s| {
                            s.status = StepStatus::Failed;
                            s.completed_at = Some(Utc::now());
                        });
                        return Err(abort);
                    }
                }
            }
        }
    }

    /// Apply the on-error action once a step has failed for good.
    fn apply_on_error(
        &self,
        step: &FlowStep,
        policy: &EffectivePolicy,
        err: StepError,
        ctx: &ExecutionContext,
    ) -> Result<Flow, Abort> {
        let step_id = step.id.as_str();
        let exec_err = err.to_execution_error(step_id);

        ctx.update_step(step_id, |s| {
            s.status = StepStatus::Failed;
            s.completed_at = Some(Utc::now());
            s.error = Some(exec_err.message.clone());
        });
        ctx.metrics(|m| m.steps_failed += 1);
        warn!(
            execution_id = %ctx.execution_id(),
            step_id,
            on_error = ?policy.on_error,
            error = %exec_err.message,
            "step failed"
        );

        match policy.on_error {
            OnErrorAction::Continue => {
                ctx.trace(
                    TraceLevel::Warn,
                    Some(step_id),
                    "step_failed",
                    format!("{}; continuing", exec_err.message),
                );
                Ok(Flow::Continue)
            }
            OnErrorAction::Collect => {
                ctx.trace(
                    TraceLevel::Warn,
                    Some(step_id),
                    "step_failed",
                    format!("{}; error collected", exec_err.message),
                );
                ctx.collect_error(exec_err);
                Ok(Flow::Continue)
            }
            OnErrorAction::Stop => {
                ctx.trace(TraceLevel::Error, Some(step_id), "step_failed", exec_err.message.clone());
                Err(Abort::Failed(exec_err))
            }
            OnErrorAction::Goto => {
                let Some(target) = policy.goto_step.clone() else {
                    ctx.trace(TraceLevel::Error, Some(step_id), "step_failed", exec_err.message.clone());
                    return Err(Abort::Failed(exec_err));
                };
                let jumps = ctx.record_goto();
                if jumps > self.config.max_goto_jumps {
                    let message = format!(
                        "goto limit of {} jumps exceeded at step '{step_id}'",
                        self.config.max_goto_jumps
                    );
                    ctx.trace(TraceLevel::Error, Some(step_id), "goto_limit", message.clone());
                    return Err(Abort::Failed(ExecutionError {
                        message,
                        step_id: Some(step_id.to_string()),
                        kind: ErrorKind::Engine,
                    }));
                }
                ctx.trace(
                    TraceLevel::Warn,
                    Some(step_id),
                    "goto",
                    format!("{}; jumping to '{target}'", exec_err.message),
                );
                Ok(Flow::Goto(target))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Kind handlers
    // -----------------------------------------------------------------------

    async fn run_kind(
        &self,
        step: &FlowStep,
        scope: &Scope<'_>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepFault> {
        match &step.kind {
            StepKind::Action { agent_id, action } => {
                let inputs = self.resolve_inputs(step, ctx);
                ctx.update_step(&step.id, |s| {
                    s.inputs = Some(Value::Object(inputs.clone().into_iter().collect()));
                });
                ctx.metrics(|m| m.actions_invoked += 1);

                let call = self.invoker.invoke(agent_id, action, inputs);
                let result = match step.timeout_ms {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                        .await
                        .map_err(|_| {
                            StepError::Timeout(format!(
                                "action '{action}' on agent '{agent_id}' exceeded {ms}ms"
                            ))
                        })?,
                    None => call.await,
                }
                .map_err(StepError::from)?;
                Ok(StepOutput::Value(result))
            }

            StepKind::Condition { expression: expr, on_true, on_false } => {
                let matched = ctx
                    .with_vars(|vars| expression::evaluate(expr, vars))
                    .map_err(StepError::from)?;
                ctx.trace(
                    TraceLevel::Debug,
                    Some(&step.id),
                    "condition_evaluated",
                    format!("'{expr}' evaluated to {matched}"),
                );

                let branch = if matched { on_true } else { on_false };
                let flow = match branch {
                    None => Flow::Continue,
                    Some(BranchTarget::Steps(steps)) => {
                        let body = scope.nested(steps);
                        self.execute_steps(&body, ctx).await?
                    }
                    Some(BranchTarget::Step(target)) => {
                        let definition = ctx.flow().clone();
                        let target_step = definition.find_step(target).ok_or_else(|| {
                            StepError::Engine(format!("condition target '{target}' not found"))
                        })?;
                        let single = scope.nested(std::slice::from_ref(target_step));
                        self.execute_steps(&single, ctx).await?
                    }
                };
                Ok(match flow {
                    Flow::Continue => StepOutput::Value(json!({ "result": matched })),
                    Flow::Goto(target) => StepOutput::Goto(target),
                })
            }

            StepKind::Loop { loop_type, iterable, condition, max_iterations, steps } => {
                let body = scope.nested(steps);
                let max = max_iterations.unwrap_or(self.config.default_max_iterations);
                self.run_loop(step, *loop_type, iterable.as_deref(), condition.as_deref(), max, &body, ctx)
                    .await
            }

            StepKind::Parallel { branches, wait_for_all, fail_fast, max_concurrency } => {
                let depth = scope.depth + 1;
                self.run_parallel(step, branches, *wait_for_all, *fail_fast, *max_concurrency, depth, ctx)
                    .await
            }

            StepKind::Subprocess { flow_id, wait, poll_interval_ms, timeout_ms } => {
                let poll = Duration::from_millis(
                    poll_interval_ms.unwrap_or(self.config.subprocess_poll_interval_ms),
                );
                let timeout = timeout_ms
                    .or(step.timeout_ms)
                    .unwrap_or(self.config.subprocess_timeout_ms);
                self.run_subprocess(step, flow_id, *wait, poll, timeout, ctx).await
            }

            StepKind::Wait { wait_type, duration_ms, condition, poll_interval_ms, timeout_ms } => match wait_type {
                WaitType::Duration => {
                    let ms = duration_ms
                        .ok_or_else(|| StepError::Config("duration wait requires duration_ms".into()))?;
                    self.sleep(Duration::from_millis(ms)).await?;
                    Ok(StepOutput::Value(json!({ "waited_ms": ms })))
                }
                WaitType::Condition => {
                    let condition = condition
                        .as_deref()
                        .ok_or_else(|| StepError::Config("condition wait requires a condition".into()))?;
                    let poll = poll_interval_ms.unwrap_or(self.config.wait_poll_interval_ms);
                    let timeout = timeout_ms
                        .or(step.timeout_ms)
                        .unwrap_or(self.config.wait_condition_timeout_ms);
                    self.wait_for_condition(condition, poll, timeout, ctx).await
                }
            },

            StepKind::Transform { input, operations, output } => {
                let value = ctx.with_vars(|vars| resolver::resolve_str(input, vars));
                let result = ctx.with_vars(|vars| transform::apply_pipeline(value, operations, vars))?;
                ctx.set_var(output.clone(), result.clone());
                Ok(StepOutput::Value(result))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        step: &FlowStep,
        loop_type: LoopType,
        iterable: Option<&str>,
        condition: Option<&str>,
        max: u32,
        body: &Scope<'_>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepFault> {
        let mut iterations = 0u32;

        let completed = match loop_type {
            LoopType::For | LoopType::Foreach => {
                let expr = iterable.ok_or_else(|| {
                    StepError::Config(format!("{loop_type:?} loop requires an iterable").to_lowercase())
                })?;
                let resolved = ctx.with_vars(|vars| resolver::resolve_str(expr, vars));
                let bindings: Vec<Vec<(&str, Value)>> = match (loop_type, resolved) {
                    (LoopType::For, Value::Array(items)) => items
                        .into_iter()
                        .map(|item| vec![("loop_item", item)])
                        .collect(),
                    (LoopType::Foreach, Value::Object(map)) => map
                        .into_iter()
                        .map(|(k, v)| vec![("loop_key", Value::String(k)), ("loop_value", v)])
                        .collect(),
                    (LoopType::Foreach, Value::Array(items)) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| vec![("loop_key", Value::String(i.to_string())), ("loop_value", v)])
                        .collect(),
                    (_, other) => {
                        return Err(StepError::Config(format!(
                            "loop iterable '{expr}' resolved to {}, not a collection",
                            resolver::value_to_string(&other)
                        ))
                        .into());
                    }
                };

                let total = bindings.len();
                for (index, vars) in bindings.into_iter().enumerate() {
                    if iterations >= max {
                        break;
                    }
                    check_interrupt(ctx)?;
                    ctx.with_record(|r| {
                        for (name, value) in vars {
                            r.variables.insert(name.to_string(), value);
                        }
                        r.variables.insert("loop_index".to_string(), Value::from(index));
                    });
                    iterations += 1;
                    if let Flow::Goto(target) = self.execute_steps(body, ctx).await? {
                        return Ok(StepOutput::Goto(target));
                    }
                }
                iterations as usize == total
            }
            LoopType::While => {
                let condition = condition
                    .ok_or_else(|| StepError::Config("while loop requires a condition".into()))?;
                loop {
                    if iterations >= max {
                        break false;
                    }
                    check_interrupt(ctx)?;
                    let holds = ctx
                        .with_vars(|vars| expression::evaluate(condition, vars))
                        .map_err(StepError::from)?;
                    if !holds {
                        break true;
                    }
                    ctx.set_var("loop_index", Value::from(iterations));
                    iterations += 1;
                    if let Flow::Goto(target) = self.execute_steps(body, ctx).await? {
                        return Ok(StepOutput::Goto(target));
                    }
                }
            }
        };

        if !completed {
            ctx.trace(
                TraceLevel::Warn,
                Some(&step.id),
                "loop_limit_reached",
                format!("loop stopped after max_iterations ({max})"),
            );
        }
        Ok(StepOutput::Value(json!({ "iterations": iterations, "completed": completed })))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        step: &FlowStep,
        branches: &[Vec<FlowStep>],
        wait_for_all: bool,
        fail_fast: bool,
        max_concurrency: Option<usize>,
        depth: usize,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepFault> {
        let semaphore = max_concurrency
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        let mut set = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let executor = self.clone();
            let ctx = ctx.clone();
            let steps = branch.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let scope = Scope::root(&steps, depth);
                (index, executor.execute_steps(&scope, &ctx).await)
            });
        }

        let mut reports: Vec<(Option<usize>, Option<String>)> = Vec::with_capacity(branches.len());
        while let Some(joined) = set.join_next().await {
            let (index, error) = match joined {
                Ok((index, Ok(_))) => (Some(index), None),
                Ok((index, Err(Abort::Failed(err)))) => (Some(index), Some(err.to_string())),
                Ok((_, Err(Abort::Interrupted(status)))) => {
                    set.detach_all();
                    return Err(Abort::Interrupted(status).into());
                }
                Err(join_err) => (None, Some(format!("branch task failed: {join_err}"))),
            };

            if let Some(message) = &error {
                let label = index.map_or_else(|| "?".to_string(), |i| i.to_string());
                ctx.trace(
                    TraceLevel::Warn,
                    Some(&step.id),
                    "branch_failed",
                    format!("branch {label} failed: {message}"),
                );
                if fail_fast {
                    // Remaining branches keep running; their results are ignored.
                    set.detach_all();
                    return Err(StepError::Branches(format!("branch {label} failed: {message}")).into());
                }
            }

            reports.push((index, error));
            if !wait_for_all {
                set.detach_all();
                break;
            }
        }

        reports.sort_by_key(|(index, _)| index.unwrap_or(usize::MAX));
        let failed = reports.iter().filter(|(_, e)| e.is_some()).count();
        let branch_results: Vec<Value> = reports
            .into_iter()
            .map(|(index, error)| {
                json!({
                    "index": index,
                    "status": if error.is_some() { "failed" } else { "completed" },
                    "error": error,
                })
            })
            .collect();
        let completed = branch_results.len() - failed;
        Ok(StepOutput::Value(json!({
            "branches": branch_results,
            "completed": completed,
            "failed": failed,
        })))
    }

    async fn run_subprocess(
        &self,
        step: &FlowStep,
        flow_id: &str,
        wait: bool,
        poll: Duration,
        timeout_ms: u64,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepFault> {
        let inputs = self.resolve_inputs(step, ctx);
        let child_id = self
            .launcher
            .launch(flow_id, inputs, ctx.execution_id())
            .map_err(StepError::Engine)?;
        ctx.trace(
            TraceLevel::Info,
            Some(&step.id),
            "subprocess_started",
            format!("started child execution {child_id} of flow '{flow_id}'"),
        );

        if !wait {
            return Ok(StepOutput::Value(json!({ "execution_id": child_id, "status": "pending" })));
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let child = self
                .launcher
                .snapshot(child_id)
                .ok_or_else(|| StepError::Engine(format!("child execution {child_id} disappeared")))?;
            if child.status.is_terminal() {
                if child.status == ExecutionStatus::Completed {
                    return Ok(StepOutput::Value(json!({
                        "execution_id": child_id,
                        "status": child.status,
                        "outputs": child.outputs,
                    })));
                }
                let reason = child
                    .error
                    .map(|e| format!(": {}", e.message))
                    .unwrap_or_default();
                return Err(StepError::Subprocess(format!(
                    "child execution {child_id} ended with status {}{reason}",
                    child.status
                ))
                .into());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::Timeout(format!(
                    "child execution {child_id} did not finish within {timeout_ms}ms"
                ))
                .into());
            }
            self.sleep(poll.min(deadline - now)).await?;
        }
    }

    async fn wait_for_condition(
        &self,
        condition: &str,
        poll_ms: u64,
        timeout_ms: u64,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepFault> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_ms);
        loop {
            let holds = ctx
                .with_vars(|vars| expression::evaluate(condition, vars))
                .map_err(StepError::from)?;
            if holds {
                let waited = started.elapsed().as_millis() as u64;
                return Ok(StepOutput::Value(json!({ "waited_ms": waited, "satisfied": true })));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::Timeout(format!(
                    "condition '{condition}' not met within {timeout_ms}ms"
                ))
                .into());
            }
            self.sleep(Duration::from_millis(poll_ms).min(deadline - now)).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn resolve_inputs(&self, step: &FlowStep, ctx: &ExecutionContext) -> HashMap<String, Value> {
        let Some(inputs) = &step.inputs else {
            return HashMap::new();
        };
        ctx.with_vars(|vars| {
            inputs
                .iter()
                .map(|(name, expr)| (name.clone(), resolver::resolve_value(expr, vars)))
                .collect()
        })
    }

    /// Bind result fields to variables per the step's output map.
    fn map_outputs(&self, step: &FlowStep, result: &Value, ctx: &ExecutionContext) {
        let Some(outputs) = &step.outputs else {
            return;
        };
        for (field, variable) in outputs {
            match resolver::get_path(result, field) {
                Some(value) => ctx.set_var(variable.clone(), value.clone()),
                None => ctx.trace(
                    TraceLevel::Debug,
                    Some(&step.id),
                    "output_missing",
                    format!("result has no field '{field}' for variable '{variable}'"),
                ),
            }
        }
    }

    /// Sleep that only a forced engine shutdown can cut short.
    async fn sleep(&self, duration: Duration) -> Result<(), Abort> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.cancelled() => Err(Abort::Interrupted(ExecutionStatus::Cancelled)),
        }
    }
}

fn check_interrupt(ctx: &ExecutionContext) -> Result<(), Abort> {
    match ctx.interrupted() {
        Some(status) => Err(Abort::Interrupted(status)),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
