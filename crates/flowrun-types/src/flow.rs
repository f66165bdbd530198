//! Flow definition types.
//!
//! A `FlowDefinition` is the declarative, versioned description of a workflow:
//! an ordered tree of typed `FlowStep`s plus declared inputs/outputs, runtime
//! configuration, and an optional recurring schedule. Definitions are parsed
//! from YAML or JSON and validated once, at registration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A versioned, named workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Stable flow identifier (e.g. "order-intake").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Version string; an id+version pair is immutable once registered.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs, seeded into the variable table before execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<FlowParameter>,
    /// Declared outputs, read back from the variable table on completion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<FlowParameter>,
    /// Top-level steps, executed in order.
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub config: FlowConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<FlowSchedule>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl FlowDefinition {
    /// Visit every step in the tree, depth-first, in declaration order.
    pub fn walk_steps<'a>(&'a self, visit: &mut impl FnMut(&'a FlowStep)) {
        for step in &self.steps {
            step.walk(visit);
        }
    }

    /// Find a step anywhere in the tree by id.
    pub fn find_step(&self, id: &str) -> Option<&FlowStep> {
        let mut found = None;
        self.walk_steps(&mut |step| {
            if found.is_none() && step.id == id {
                found = Some(step);
            }
        });
        found
    }
}

/// A declared flow input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

/// Runtime configuration for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Execution timeout in milliseconds, observed between steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Advisory concurrency hint; the engine-wide gate is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Default error handling for steps without their own block.
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Record debug/info trace entries for executions of this flow.
    #[serde(default = "default_true")]
    pub tracing: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_concurrency: None,
            error_handling: ErrorHandling::default(),
            tracing: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Recurring trigger attached to a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSchedule {
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    /// Interval between runs, for `interval` schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Cron expression, kept as metadata only (not parsed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Event name, for `event` schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
    Event,
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Error-handling block, at flow level (default) or per step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorAction>,
    /// Target step id for `on_error: goto`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_step: Option<String>,
}

/// What to do once a step has failed and retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorAction {
    /// Log and proceed to the next sibling step.
    Continue,
    /// Fail the whole execution.
    #[default]
    Stop,
    /// Resume execution at `goto_step`.
    Goto,
    /// Like `continue`, and also collect the error on the execution.
    Collect,
}

/// Retry with exponential back-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first failed attempt (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds (default 1000).
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied per retry (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Flow Step
// ---------------------------------------------------------------------------

/// One unit of work in a flow.
///
/// Common fields live on the struct; kind-specific fields are flattened in
/// from `StepKind`, tagged by `type`:
/// ```yaml
/// - id: fetch
///   type: action
///   agent_id: crm
///   action: lookup
///   outputs: { customer: customer }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Step id, unique across the whole flow tree.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Disabled steps are skipped without execution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Input expressions, resolved against the variable table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<HashMap<String, Value>>,
    /// Maps result fields (dotted paths) to variable names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl FlowStep {
    /// Create an enabled step with no inputs, outputs, or error handling.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            inputs: None,
            outputs: None,
            error_handling: None,
            timeout_ms: None,
            priority: None,
            kind,
        }
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Visit this step and every nested step, depth-first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a FlowStep)) {
        visit(self);
        for list in self.kind.nested_lists() {
            for step in list {
                step.walk(visit);
            }
        }
    }
}

/// The seven step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke an agent action with resolved inputs.
    Action { agent_id: String, action: String },
    /// Evaluate a boolean expression and run the matching branch.
    Condition {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_true: Option<BranchTarget>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<BranchTarget>,
    },
    /// Bounded iteration over a nested step list.
    Loop {
        loop_type: LoopType,
        /// Array (for) or object (foreach) expression.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iterable: Option<String>,
        /// Re-evaluated before every `while` iteration.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        steps: Vec<FlowStep>,
    },
    /// Concurrent branches, each a step list.
    Parallel {
        branches: Vec<Vec<FlowStep>>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
        #[serde(default)]
        fail_fast: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Start a child execution of another flow.
    Subprocess {
        flow_id: String,
        #[serde(default = "default_true")]
        wait: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Sleep, or poll a condition until it holds.
    Wait {
        wait_type: WaitType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Data pipeline over a resolved input, bound to `output`.
    Transform {
        input: String,
        #[serde(default)]
        operations: Vec<TransformOperation>,
        output: String,
    },
}

impl StepKind {
    /// Lower-case kind name, as used in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Action { .. } => "action",
            StepKind::Condition { .. } => "condition",
            StepKind::Loop { .. } => "loop",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Subprocess { .. } => "subprocess",
            StepKind::Wait { .. } => "wait",
            StepKind::Transform { .. } => "transform",
        }
    }

    /// Step lists nested directly inside this step.
    pub fn nested_lists(&self) -> Vec<&[FlowStep]> {
        match self {
            StepKind::Condition { on_true, on_false, .. } => [on_true, on_false]
                .into_iter()
                .flatten()
                .filter_map(|target| match target {
                    BranchTarget::Steps(steps) => Some(steps.as_slice()),
                    BranchTarget::Step(_) => None,
                })
                .collect(),
            StepKind::Loop { steps, .. } => vec![steps.as_slice()],
            StepKind::Parallel { branches, .. } => {
                branches.iter().map(|b| b.as_slice()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A condition branch: a reference to a step elsewhere in the tree, or an
/// inline step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchTarget {
    Step(String),
    Steps(Vec<FlowStep>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// Iterate an array, binding `loop_item` and `loop_index`.
    For,
    /// Repeat while a condition holds.
    While,
    /// Iterate an object, binding `loop_key`, `loop_value` and `loop_index`.
    Foreach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    Duration,
    Condition,
}

// ---------------------------------------------------------------------------
// Transform operations
// ---------------------------------------------------------------------------

/// One stage of a transform pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOperation {
    /// Pluck a dotted path from every element.
    Map { field: String },
    /// Keep elements for which `condition` holds (`item`, `index` bound).
    Filter { condition: String },
    /// Fold the array to a single value.
    Reduce {
        operation: ReduceOperation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// Sort elements, optionally by a dotted field.
    Sort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default)]
        order: SortOrder,
    },
    /// Group elements into an object keyed by a field value.
    Group { field: String },
    /// Join elements into a string.
    Join {
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Pull a nested value out of the current value.
    Extract { path: String },
}

fn default_separator() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOperation {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    Concat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
