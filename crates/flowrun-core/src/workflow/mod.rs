//! Workflow engine core: definition parsing, step interpretation, admission,
//! and the runner facade.
//!
//! - `definition` -- YAML/JSON parsing and registration-time validation
//! - `resolver` -- `${name}` placeholder resolution against the variable table
//! - `expression` -- bounded condition grammar (comparisons, `&&`, `||`, `!`)
//! - `transform` -- transform step pipeline operations
//! - `context` -- live execution state shared by the runner and executor
//! - `retry` -- retry back-off and on-error policy resolution
//! - `executor` -- recursive step-tree interpreter
//! - `scheduler` -- FIFO execution queue and concurrency gate
//! - `trigger` -- scheduled flows and next-run bookkeeping
//! - `runner` -- `FlowEngine`, the public facade

pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod invoker;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod transform;
pub mod trigger;

pub use definition::{ParseError, parse_flow_json, parse_flow_yaml, validate_flow};
pub use error::{EngineError, StepError, ValidationErrors};
pub use invoker::{AgentInvoker, InvokeError, SubflowLauncher};
pub use runner::{EngineStats, ExecuteOptions, ExecutionFilter, FlowEngine};
