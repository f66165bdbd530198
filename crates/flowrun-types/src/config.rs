//! Engine configuration types.
//!
//! `EngineConfig` is the `[engine]` table of `flowrun.toml`. Every field has a
//! default, so an empty or partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency gate: executions allowed in `running` at once.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Trigger scheduler tick.
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// How long `shutdown()` waits for running executions before forcing them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Terminal executions kept in memory.
    #[serde(default = "default_max_execution_history")]
    pub max_execution_history: usize,

    /// Terminal executions older than this are pruned.
    #[serde(default = "default_execution_retention_secs")]
    pub execution_retention_secs: u64,

    /// Cap on each execution's trace log; oldest entries are dropped.
    #[serde(default = "default_max_trace_entries")]
    pub max_trace_entries: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub subprocess_poll_interval_ms: u64,

    #[serde(default = "default_subprocess_timeout_ms")]
    pub subprocess_timeout_ms: u64,

    #[serde(default = "default_wait_condition_timeout_ms")]
    pub wait_condition_timeout_ms: u64,

    /// Loop cap when a loop step omits `max_iterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Goto jumps allowed per execution before it is failed.
    #[serde(default = "default_max_goto_jumps")]
    pub max_goto_jumps: u32,

    /// Deepest nesting of step lists (branches, loop bodies, by-id targets)
    /// before the execution is failed.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Forward offset used for `cron` and `event` schedules' next run.
    #[serde(default = "default_placeholder_schedule_offset_secs")]
    pub placeholder_schedule_offset_secs: u64,
}

fn default_max_concurrent_executions() -> usize {
    10
}

fn default_scheduler_tick_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_max_execution_history() -> usize {
    1000
}

fn default_execution_retention_secs() -> u64 {
    86_400
}

fn default_max_trace_entries() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_subprocess_timeout_ms() -> u64 {
    300_000
}

fn default_wait_condition_timeout_ms() -> u64 {
    60_000
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_max_goto_jumps() -> u32 {
    100
}

fn default_max_nesting_depth() -> usize {
    32
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_placeholder_schedule_offset_secs() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_execution_history: default_max_execution_history(),
            execution_retention_secs: default_execution_retention_secs(),
            max_trace_entries: default_max_trace_entries(),
            wait_poll_interval_ms: default_poll_interval_ms(),
            subprocess_poll_interval_ms: default_poll_interval_ms(),
            subprocess_timeout_ms: default_subprocess_timeout_ms(),
            wait_condition_timeout_ms: default_wait_condition_timeout_ms(),
            default_max_iterations: default_max_iterations(),
            max_goto_jumps: default_max_goto_jumps(),
            max_nesting_depth: default_max_nesting_depth(),
            event_bus_capacity: default_event_bus_capacity(),
            placeholder_schedule_offset_secs: default_placeholder_schedule_offset_secs(),
        }
    }
}

impl EngineConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
