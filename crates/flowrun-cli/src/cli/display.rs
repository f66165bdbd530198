//! Styled terminal output for executions, schedules and engine stats.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowrun_core::workflow::EngineStats;
use flowrun_types::execution::{ExecutionStatus, FlowExecution, ScheduledFlow, StepStatus};

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::Yellow,
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed | ExecutionStatus::Timeout => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.to_string()).fg(color)
}

fn step_status_cell(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        StepStatus::Running => Cell::new("running").fg(Color::Blue),
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
        StepStatus::Retrying => Cell::new("retrying").fg(Color::Magenta),
    }
}

/// Summary, step table and outputs of one execution.
pub fn print_execution(exec: &FlowExecution) {
    let headline = match exec.status {
        ExecutionStatus::Completed => style("✓").green().bold(),
        ExecutionStatus::Pending | ExecutionStatus::Running => style("…").yellow().bold(),
        _ => style("✗").red().bold(),
    };
    println!();
    println!(
        "  {} {} v{} {}",
        headline,
        style(&exec.flow_id).cyan(),
        exec.flow_version,
        exec.status
    );
    println!("  Execution: {}", exec.id);
    if let Some(ms) = exec.metrics.duration_ms {
        println!("  Duration:  {ms} ms");
    }
    println!(
        "  Steps:     {} executed, {} skipped, {} failed, {} retries",
        exec.metrics.steps_executed, exec.metrics.steps_skipped, exec.metrics.steps_failed, exec.metrics.retries
    );
    if let Some(error) = &exec.error {
        println!("  Error:     {}", style(error).red());
    }
    for collected in &exec.collected_errors {
        println!("  Collected: {}", style(collected).yellow());
    }

    if !exec.step_states.is_empty() {
        let mut states: Vec<_> = exec.step_states.values().collect();
        states.sort_by_key(|s| (s.started_at, s.step_id.clone()));

        let mut table = table();
        table.set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Error"),
        ]);
        for state in states {
            table.add_row(vec![
                Cell::new(&state.step_id),
                step_status_cell(state.status),
                Cell::new(state.attempts),
                Cell::new(state.error.as_deref().unwrap_or("-")),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !exec.outputs.is_empty() {
        let mut outputs: Vec<_> = exec.outputs.iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        println!();
        println!("  Outputs:");
        for (name, value) in outputs {
            println!("    {} = {}", style(name).bold(), value);
        }
    }
    println!();
}

pub fn print_schedules(schedules: &[ScheduledFlow]) {
    if schedules.is_empty() {
        println!("  No scheduled flows.");
        return;
    }
    let mut table = table();
    table.set_header(vec![
        Cell::new("Flow").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Trigger"),
        Cell::new("Next run"),
        Cell::new("Enabled"),
    ]);
    for entry in schedules {
        let schedule = &entry.schedule;
        let trigger = schedule
            .interval_ms
            .map(|ms| format!("every {ms} ms"))
            .or_else(|| schedule.expression.clone())
            .or_else(|| schedule.event.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&entry.flow_id),
            Cell::new(format!("{:?}", schedule.schedule_type).to_lowercase()),
            Cell::new(trigger),
            Cell::new(entry.next_run.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(if entry.enabled { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");
}

pub fn print_stats(stats: &EngineStats) {
    let mut table = table();
    table.set_header(vec![Cell::new("Metric").fg(Color::Cyan), Cell::new("Value")]);
    let rows: [(&str, String); 8] = [
        ("flows", stats.total_flows.to_string()),
        ("executions", stats.total_executions.to_string()),
        ("completed", stats.completed.to_string()),
        ("failed", stats.failed.to_string()),
        ("cancelled", stats.cancelled.to_string()),
        ("timed out", stats.timed_out.to_string()),
        ("avg duration", format!("{:.1} ms", stats.average_duration_ms)),
        ("throughput", format!("{}/min", stats.throughput_per_minute)),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    println!("{table}");
}
