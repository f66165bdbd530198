//! Flow definition parsing and registration-time validation.
//!
//! Validation runs once, when a flow is registered, and never again during
//! execution. It collects every problem rather than stopping at the first.

use std::collections::{HashMap, HashSet};

use flowrun_types::flow::{BranchTarget, ErrorHandling, FlowDefinition, OnErrorAction, ScheduleType, StepKind};
use thiserror::Error;

use super::error::ValidationErrors;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML flow definition. Does not validate.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, ParseError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Parse a JSON flow definition. Does not validate.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, ParseError> {
    Ok(serde_json::from_str(json)?)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a flow definition.
///
/// Checks:
/// - id, name and version are non-empty
/// - at least one step exists
/// - step ids are non-empty and unique across the whole tree
/// - `on_true` / `on_false` step references exist and never lead back to
///   the step that holds them
/// - every `on_error: goto` (flow or step level) names an existing step
/// - subprocess `flow_id` is non-empty and names this flow or a known one
/// - interval schedules carry `interval_ms`, event schedules an `event`
///
/// `is_known_flow` answers whether a flow id is already registered.
pub fn validate_flow(
    flow: &FlowDefinition,
    is_known_flow: &dyn Fn(&str) -> bool,
) -> Result<(), ValidationErrors> {
    let mut reasons = Vec::new();

    if flow.id.trim().is_empty() {
        reasons.push("flow id is required".to_string());
    }
    if flow.name.trim().is_empty() {
        reasons.push("flow name is required".to_string());
    }
    if flow.version.trim().is_empty() {
        reasons.push("flow version is required".to_string());
    }
    if flow.steps.is_empty() {
        reasons.push("flow must have at least one step".to_string());
    }

    let mut ids = HashSet::new();
    flow.walk_steps(&mut |step| {
        if step.id.trim().is_empty() {
            reasons.push("step id must not be empty".to_string());
        } else if !ids.insert(step.id.as_str()) {
            reasons.push(format!("duplicate step id '{}'", step.id));
        }
    });

    check_goto(&flow.config.error_handling, "flow config", &ids, &mut reasons);

    flow.walk_steps(&mut |step| {
        if let Some(handling) = &step.error_handling {
            check_goto(handling, &format!("step '{}'", step.id), &ids, &mut reasons);
        }
        match &step.kind {
            StepKind::Condition { on_true, on_false, .. } => {
                for (label, target) in [("on_true", on_true), ("on_false", on_false)] {
                    if let Some(BranchTarget::Step(target)) = target {
                        if !ids.contains(target.as_str()) {
                            reasons.push(format!(
                                "step '{}' {label} references unknown step '{target}'",
                                step.id
                            ));
                        }
                    }
                }
            }
            StepKind::Subprocess { flow_id, .. } => {
                if flow_id.trim().is_empty() {
                    reasons.push(format!("subprocess step '{}' has an empty flow_id", step.id));
                } else if flow_id != &flow.id && !is_known_flow(flow_id) {
                    reasons.push(format!(
                        "subprocess step '{}' references unknown flow '{flow_id}'",
                        step.id
                    ));
                }
            }
            _ => {}
        }
    });

    check_branch_cycles(flow, &mut reasons);

    if let Some(schedule) = &flow.schedule {
        match schedule.schedule_type {
            ScheduleType::Interval if schedule.interval_ms.unwrap_or(0) == 0 => {
                reasons.push("interval schedule requires a positive interval_ms".to_string());
            }
            ScheduleType::Event if schedule.event.as_deref().is_none_or(|e| e.trim().is_empty()) => {
                reasons.push("event schedule requires an event name".to_string());
            }
            _ => {}
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors { reasons })
    }
}

#[derive(Clone, Copy)]
enum Mark {
    Visiting,
    Done,
}

/// Running a step runs every by-id condition target inside it, so each step
/// points at the targets found anywhere in its own subtree.
fn check_branch_cycles(flow: &FlowDefinition, reasons: &mut Vec<String>) {
    let mut order = Vec::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    flow.walk_steps(&mut |step| {
        if edges.contains_key(step.id.as_str()) {
            return;
        }
        let mut targets = Vec::new();
        step.walk(&mut |inner| {
            if let StepKind::Condition { on_true, on_false, .. } = &inner.kind {
                for target in [on_true, on_false].into_iter().flatten() {
                    if let BranchTarget::Step(id) = target {
                        targets.push(id.as_str());
                    }
                }
            }
        });
        order.push(step.id.as_str());
        edges.insert(step.id.as_str(), targets);
    });

    let mut marks = HashMap::new();
    for id in order {
        visit_branches(id, &edges, &mut marks, reasons);
    }
}

fn visit_branches<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    reasons: &mut Vec<String>,
) {
    match marks.get(id) {
        Some(Mark::Done) => return,
        Some(Mark::Visiting) => {
            reasons.push(format!("condition branches form a cycle through step '{id}'"));
            return;
        }
        None => {}
    }
    marks.insert(id, Mark::Visiting);
    for next in edges.get(id).into_iter().flatten() {
        visit_branches(next, edges, marks, reasons);
    }
    marks.insert(id, Mark::Done);
}

fn check_goto(handling: &ErrorHandling, owner: &str, ids: &HashSet<&str>, reasons: &mut Vec<String>) {
    if handling.on_error != Some(OnErrorAction::Goto) {
        return;
    }
    match handling.goto_step.as_deref() {
        None => reasons.push(format!("{owner} uses on_error goto without goto_step")),
        Some(target) if !ids.contains(target) => {
            reasons.push(format!("{owner} goto_step references unknown step '{target}'"));
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_flows(_: &str) -> bool {
        false
    }

    fn parse(yaml: &str) -> FlowDefinition {
        parse_flow_yaml(yaml).unwrap()
    }

    #[test]
    fn test_valid_flow_passes() {
        let flow = parse(
            r#"
id: greet
name: Greet
version: "1"
steps:
  - id: check
    type: condition
    expression: "5 > 3"
    on_true: hello
  - id: hello
    type: action
    agent_id: greeter
    action: say_hello
    error_handling:
      on_error: goto
      goto_step: check
  - id: child
    type: subprocess
    flow_id: greet
"#,
        );
        assert!(validate_flow(&flow, &no_flows).is_ok());
    }

    #[test]
    fn test_missing_fields_and_no_steps() {
        let flow = parse("id: ''\nname: ''\nversion: ''\nsteps: []\n");
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons.len(), 4);
        assert!(err.reasons.iter().any(|r| r.contains("at least one step")));
    }

    #[test]
    fn test_dangling_on_true_rejected() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: check
    type: condition
    expression: "true"
    on_true: nowhere
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons, vec!["step 'check' on_true references unknown step 'nowhere'"]);
    }

    #[test]
    fn test_condition_targeting_itself_rejected() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: again
    type: condition
    expression: "true"
    on_true: again
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons, vec!["condition branches form a cycle through step 'again'"]);
    }

    #[test]
    fn test_mutual_and_nested_branch_cycles_rejected() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: ping
    type: condition
    expression: "true"
    on_true: pong
  - id: pong
    type: condition
    expression: "true"
    on_false: ping
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons, vec!["condition branches form a cycle through step 'ping'"]);

        // The back-reference sits inside the loop it names.
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: outer
    type: loop
    loop_type: while
    condition: "true"
    max_iterations: 2
    steps:
      - id: inner
        type: condition
        expression: "true"
        on_true: outer
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons.len(), 1);
        assert!(err.reasons[0].contains("cycle through step 'outer'"));
    }

    #[test]
    fn test_forward_branch_reference_is_not_a_cycle() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: first
    type: condition
    expression: "true"
    on_true: second
    on_false: second
  - id: second
    type: condition
    expression: "true"
    on_true: leaf
  - id: leaf
    type: transform
    input: "x"
    output: y
"#,
        );
        assert!(validate_flow(&flow, &no_flows).is_ok());
    }

    #[test]
    fn test_duplicate_ids_across_nested_lists() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
steps:
  - id: outer
    type: loop
    loop_type: while
    condition: "false"
    steps:
      - id: outer
        type: wait
        wait_type: duration
        duration_ms: 1
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert!(err.reasons[0].contains("duplicate step id 'outer'"));
    }

    #[test]
    fn test_goto_and_subprocess_references() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
config:
  error_handling:
    on_error: goto
steps:
  - id: a
    type: subprocess
    flow_id: other
    error_handling:
      on_error: goto
      goto_step: ghost
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert_eq!(err.reasons.len(), 3, "{:?}", err.reasons);

        let known = |id: &str| id == "other";
        let err = validate_flow(&flow, &known).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
    }

    #[test]
    fn test_schedule_requirements() {
        let flow = parse(
            r#"
id: f
name: F
version: "1"
schedule:
  type: interval
steps:
  - id: a
    type: wait
    wait_type: duration
    duration_ms: 1
"#,
        );
        let err = validate_flow(&flow, &no_flows).unwrap_err();
        assert!(err.reasons[0].contains("interval_ms"));
    }

    #[test]
    fn test_parse_json_flow() {
        let flow = parse_flow_json(
            r#"{"id":"j","name":"J","version":"2","steps":[{"id":"w","type":"wait","wait_type":"duration","duration_ms":5}]}"#,
        )
        .unwrap();
        assert_eq!(flow.version, "2");
        assert!(parse_flow_json("{ not json").is_err());
    }
}
