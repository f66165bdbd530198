//! Retry and on-error policy resolution.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. The executor owns the attempt loop and the history.

use flowrun_types::flow::{FlowDefinition, FlowStep, OnErrorAction, RetryPolicy};

/// The error-handling policy in force for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub retry: Option<RetryPolicy>,
    pub on_error: OnErrorAction,
    pub goto_step: Option<String>,
}

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Resolve the policy for `step`: step-level fields win, the flow-level
    /// default fills the gaps, and `on_error` falls back to `stop`.
    ///
    /// `goto_step` travels with whichever level supplied `on_error`.
    pub fn effective_policy(step: &FlowStep, flow: &FlowDefinition) -> EffectivePolicy {
        let flow_level = &flow.config.error_handling;
        let step_level = step.error_handling.as_ref();

        let retry = step_level
            .and_then(|h| h.retry.clone())
            .or_else(|| flow_level.retry.clone());

        let (on_error, goto_step) = match step_level.and_then(|h| h.on_error.map(|a| (a, h))) {
            Some((action, handling)) => (action, handling.goto_step.clone()),
            None => (
                flow_level.on_error.unwrap_or_default(),
                flow_level.goto_step.clone(),
            ),
        };

        EffectivePolicy { retry, on_error, goto_step }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    ///
    /// `retries_so_far` counts retries already made (0 before the first).
    /// The delay is `delay_ms * backoff_multiplier^retries_so_far`, capped at
    /// `max_delay_ms` when set.
    pub fn next_delay(policy: &RetryPolicy, retries_so_far: u32) -> Option<u64> {
        if retries_so_far >= policy.max_attempts {
            return None;
        }
        let exponent = i32::try_from(retries_so_far).unwrap_or(i32::MAX);
        let raw = policy.delay_ms as f64 * policy.backoff_multiplier.max(0.0).powi(exponent);
        let raw = if raw.is_finite() { raw.round() as u64 } else { u64::MAX };
        Some(match policy.max_delay_ms {
            Some(max) => raw.min(max),
            None => raw,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_types::flow::{ErrorHandling, StepKind, WaitType};

    fn policy(max_attempts: u32, delay_ms: u64, max_delay_ms: Option<u64>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 2.0,
            max_delay_ms,
        }
    }

    fn wait_step(handling: Option<ErrorHandling>) -> FlowStep {
        let mut step = FlowStep::new(
            "w",
            StepKind::Wait {
                wait_type: WaitType::Duration,
                duration_ms: Some(1),
                condition: None,
                poll_interval_ms: None,
                timeout_ms: None,
            },
        );
        step.error_handling = handling;
        step
    }

    fn flow_with_default(handling: ErrorHandling) -> FlowDefinition {
        let mut flow: FlowDefinition = serde_json::from_value(serde_json::json!({
            "id": "f", "name": "F", "version": "1", "steps": []
        }))
        .unwrap();
        flow.config.error_handling = handling;
        flow
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let p = policy(3, 100, None);
        assert_eq!(RetryHandler::next_delay(&p, 0), Some(100));
        assert_eq!(RetryHandler::next_delay(&p, 1), Some(200));
        assert_eq!(RetryHandler::next_delay(&p, 2), Some(400));
        assert_eq!(RetryHandler::next_delay(&p, 3), None);
    }

    #[test]
    fn test_backoff_capped_by_max_delay() {
        let p = policy(3, 100, Some(250));
        let delays: Vec<_> = (0..4).map(|n| RetryHandler::next_delay(&p, n)).collect();
        assert_eq!(delays, vec![Some(100), Some(200), Some(250), None]);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        assert_eq!(RetryHandler::next_delay(&policy(0, 100, None), 0), None);
    }

    #[test]
    fn test_step_level_on_error_wins() {
        let flow = flow_with_default(ErrorHandling {
            retry: Some(policy(5, 10, None)),
            on_error: Some(OnErrorAction::Continue),
            goto_step: None,
        });
        let step = wait_step(Some(ErrorHandling {
            retry: None,
            on_error: Some(OnErrorAction::Goto),
            goto_step: Some("recover".into()),
        }));
        let effective = RetryHandler::effective_policy(&step, &flow);
        assert_eq!(effective.on_error, OnErrorAction::Goto);
        assert_eq!(effective.goto_step.as_deref(), Some("recover"));
        // No step-level retry: the flow default applies.
        assert_eq!(effective.retry.map(|r| r.max_attempts), Some(5));
    }

    #[test]
    fn test_flow_default_and_stop_fallback() {
        let flow = flow_with_default(ErrorHandling {
            retry: None,
            on_error: Some(OnErrorAction::Collect),
            goto_step: None,
        });
        let effective = RetryHandler::effective_policy(&wait_step(None), &flow);
        assert_eq!(effective.on_error, OnErrorAction::Collect);
        assert!(effective.retry.is_none());

        let bare = flow_with_default(ErrorHandling::default());
        let effective = RetryHandler::effective_policy(&wait_step(None), &bare);
        assert_eq!(effective.on_error, OnErrorAction::Stop);
    }
}
