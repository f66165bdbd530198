//! Trigger scheduler: the table of scheduled flows and their next run times.
//!
//! A `ScheduledFlow` is created when a flow declaring a `schedule` is
//! registered. On every engine tick, `take_due` returns the enabled entries
//! whose `next_run` has passed and advances them:
//!
//! - `interval`: `now + interval_ms`
//! - `cron`, `event`: `now + placeholder offset` (cron expressions are kept
//!   as metadata and never parsed)
//!
//! Event schedules are additionally fired by name through `event_flows`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use flowrun_types::execution::ScheduledFlow;
use flowrun_types::flow::{FlowSchedule, ScheduleType};

pub struct TriggerScheduler {
    entries: RwLock<HashMap<String, ScheduledFlow>>,
    placeholder_offset: Duration,
}

impl TriggerScheduler {
    pub fn new(placeholder_offset_secs: u64) -> Self {
        let secs = i64::try_from(placeholder_offset_secs).unwrap_or(i64::MAX);
        Self {
            entries: RwLock::new(HashMap::new()),
            placeholder_offset: Duration::try_seconds(secs).unwrap_or(Duration::hours(1)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ScheduledFlow>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ScheduledFlow>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next run time for `schedule`, counted from `from`.
    ///
    /// An interval too large to represent saturates at the latest
    /// representable time, so the entry never comes due.
    pub fn next_run(&self, schedule: &FlowSchedule, from: DateTime<Utc>) -> DateTime<Utc> {
        let step = match (schedule.schedule_type, schedule.interval_ms) {
            (ScheduleType::Interval, Some(ms)) => {
                i64::try_from(ms).ok().and_then(Duration::try_milliseconds)
            }
            _ => Some(self.placeholder_offset),
        };
        step.and_then(|step| from.checked_add_signed(step))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Create or refresh the entry for `flow_id`.
    ///
    /// A refreshed entry keeps its run counters; the schedule, enabled flag
    /// and next run are recomputed from the new definition.
    pub fn upsert(&self, flow_id: &str, schedule: &FlowSchedule, now: DateTime<Utc>) {
        let next_run = self.next_run(schedule, now);
        let mut entries = self.write();
        let entry = entries.entry(flow_id.to_string()).or_insert_with(|| ScheduledFlow {
            flow_id: flow_id.to_string(),
            schedule: schedule.clone(),
            next_run,
            enabled: schedule.enabled,
            last_run: None,
            run_count: 0,
        });
        entry.schedule = schedule.clone();
        entry.enabled = schedule.enabled;
        entry.next_run = next_run;
    }

    pub fn remove(&self, flow_id: &str) -> bool {
        self.write().remove(flow_id).is_some()
    }

    pub fn set_enabled(&self, flow_id: &str, enabled: bool) -> bool {
        match self.write().get_mut(flow_id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Flow ids due at `now`, advanced to their next run.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.write();
        let mut due: Vec<&mut ScheduledFlow> = entries
            .values_mut()
            .filter(|e| e.enabled && e.next_run <= now)
            .collect();
        due.sort_by_key(|e| e.next_run);

        due.into_iter()
            .map(|entry| {
                entry.last_run = Some(now);
                entry.run_count += 1;
                entry.next_run = self.next_run(&entry.schedule, now);
                entry.flow_id.clone()
            })
            .collect()
    }

    /// Enabled flows listening for `event`, counting the firing as a run.
    pub fn event_flows(&self, event: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.write();
        let mut matched: Vec<String> = entries
            .values_mut()
            .filter(|e| {
                e.enabled
                    && e.schedule.schedule_type == ScheduleType::Event
                    && e.schedule.event.as_deref() == Some(event)
            })
            .map(|entry| {
                entry.last_run = Some(now);
                entry.run_count += 1;
                entry.flow_id.clone()
            })
            .collect();
        matched.sort();
        matched
    }

    pub fn get(&self, flow_id: &str) -> Option<ScheduledFlow> {
        self.read().get(flow_id).cloned()
    }

    /// All entries, sorted by flow id.
    pub fn list(&self) -> Vec<ScheduledFlow> {
        let mut all: Vec<ScheduledFlow> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(ms: u64) -> FlowSchedule {
        FlowSchedule {
            schedule_type: ScheduleType::Interval,
            interval_ms: Some(ms),
            expression: None,
            event: None,
            enabled: true,
        }
    }

    fn event(name: &str) -> FlowSchedule {
        FlowSchedule {
            schedule_type: ScheduleType::Event,
            interval_ms: None,
            expression: None,
            event: Some(name.to_string()),
            enabled: true,
        }
    }

    #[test]
    fn test_huge_interval_saturates_instead_of_overflowing() {
        let triggers = TriggerScheduler::new(3600);
        let now = Utc::now();
        triggers.upsert("far", &interval(i64::MAX as u64), now);
        triggers.upsert("farther", &interval(u64::MAX), now);

        assert_eq!(triggers.get("far").unwrap().next_run, DateTime::<Utc>::MAX_UTC);
        assert_eq!(triggers.get("farther").unwrap().next_run, DateTime::<Utc>::MAX_UTC);
        assert!(triggers.take_due(now + Duration::days(365)).is_empty());
    }

    #[test]
    fn test_interval_due_and_advanced() {
        let triggers = TriggerScheduler::new(3600);
        let now = Utc::now();
        triggers.upsert("every5s", &interval(5000), now);

        assert!(triggers.take_due(now + Duration::seconds(1)).is_empty());

        let later = now + Duration::seconds(6);
        assert_eq!(triggers.take_due(later), vec!["every5s"]);
        let entry = triggers.get("every5s").unwrap();
        assert_eq!(entry.run_count, 1);
        assert_eq!(entry.last_run, Some(later));
        assert_eq!(entry.next_run, later + Duration::seconds(5));
    }

    #[test]
    fn test_cron_uses_placeholder_offset() {
        let triggers = TriggerScheduler::new(60);
        let now = Utc::now();
        let cron = FlowSchedule {
            schedule_type: ScheduleType::Cron,
            interval_ms: None,
            expression: Some("0 * * * *".into()),
            event: None,
            enabled: true,
        };
        triggers.upsert("hourly", &cron, now);
        assert_eq!(triggers.get("hourly").unwrap().next_run, now + Duration::seconds(60));
    }

    #[test]
    fn test_disabled_entries_never_due() {
        let triggers = TriggerScheduler::new(3600);
        let now = Utc::now();
        triggers.upsert("f", &interval(10), now);
        assert!(triggers.set_enabled("f", false));
        assert!(triggers.take_due(now + Duration::seconds(1)).is_empty());
        assert!(!triggers.set_enabled("missing", true));
    }

    #[test]
    fn test_event_flows_match_by_name() {
        let triggers = TriggerScheduler::new(3600);
        let now = Utc::now();
        triggers.upsert("on_order", &event("order.created"), now);
        triggers.upsert("on_refund", &event("order.refunded"), now);
        triggers.upsert("timer", &interval(1000), now);

        assert_eq!(triggers.event_flows("order.created", now), vec!["on_order"]);
        assert!(triggers.event_flows("unknown", now).is_empty());
        assert_eq!(triggers.get("on_order").unwrap().run_count, 1);
    }

    #[test]
    fn test_upsert_keeps_counters_and_remove() {
        let triggers = TriggerScheduler::new(3600);
        let now = Utc::now();
        triggers.upsert("f", &interval(10), now);
        triggers.take_due(now + Duration::seconds(1));
        triggers.upsert("f", &interval(20), now);
        assert_eq!(triggers.get("f").unwrap().run_count, 1);
        assert_eq!(triggers.list().len(), 1);
        assert!(triggers.remove("f"));
        assert!(triggers.list().is_empty());
    }
}
