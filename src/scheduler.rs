use std::time::Duration;

/// Periodic jobs the server runs on its own cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    /// Drop expired hero locks and announce the new lock set if it changed
    SweepLocks,
    /// Broadcast per-display health and pipeline stats
    BroadcastHealth,
    /// Ping connections and drop the ones that never answered the last ping
    Keepalive,
    /// Fire barrier deadlines that have elapsed
    CoordinationDeadlines,
    /// Halve fairness counters and evict stale show timestamps (display side)
    DecaySelection,
    /// Send a display heartbeat (display side)
    Heartbeat,
}

#[derive(Debug, Clone)]
struct PeriodicTask {
    kind: TickKind,
    period_ms: u64,
    next_due_ms: u64,
}

/// Table of periodic tasks evaluated against an explicit "now".
///
/// Nothing in here sleeps. A runtime loop (see [`Scheduler::tick_interval`])
/// or a test feeds it timestamps and gets back the tasks that are due.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task that first fires one period after `start_ms`
    pub fn every(mut self, kind: TickKind, period: Duration, start_ms: u64) -> Self {
        let period_ms = period.as_millis().max(1) as u64;
        self.tasks.retain(|t| t.kind != kind);
        self.tasks.push(PeriodicTask {
            kind,
            period_ms,
            next_due_ms: start_ms + period_ms,
        });
        self
    }

    /// Collect every task due at `now_ms` and schedule its next run.
    ///
    /// A task that fell several periods behind fires once, not once per
    /// missed period.
    pub fn due(&mut self, now_ms: u64) -> Vec<TickKind> {
        let mut due = Vec::new();
        for task in &mut self.tasks {
            if now_ms >= task.next_due_ms {
                due.push(task.kind);
                let behind = (now_ms - task.next_due_ms) / task.period_ms;
                task.next_due_ms += (behind + 1) * task.period_ms;
            }
        }
        due
    }

    /// Milliseconds until the next task is due, if any task is registered
    pub fn next_due_in(&self, now_ms: u64) -> Option<u64> {
        self.tasks
            .iter()
            .map(|t| t.next_due_ms.saturating_sub(now_ms))
            .min()
    }

    /// Granularity of the runtime loop driving this scheduler
    pub fn tick_interval(&self) -> Duration {
        let shortest = self.tasks.iter().map(|t| t.period_ms).min().unwrap_or(1000);
        Duration::from_millis(shortest.clamp(100, 1000))
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_fire_on_their_period() {
        let mut scheduler = Scheduler::new()
            .every(TickKind::SweepLocks, Duration::from_secs(5), 0)
            .every(TickKind::BroadcastHealth, Duration::from_secs(3), 0);

        assert!(scheduler.due(2_999).is_empty());
        assert_eq!(scheduler.due(3_000), vec![TickKind::BroadcastHealth]);
        assert_eq!(scheduler.due(5_000), vec![TickKind::SweepLocks]);
        assert_eq!(scheduler.due(6_000), vec![TickKind::BroadcastHealth]);
    }

    #[test]
    fn test_missed_periods_collapse_into_one_run() {
        let mut scheduler = Scheduler::new().every(TickKind::Keepalive, Duration::from_secs(10), 0);

        assert_eq!(scheduler.due(45_000), vec![TickKind::Keepalive]);
        assert!(scheduler.due(49_999).is_empty());
        assert_eq!(scheduler.due(50_000), vec![TickKind::Keepalive]);
    }

    #[test]
    fn test_next_due_and_interval() {
        let scheduler = Scheduler::new()
            .every(TickKind::CoordinationDeadlines, Duration::from_millis(500), 1_000)
            .every(TickKind::Keepalive, Duration::from_secs(10), 1_000);

        assert_eq!(scheduler.next_due_in(1_200), Some(300));
        assert_eq!(scheduler.tick_interval(), Duration::from_millis(500));
        assert!(Scheduler::new().is_empty());
    }
}
