use std::time::{Duration, Instant};

/// Periodic tasks run by the scheduler between pumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollableKind {
    GcCheck,
    Heartbeat,
    Rebalance,
    OffloadStalledSaves,
    Summary,
}

#[derive(Debug)]
struct Pollable {
    kind: PollableKind,
    period: Duration,
    next_due: Instant,
}

/// Fixed set of periodic tasks with their next due time.
#[derive(Debug, Default)]
pub struct Pollables {
    entries: Vec<Pollable>,
}

impl Pollables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task first due one period from `now`.
    pub fn register(&mut self, kind: PollableKind, period: Duration, now: Instant) {
        self.entries.retain(|p| p.kind != kind);
        self.entries.push(Pollable {
            kind,
            period,
            next_due: now + period,
        });
    }

    /// Returns every task whose due time has passed and schedules its next run.
    pub fn take_due(&mut self, now: Instant) -> Vec<PollableKind> {
        let mut due = Vec::new();
        for pollable in &mut self.entries {
            if now >= pollable.next_due {
                due.push(pollable.kind);
                pollable.next_due = now + pollable.period;
            }
        }
        due
    }

    /// Time until the earliest task is due.
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .map(|p| p.next_due.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_once_per_period() {
        let start = Instant::now();
        let mut pollables = Pollables::new();
        pollables.register(PollableKind::Heartbeat, Duration::from_millis(10), start);
        pollables.register(PollableKind::Summary, Duration::from_millis(100), start);
        assert!(pollables.take_due(start).is_empty());
        let t = start + Duration::from_millis(10);
        assert_eq!(pollables.take_due(t), vec![PollableKind::Heartbeat]);
        assert!(pollables.take_due(t).is_empty());
        assert_eq!(
            pollables.next_due_in(t),
            Some(Duration::from_millis(10))
        );
    }
}
