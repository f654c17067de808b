use std::time::Duration;

use tokio::time::Instant;

/// What a wake-up did to the schedule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WakeDecision {
    /// Too soon after the previous wake-up, or the next run is already close.
    Ignored,
    /// The next run was pulled in to `min_interval` from now.
    Rescheduled,
    /// The next run is overdue and should start now.
    RunNow,
}

/// A periodic schedule that can be woken early, but never runs more often
/// than once per `min_interval` because of wake-ups.
#[derive(Debug)]
pub(crate) struct InterruptibleInterval {
    interval: Duration,
    min_interval: Duration,
    last_call: Option<Instant>,
    last_wake: Option<Instant>,
    next_due: Option<Instant>,
}

impl InterruptibleInterval {
    pub(crate) fn new(interval: Duration, min_interval: Duration) -> Self {
        Self {
            interval,
            min_interval,
            last_call: None,
            last_wake: None,
            next_due: None,
        }
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Forgets the call history and schedules the next run one full interval out.
    /// An interval too large to represent leaves nothing scheduled.
    pub(crate) fn restart(&mut self, now: Instant) {
        self.last_call = None;
        self.last_wake = None;
        self.next_due = now.checked_add(self.interval);
    }

    pub(crate) fn schedule_now(&mut self, now: Instant) {
        self.next_due = Some(now);
    }

    pub(crate) fn schedule_after_interval(&mut self, now: Instant) {
        self.next_due = now.checked_add(self.interval);
    }

    /// Records that a run started. Nothing is scheduled until the run finishes.
    pub(crate) fn mark_called(&mut self, now: Instant) {
        self.last_call = Some(now);
        self.next_due = None;
    }

    pub(crate) fn stop(&mut self) {
        self.next_due = None;
    }

    pub(crate) fn wake(&mut self, now: Instant) -> WakeDecision {
        let since_last_wake = self.last_wake.map(|w| now.saturating_duration_since(w));
        self.last_wake = Some(now);

        if matches!(since_last_wake, Some(since) if since < self.min_interval) {
            return WakeDecision::Ignored;
        }

        // None when the next call is overdue or nothing has run yet.
        let until_next_call = self.last_call.and_then(|called| {
            match called.checked_add(self.interval) {
                Some(due) => due.checked_duration_since(now),
                None => Some(Duration::MAX),
            }
        });

        match until_next_call {
            Some(remaining) if remaining > self.min_interval => {
                self.next_due = now.checked_add(self.min_interval);
                WakeDecision::Rescheduled
            }
            Some(_) => WakeDecision::Ignored,
            None => {
                self.next_due = Some(now);
                WakeDecision::RunNow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{InterruptibleInterval, WakeDecision};

    const INTERVAL: Duration = Duration::from_millis(10_000);
    const MIN_INTERVAL: Duration = Duration::from_millis(500);

    fn after_a_call(start: Instant) -> InterruptibleInterval {
        let mut interval = InterruptibleInterval::new(INTERVAL, MIN_INTERVAL);
        interval.mark_called(start);
        interval.schedule_after_interval(start + Duration::from_millis(20));
        interval
    }

    #[test]
    fn wake_long_before_next_call_reschedules_at_min_interval() {
        let start = Instant::now();
        let mut interval = after_a_call(start);
        let now = start + Duration::from_millis(1_000);

        assert_eq!(interval.wake(now), WakeDecision::Rescheduled);
        assert_eq!(interval.next_due(), Some(now + MIN_INTERVAL));
    }

    #[test]
    fn wakes_within_min_interval_are_debounced() {
        let start = Instant::now();
        let mut interval = after_a_call(start);
        let first = start + Duration::from_millis(1_000);
        interval.wake(first);

        let decision = interval.wake(first + Duration::from_millis(100));

        assert_eq!(decision, WakeDecision::Ignored);
        assert_eq!(interval.next_due(), Some(first + MIN_INTERVAL));
    }

    #[test]
    fn wake_close_to_next_call_leaves_schedule_alone() {
        let start = Instant::now();
        let mut interval = after_a_call(start);
        let scheduled = interval.next_due();

        let decision = interval.wake(start + Duration::from_millis(9_700));

        assert_eq!(decision, WakeDecision::Ignored);
        assert_eq!(interval.next_due(), scheduled);
    }

    #[test]
    fn wake_when_overdue_runs_now() {
        let start = Instant::now();
        let mut interval = after_a_call(start);
        let now = start + Duration::from_millis(12_000);

        assert_eq!(interval.wake(now), WakeDecision::RunNow);
        assert_eq!(interval.next_due(), Some(now));
    }

    #[test]
    fn wake_after_restart_runs_now() {
        let start = Instant::now();
        let mut interval = after_a_call(start);
        interval.restart(start + Duration::from_millis(100));

        assert_eq!(
            interval.wake(start + Duration::from_millis(200)),
            WakeDecision::RunNow
        );
    }

    #[test]
    fn unrepresentable_interval_never_comes_due_but_can_be_woken() {
        let start = Instant::now();
        let mut interval = InterruptibleInterval::new(Duration::MAX, MIN_INTERVAL);

        interval.restart(start);
        assert_eq!(interval.next_due(), None);

        interval.mark_called(start);
        interval.schedule_after_interval(start);
        assert_eq!(interval.next_due(), None);

        let now = start + Duration::from_millis(1_000);
        assert_eq!(interval.wake(now), WakeDecision::Rescheduled);
        assert_eq!(interval.next_due(), Some(now + MIN_INTERVAL));
    }
}
