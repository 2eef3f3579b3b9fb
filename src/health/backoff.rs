use std::time::{Duration, Instant};

/// Exponential spacing for repeated self-repair attempts.
///
/// The first escalation is immediate. Each further attempt waits twice as
/// long as the previous one, capped at `max`. A healthy check resets it.
#[derive(Debug, Clone)]
pub struct EscalationBackoff {
    initial: Duration,
    max: Duration,
    next_delay: Duration,
    next_allowed: Option<Instant>,
    attempts: u32,
}

impl EscalationBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next_delay: initial,
            next_allowed: None,
            attempts: 0,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_allowed.map_or(true, |at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_allowed
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Records an attempt at `now` and returns the wait before the next one.
    pub fn record_attempt(&mut self, now: Instant) -> Duration {
        let delay = self.next_delay;
        self.next_allowed = Some(now + delay);
        self.next_delay = (delay * 2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.next_delay = self.initial;
        self.next_allowed = None;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap_and_never_gives_up() {
        let mut backoff = EscalationBackoff::new(Duration::from_secs(60), Duration::from_secs(300));
        let now = Instant::now();

        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.record_attempt(now).as_secs())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 300, 300, 300]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn gates_attempts_until_delay_elapses() {
        let mut backoff = EscalationBackoff::new(Duration::from_secs(60), Duration::from_secs(1800));
        let now = Instant::now();

        assert!(backoff.is_ready(now));
        backoff.record_attempt(now);
        assert!(!backoff.is_ready(now + Duration::from_secs(59)));
        assert_eq!(backoff.remaining(now + Duration::from_secs(59)), Duration::from_secs(1));
        assert!(backoff.is_ready(now + Duration::from_secs(60)));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = EscalationBackoff::new(Duration::from_secs(60), Duration::from_secs(1800));
        let now = Instant::now();
        backoff.record_attempt(now);
        backoff.record_attempt(now);

        backoff.reset();
        assert!(backoff.is_ready(now));
        assert_eq!(backoff.record_attempt(now), Duration::from_secs(60));
    }
}
