use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Beat by the tracking loop after every tick; stale beats mean the loop is
/// wedged or gone even though the process is still up.
#[derive(Clone)]
pub struct Heartbeat {
    origin: Instant,
    // Nanos since `origin` + 1 of the last beat; 0 means never.
    last_beat: Arc<AtomicU64>,
    max_age: Duration,
}

impl Heartbeat {
    pub fn new(max_age: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_beat: Arc::new(AtomicU64::new(0)),
            max_age,
        }
    }

    pub fn beat(&self) {
        self.beat_at(Instant::now());
    }

    pub fn beat_at(&self, at: Instant) {
        let nanos = at.saturating_duration_since(self.origin).as_nanos();
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX - 1);
        self.last_beat.store(nanos + 1, Ordering::Release);
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        match self.age_at(now) {
            Some(age) => age <= self.max_age,
            None => false,
        }
    }

    pub fn age_at(&self, now: Instant) -> Option<Duration> {
        let stored = self.last_beat.load(Ordering::Acquire);
        if stored == 0 {
            return None;
        }
        let beat = self.origin + Duration::from_nanos(stored - 1);
        Some(now.saturating_duration_since(beat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_beaten_is_stale() {
        let heartbeat = Heartbeat::new(Duration::from_secs(10));
        assert!(!heartbeat.is_fresh());
        assert_eq!(heartbeat.age_at(Instant::now()), None);
    }

    #[test]
    fn freshness_expires_after_max_age() {
        let heartbeat = Heartbeat::new(Duration::from_secs(10));
        let now = Instant::now();
        heartbeat.beat_at(now);

        assert!(heartbeat.is_fresh_at(now + Duration::from_secs(10)));
        assert!(!heartbeat.is_fresh_at(now + Duration::from_secs(11)));

        let clone = heartbeat.clone();
        clone.beat_at(now + Duration::from_secs(11));
        assert!(heartbeat.is_fresh_at(now + Duration::from_secs(12)));
    }

    #[test]
    fn sub_millisecond_beat_keeps_full_window() {
        let heartbeat = Heartbeat::new(Duration::from_secs(1));
        let beat = Instant::now() + Duration::from_micros(1_700);
        heartbeat.beat_at(beat);

        assert_eq!(heartbeat.age_at(beat), Some(Duration::ZERO));
        assert!(heartbeat.is_fresh_at(beat + Duration::from_secs(1)));
        assert!(!heartbeat.is_fresh_at(beat + Duration::from_secs(1) + Duration::from_nanos(1)));
    }
}
