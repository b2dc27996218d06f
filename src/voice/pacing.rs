//! Playout pacing
//!
//! Tracks the instant the next frame write is due. After each completed write
//! the deadline becomes the completion instant plus one nominal frame
//! duration, so write latency is added to the period rather than assumed
//! zero. When the deadline has already passed the pacer resynchronises to
//! the current instant rather than trying to make up the lost time.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Pacer {
    next: Instant,
    resyncs: u64,
}

impl Pacer {
    /// First write is due at `start`
    pub fn new(start: Instant) -> Self {
        Self {
            next: start,
            resyncs: 0,
        }
    }

    pub fn scheduled_next(&self) -> Instant {
        self.next
    }

    /// How long to sleep before the next write.
    ///
    /// Returns zero, and pulls the deadline up to `now`, if it already passed.
    pub fn delay_until_next(&mut self, now: Instant) -> Duration {
        if self.next > now {
            return self.next - now;
        }
        if self.next < now {
            self.resyncs += 1;
        }
        self.next = now;
        Duration::ZERO
    }

    /// A frame of `duration` finished writing at `written_at`
    pub fn schedule_from(&mut self, written_at: Instant, duration: Duration) {
        self.next = written_at + duration;
    }

    /// After an underrun, hold the next write back by a fresh warm-up period
    pub fn restart_after(&mut self, now: Instant, warmup: Duration) {
        self.next = now + warmup;
    }

    /// Times the deadline had slipped into the past
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(20);

    #[test]
    fn test_write_latency_extends_period() {
        let mut now = Instant::now();
        let mut pacer = Pacer::new(now);

        // first write is due immediately
        assert_eq!(pacer.delay_until_next(now), Duration::ZERO);

        let mut starts = vec![now];
        for _ in 0..5 {
            now += Duration::from_millis(8); // write latency
            pacer.schedule_from(now, FRAME);
            let sleep = pacer.delay_until_next(now);
            assert_eq!(sleep, FRAME);
            now += sleep;
            starts.push(now);
        }

        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(28));
        }
        assert_eq!(pacer.resyncs(), 0);
    }

    #[test]
    fn test_slow_writes_keep_a_steady_period() {
        let mut now = Instant::now();
        let mut pacer = Pacer::new(now);
        let mut periods = Vec::new();

        // 10 writes that each take longer than a frame
        for _ in 0..10 {
            let start = now;
            now += Duration::from_millis(30);
            pacer.schedule_from(now, FRAME);
            now += pacer.delay_until_next(now);
            periods.push(now - start);
        }

        // the deadline is always ahead of the clock by one frame, never behind
        assert!(periods.iter().all(|p| *p == Duration::from_millis(50)), "{:?}", periods);
        assert_eq!(pacer.resyncs(), 0);
    }

    #[test]
    fn test_missed_deadline_resyncs_without_catch_up() {
        let start = Instant::now();
        let mut pacer = Pacer::new(start);
        pacer.schedule_from(start, FRAME);

        // the scheduler was held up well past the deadline
        let late = start + Duration::from_millis(75);
        assert_eq!(pacer.delay_until_next(late), Duration::ZERO);
        assert_eq!(pacer.scheduled_next(), late);
        assert_eq!(pacer.resyncs(), 1);

        // the following frame is paced from the late write, not the old grid
        pacer.schedule_from(late + Duration::from_millis(1), FRAME);
        assert_eq!(pacer.delay_until_next(late + Duration::from_millis(1)), FRAME);
        assert_eq!(pacer.resyncs(), 1);
    }

    #[test]
    fn test_restart_after_underrun() {
        let now = Instant::now();
        let mut pacer = Pacer::new(now);

        pacer.restart_after(now, Duration::from_millis(40));
        assert_eq!(pacer.delay_until_next(now), Duration::from_millis(40));
        assert_eq!(
            pacer.delay_until_next(now + Duration::from_millis(25)),
            Duration::from_millis(15)
        );
    }
}
