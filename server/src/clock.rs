//! Fixed-period tick clocks
//!
//! A clock numbers the periods elapsed since it started. Polling it reports
//! each new tick once; periods that went by unpolled are reported as skipped
//! and never replayed.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvent {
    pub tick: u32,
    /// Ticks that elapsed since the previous event without being polled
    pub skipped: u32,
}

#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
    period: Duration,
    last: Option<u32>,
}

impl TickClock {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period: period.max(Duration::from_micros(1)),
            last: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Tick number in effect at `now`
    pub fn tick_at(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.start);
        (elapsed.as_nanos() / self.period.as_nanos()).min(u32::MAX as u128) as u32
    }

    /// Last tick returned by [`poll`](Self::poll)
    pub fn current(&self) -> Option<u32> {
        self.last
    }

    /// When the tick after the one in effect at `now` starts
    pub fn next_deadline(&self, now: Instant) -> Instant {
        self.start + self.period * self.tick_at(now).saturating_add(1)
    }

    pub fn until_next(&self, now: Instant) -> Duration {
        self.next_deadline(now).saturating_duration_since(now)
    }

    /// Reports the tick in effect at `now` if it was not reported yet
    pub fn poll(&mut self, now: Instant) -> Option<TickEvent> {
        let tick = self.tick_at(now);
        let skipped = match self.last {
            Some(last) if tick <= last => return None,
            Some(last) => tick - last - 1,
            None => 0,
        };
        self.last = Some(tick);
        Some(TickEvent { tick, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_tick_at() {
        let start = Instant::now();
        let clock = TickClock::new(start, ms(50));
        assert_eq!(clock.tick_at(start), 0);
        assert_eq!(clock.tick_at(start + ms(49)), 0);
        assert_eq!(clock.tick_at(start + ms(50)), 1);
        assert_eq!(clock.tick_at(start + ms(1000)), 20);
    }

    #[test]
    fn test_poll_reports_each_tick_once() {
        let start = Instant::now();
        let mut clock = TickClock::new(start, ms(10));

        assert_eq!(clock.poll(start), Some(TickEvent { tick: 0, skipped: 0 }));
        assert_eq!(clock.poll(start + ms(5)), None);
        assert_eq!(clock.poll(start + ms(10)), Some(TickEvent { tick: 1, skipped: 0 }));
        assert_eq!(clock.current(), Some(1));
    }

    #[test]
    fn test_missed_ticks_are_skipped() {
        let start = Instant::now();
        let mut clock = TickClock::new(start, ms(10));
        clock.poll(start);

        assert_eq!(clock.poll(start + ms(45)), Some(TickEvent { tick: 4, skipped: 3 }));
        assert_eq!(clock.poll(start + ms(49)), None);
    }

    #[test]
    fn test_until_next() {
        let start = Instant::now();
        let clock = TickClock::new(start, ms(10));
        assert_eq!(clock.until_next(start + ms(3)), ms(7));
        assert_eq!(clock.next_deadline(start + ms(10)), start + ms(20));
    }
}
