use std::time::{Duration, Instant};

/// Gates periodic work to at most once per interval.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_fired: Instant,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_fired: Instant::now() }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.interval {
            self.last_fired = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_interval() {
        let mut r = Repeater::every(Duration::from_millis(20));
        assert!(!r.fired());
        std::thread::sleep(Duration::from_millis(25));
        assert!(r.fired());
        // Just fired: gated again until the interval passes.
        assert!(!r.fired());
    }

    #[test]
    fn zero_interval_always_fires() {
        let mut r = Repeater::every(Duration::ZERO);
        assert!(r.fired());
        assert!(r.fired());
    }
}
