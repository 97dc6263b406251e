use std::time::{Duration, Instant};

use rand::Rng;

/// Reconnect delays: a few quick retries, then exponential growth up to a
/// cap. Both counters restart once the rolling window has passed.
#[derive(Debug, Clone)]
pub struct FastBackoffOptions {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_duration: Duration,
    pub fast_retry_count: u32,
    pub fast_retry_delay: Duration,
    pub fast_retry_jitter: f64,
    pub fast_retry_window: Duration,
}

impl Default for FastBackoffOptions {
    fn default() -> Self {
        FastBackoffOptions {
            duration: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max_duration: Duration::from_secs(20),
            fast_retry_count: 3,
            fast_retry_delay: Duration::from_secs(1),
            fast_retry_jitter: 0.1,
            fast_retry_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct FastBackoff {
    opts: FastBackoffOptions,
    window_start: Option<Instant>,
    fast_retries: u32,
    delay: Duration,
}

fn jittered(d: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return d;
    }
    let secs = d.as_secs_f64();
    let delta = secs * factor;
    let secs = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
    Duration::from_secs_f64(secs.max(0.0))
}

impl FastBackoff {
    pub fn new(opts: FastBackoffOptions) -> Self {
        let delay = opts.duration;
        FastBackoff {
            opts,
            window_start: None,
            fast_retries: 0,
            delay,
        }
    }

    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let expired = self
            .window_start
            .map_or(true, |start| now.duration_since(start) > self.opts.fast_retry_window);
        if expired {
            self.window_start = Some(now);
            self.fast_retries = 0;
            self.delay = self.opts.duration;
        }

        if self.fast_retries < self.opts.fast_retry_count {
            self.fast_retries += 1;
            return jittered(self.opts.fast_retry_delay, self.opts.fast_retry_jitter)
                .min(self.opts.max_duration);
        }

        let delay = self.delay;
        self.delay = self.delay.mul_f64(self.opts.factor).min(self.opts.max_duration);
        jittered(delay, self.opts.jitter).min(self.opts.max_duration)
    }
}

impl Default for FastBackoff {
    fn default() -> Self {
        FastBackoff::new(FastBackoffOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(d: Duration, center: f64, jitter: f64) -> bool {
        let secs = d.as_secs_f64();
        secs >= center * (1.0 - jitter) - 1e-9 && secs <= center * (1.0 + jitter) + 1e-9
    }

    #[test]
    fn first_three_retries_are_fast() {
        let mut backoff = FastBackoff::default();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(within(backoff.next_delay(now), 1.0, 0.1));
        }
        assert!(within(backoff.next_delay(now), 1.0, 0.1));
        assert!(within(backoff.next_delay(now), 2.0, 0.1));
        assert!(within(backoff.next_delay(now), 4.0, 0.1));
    }

    #[test]
    fn never_exceeds_cap() {
        let mut backoff = FastBackoff::default();
        let now = Instant::now();
        for _ in 0..50 {
            assert!(backoff.next_delay(now) <= Duration::from_secs(20));
        }
    }

    #[test]
    fn resets_after_window() {
        let mut backoff = FastBackoff::default();
        let start = Instant::now();
        for _ in 0..10 {
            backoff.next_delay(start);
        }
        assert!(backoff.next_delay(start) > Duration::from_secs(10));

        let later = start + Duration::from_secs(61);
        assert!(within(backoff.next_delay(later), 1.0, 0.1));
        for _ in 0..2 {
            backoff.next_delay(later);
        }
        assert!(within(backoff.next_delay(later), 1.0, 0.1));
    }
}
