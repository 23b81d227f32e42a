use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Fixed-interval tick counter feeding an exponentially weighted moving
/// average. Events land in the current bucket via an atomic; at each bucket
/// boundary the bucket folds into the rate as
/// `rate' = alpha * bucket + (1 - alpha) * rate`. The first completed bucket
/// seeds the average directly.
pub struct RateMeter {
    interval: Duration,
    alpha: f64,
    count: AtomicU64,
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    bucket_start: Instant,
    rate: f64,
    primed: bool,
}

impl RateMeter {
    pub fn new(interval: Duration, alpha: f64) -> Self {
        Self {
            interval,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            count: AtomicU64::new(0),
            inner: Mutex::new(MeterInner {
                bucket_start: Instant::now(),
                rate: 0.0,
                primed: false,
            }),
        }
    }

    pub fn increment(&self) {
        self.fold_elapsed_buckets();
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Smoothed events-per-interval. Folds any buckets that have elapsed
    /// since the last observation, so idle periods decay the rate.
    pub fn rate(&self) -> f64 {
        self.fold_elapsed_buckets();
        self.inner.lock().rate
    }

    fn fold_elapsed_buckets(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        while now.duration_since(inner.bucket_start) >= self.interval {
            let bucket = self.count.swap(0, Ordering::Relaxed) as f64;
            if inner.primed {
                inner.rate = self.alpha * bucket + (1.0 - self.alpha) * inner.rate;
            } else {
                inner.rate = bucket;
                inner.primed = true;
            }
            inner.bucket_start += self.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn completed_bucket_becomes_the_rate() {
        let meter = RateMeter::new(Duration::from_millis(50), 1.0);
        for _ in 0..4 {
            meter.increment();
        }

        thread::sleep(Duration::from_millis(60));
        assert_eq!(meter.rate(), 4.0);
    }

    #[test]
    fn smoothing_blends_old_and_new_buckets() {
        let meter = RateMeter::new(Duration::from_millis(50), 0.5);
        for _ in 0..8 {
            meter.increment();
        }
        thread::sleep(Duration::from_millis(60));
        assert_eq!(meter.rate(), 8.0);

        for _ in 0..4 {
            meter.increment();
        }
        thread::sleep(Duration::from_millis(60));

        // 0.5 * 4 + 0.5 * 8, possibly decayed by one extra empty bucket.
        let rate = meter.rate();
        assert!(rate <= 6.0 + f64::EPSILON, "rate was {rate}");
        assert!(rate >= 2.9, "rate was {rate}");
    }

    #[test]
    fn idle_buckets_decay_the_rate() {
        let meter = RateMeter::new(Duration::from_millis(20), 0.5);
        for _ in 0..6 {
            meter.increment();
        }
        thread::sleep(Duration::from_millis(30));
        let primed = meter.rate();

        thread::sleep(Duration::from_millis(60));
        assert!(meter.rate() < primed);
    }
}
