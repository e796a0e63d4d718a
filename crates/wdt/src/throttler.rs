/// Aggregate bandwidth cap shared by all connections of a session.
///
/// Token bucket refilled at the average rate and capped at the burst size
/// (peak rate × window). `reserve` always takes its tokens immediately, going
/// into debt when the bucket is short, and then sleeps until the debt is paid
/// back. Callers queue behind each other through the debt, so a worker that
/// just reserved cannot jump ahead of one that is already waiting.
///
/// Callers should reserve at most `slice_bytes()` at a time. A slice costs
/// `SLICE` of the average rate, so with N connections a single wait stays
/// near N × `SLICE` however low the rate is, well inside socket timeouts.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::options::WdtOptions;

/// Smallest burst the bucket allows, so tiny windows still make progress.
const MIN_BUCKET_BYTES: f64 = 64.0 * 1024.0;

/// Time worth of traffic one reservation should cover.
const SLICE: Duration = Duration::from_millis(50);

/// Floor for `slice_bytes`, so very low rates do not degrade into tiny writes.
const MIN_SLICE_BYTES: usize = 512;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    bytes_reserved: u64,
    time_slept: Duration,
}

#[derive(Debug)]
pub struct Throttler {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl Throttler {
    /// `rate` and `peak_rate` in bytes/sec; burst capacity is
    /// `peak_rate × window`.
    pub fn new(rate: f64, peak_rate: f64, window: Duration) -> Self {
        let capacity = (peak_rate.max(rate) * window.as_secs_f64()).max(MIN_BUCKET_BYTES);
        Throttler {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                bytes_reserved: 0,
                time_slept: Duration::ZERO,
            }),
        }
    }

    /// Build from options. `None` when no average rate is configured.
    pub fn from_options(opts: &WdtOptions) -> Option<Self> {
        let rate = opts.avg_rate_bytes()?;
        let peak = opts.peak_rate_bytes().unwrap_or(rate);
        Some(Throttler::new(rate, peak, opts.throttler_window()))
    }

    pub fn rate_bytes_per_sec(&self) -> f64 {
        self.rate
    }

    pub fn capacity_bytes(&self) -> f64 {
        self.capacity
    }

    /// Largest amount a caller should reserve in one go.
    pub fn slice_bytes(&self) -> usize {
        let slice = (self.rate * SLICE.as_secs_f64()).min(self.capacity) as usize;
        slice.max(MIN_SLICE_BYTES)
    }

    /// Block the caller until sending `n` bytes keeps the aggregate rate
    /// within the cap.
    pub fn reserve(&self, n: u64) {
        let wait = self.claim(n);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }

    /// Take `n` bytes from the bucket and return how long the caller must
    /// sleep before sending them. Lets the caller flush pending output
    /// before it waits.
    pub fn claim(&self, n: u64) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        bucket.tokens -= n as f64;
        bucket.bytes_reserved += n;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            let wait = Duration::from_secs_f64(-bucket.tokens / self.rate);
            bucket.time_slept += wait;
            wait
        }
    }

    /// Total bytes reserved and total time callers were told to sleep.
    pub fn stats(&self) -> (u64, Duration) {
        let bucket = self.bucket.lock();
        (bucket.bytes_reserved, bucket.time_slept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn disabled_without_average_rate() {
        assert!(Throttler::from_options(&WdtOptions::default()).is_none());
        let opts = WdtOptions {
            avg_mbytes_per_sec: 2.0,
            ..Default::default()
        };
        let t = Throttler::from_options(&opts).unwrap();
        assert_eq!(t.rate_bytes_per_sec(), 2.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn burst_within_capacity_does_not_wait() {
        let t = Throttler::new(1_000_000.0, 1_000_000.0, Duration::from_millis(500));
        let start = Instant::now();
        t.reserve(100_000);
        t.reserve(100_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn holds_average_rate_across_threads() {
        // 1 MB/s with a 100 KB bucket; 4 threads × 100 KB beyond the bucket
        // must take at least ~0.4s.
        let rate = 1_000_000.0;
        let t = Arc::new(Throttler::new(rate, rate, Duration::from_millis(100)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        t.reserve(25_000);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        t.reserve(100_000);
        let elapsed = start.elapsed().as_secs_f64();
        let total = 4.0 * 5.0 * 25_000.0 + 100_000.0;
        let expected = (total - t.capacity_bytes()) / rate;
        assert!(elapsed >= expected * 0.95, "elapsed {elapsed} < {expected}");
        assert_eq!(t.stats().0, total as u64);
    }

    #[test]
    fn slices_keep_single_waits_short() {
        // 30 KB/s: a 256 KiB write reserved in one piece would owe ~6s.
        let t = Throttler::new(30_000.0, 30_000.0, Duration::from_millis(100));
        assert_eq!(t.slice_bytes(), 1_500);
        assert_eq!(t.claim(t.capacity_bytes() as u64), Duration::ZERO);
        let wait = t.claim(t.slice_bytes() as u64);
        assert!(wait <= Duration::from_millis(60), "{wait:?}");

        let fast = Throttler::new(1e9, 1e9, Duration::from_millis(1));
        assert_eq!(fast.slice_bytes() as f64, fast.capacity_bytes());
        let slow = Throttler::new(100.0, 100.0, Duration::from_millis(1));
        assert_eq!(slow.slice_bytes(), MIN_SLICE_BYTES);
    }

    #[test]
    fn capacity_follows_peak_rate() {
        let t = Throttler::new(1_000_000.0, 4_000_000.0, Duration::from_millis(500));
        assert_eq!(t.capacity_bytes(), 2_000_000.0);
        let t = Throttler::new(1_000_000.0, 0.0, Duration::from_millis(1));
        assert_eq!(t.capacity_bytes(), MIN_BUCKET_BYTES);
    }
}
