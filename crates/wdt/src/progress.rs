/// Progress reporting for sender sessions.
///
/// A ticker thread samples the session's atomic counters every
/// `progress_report_interval_millis` and hands a snapshot to the reporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::report::{ProgressCounters, TransferReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub blocks_done: u64,
    pub blocks_total: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn from_counters(counters: &ProgressCounters, elapsed: Duration) -> Self {
        ProgressSnapshot {
            bytes_done: counters.bytes_done.load(Ordering::Relaxed),
            bytes_total: counters.bytes_total.load(Ordering::Relaxed),
            blocks_done: counters.blocks_done.load(Ordering::Relaxed),
            blocks_total: counters.blocks_total.load(Ordering::Relaxed),
            elapsed,
        }
    }

    /// Percent complete, 0 - 100.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 * 100.0 / self.bytes_total as f64).min(100.0)
    }

    /// Current data rate in MiB/s.
    pub fn mbytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / (1024.0 * 1024.0) / secs
    }
}

pub trait ProgressReporter: Send + Sync {
    fn start(&self) {}
    fn progress(&self, snapshot: &ProgressSnapshot);
    fn end(&self, _report: &TransferReport) {}
}

/// Reporter that logs through `tracing`.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn start(&self) {
        tracing::info!("transfer started");
    }

    fn progress(&self, snapshot: &ProgressSnapshot) {
        tracing::info!(
            bytes = snapshot.bytes_done,
            total = snapshot.bytes_total,
            blocks = snapshot.blocks_done,
            "progress {:.1}% {:.2} MiB/s",
            snapshot.percent(),
            snapshot.mbytes_per_sec(),
        );
    }

    fn end(&self, report: &TransferReport) {
        tracing::info!("transfer finished: {}", report);
    }
}

/// Running ticker. `stop()` ends it and waits for the thread.
pub(crate) struct ProgressTicker {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub(crate) fn spawn(
        reporter: Arc<dyn ProgressReporter>,
        counters: Arc<ProgressCounters>,
        interval: Duration,
        started: Instant,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = std::thread::spawn(move || {
            // Short sleeps so stop() never waits a full interval.
            let step = interval.min(Duration::from_millis(10));
            let mut next = Instant::now() + interval;
            while !flag.load(Ordering::Acquire) {
                std::thread::sleep(step);
                if Instant::now() >= next {
                    reporter.progress(&ProgressSnapshot::from_counters(&counters, started.elapsed()));
                    next += interval;
                }
            }
            reporter.progress(&ProgressSnapshot::from_counters(&counters, started.elapsed()));
        });
        ProgressTicker {
            done,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<ProgressSnapshot>>);

    impl ProgressReporter for Recording {
        fn progress(&self, snapshot: &ProgressSnapshot) {
            self.0.lock().push(*snapshot);
        }
    }

    #[test]
    fn percent_and_rate() {
        let s = ProgressSnapshot {
            bytes_done: 512 * 1024,
            bytes_total: 1024 * 1024,
            blocks_done: 1,
            blocks_total: 2,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(s.percent(), 50.0);
        assert!((s.mbytes_per_sec() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ticker_reports_until_stopped() {
        let reporter = Arc::new(Recording::default());
        let counters = Arc::new(ProgressCounters::default());
        counters.set_total(100, 1);
        let mut ticker = ProgressTicker::spawn(
            reporter.clone(),
            counters.clone(),
            Duration::from_millis(10),
            Instant::now(),
        );
        std::thread::sleep(Duration::from_millis(50));
        counters.add_bytes(100);
        ticker.stop();

        let seen = reporter.0.lock();
        assert!(seen.len() >= 2);
        let last = seen.last().unwrap();
        assert_eq!(last.bytes_done, 100);
        assert_eq!(last.percent(), 100.0);
    }
}
