/// Transfer statistics and the terminal report.
///
/// `TransferStats` is accumulated by one connection worker. A session merges
/// its workers' stats into a `TransferReport` once, in `finish()`, and hands
/// out the same `Arc<TransferReport>` from then on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ErrorCode;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Receiver port this connection used, `None` for a summary.
    pub port: Option<u16>,
    pub data_bytes: u64,
    pub header_bytes: u64,
    pub blocks: u64,
    /// Files whose first block went through this connection.
    pub files: u64,
    pub error_code: ErrorCode,
}

impl TransferStats {
    pub fn for_port(port: u16) -> Self {
        TransferStats {
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn failed(port: u16, code: ErrorCode) -> Self {
        TransferStats {
            port: Some(port),
            error_code: code,
            ..Default::default()
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.data_bytes + self.header_bytes
    }

    /// Record a failure. A connection keeps its worst outcome.
    pub fn set_error(&mut self, code: ErrorCode) {
        self.error_code = self.error_code.worst(code);
    }

    /// Add `other`'s counters and fold its error code in.
    pub fn merge(&mut self, other: &TransferStats) {
        self.data_bytes += other.data_bytes;
        self.header_bytes += other.header_bytes;
        self.blocks += other.blocks;
        self.files += other.files;
        self.error_code = self.error_code.worst(other.error_code);
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(port) = self.port {
            write!(f, "port={} ", port)?;
        }
        write!(
            f,
            "status={} files={} blocks={} data_bytes={} header_bytes={}",
            self.error_code, self.files, self.blocks, self.data_bytes, self.header_bytes
        )
    }
}

/// Terminal outcome of one session. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    summary: TransferStats,
    connections: Vec<TransferStats>,
    elapsed: Duration,
    /// Files the sender enumerated, when known.
    total_files: Option<u64>,
}

impl TransferReport {
    /// Merge per-connection stats. `session_code` is folded into the summary
    /// on top of the connections' codes, for failures that belong to the
    /// session rather than to a connection.
    pub fn new(
        connections: Vec<TransferStats>,
        session_code: ErrorCode,
        elapsed: Duration,
        total_files: Option<u64>,
    ) -> Self {
        let mut summary = TransferStats::default();
        for stats in &connections {
            summary.merge(stats);
        }
        summary.set_error(session_code);
        TransferReport {
            summary,
            connections,
            elapsed,
            total_files,
        }
    }

    pub fn summary(&self) -> &TransferStats {
        &self.summary
    }

    pub fn error_code(&self) -> ErrorCode {
        self.summary.error_code
    }

    pub fn connection_stats(&self) -> &[TransferStats] {
        &self.connections
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn total_files(&self) -> Option<u64> {
        self.total_files
    }

    /// Data throughput in MiB/s.
    pub fn throughput_mbytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.summary.data_bytes as f64 / MIB / secs
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connections={} elapsed={:.3}s throughput={:.2}MiB/s",
            self.summary,
            self.connections.len(),
            self.elapsed.as_secs_f64(),
            self.throughput_mbytes_per_sec()
        )
    }
}

/// Live counters updated by connection workers, read by progress reporting.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    pub blocks_done: AtomicU64,
    pub blocks_total: AtomicU64,
}

impl ProgressCounters {
    pub fn set_total(&self, bytes: u64, blocks: u64) {
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.blocks_total.store(blocks, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn block_done(&self) {
        self.blocks_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Progress as a fraction 0.0 - 1.0.
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.bytes_done.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_totals_and_worst_error() {
        let mut a = TransferStats::for_port(1);
        a.data_bytes = 100;
        a.header_bytes = 10;
        a.blocks = 2;
        a.files = 1;
        let mut b = TransferStats::for_port(2);
        b.data_bytes = 50;
        b.blocks = 1;
        b.set_error(ErrorCode::SocketReadError);
        let report = TransferReport::new(vec![a, b], ErrorCode::Ok, Duration::from_secs(1), Some(1));

        let s = report.summary();
        assert_eq!(s.port, None);
        assert_eq!(s.data_bytes, 150);
        assert_eq!(s.total_bytes(), 160);
        assert_eq!(s.blocks, 3);
        assert_eq!(s.files, 1);
        assert_eq!(report.error_code(), ErrorCode::SocketReadError);
        assert_eq!(report.connection_stats().len(), 2);
    }

    #[test]
    fn session_code_wins_when_worse() {
        let report = TransferReport::new(
            vec![TransferStats::for_port(9)],
            ErrorCode::ConnError,
            Duration::ZERO,
            None,
        );
        assert_eq!(report.error_code(), ErrorCode::ConnError);
        assert_eq!(report.throughput_mbytes_per_sec(), 0.0);
    }

    #[test]
    fn empty_report_is_ok() {
        let report = TransferReport::new(Vec::new(), ErrorCode::Ok, Duration::ZERO, None);
        assert!(report.error_code().is_ok());
    }

    #[test]
    fn throughput_in_mib() {
        let mut s = TransferStats::for_port(1);
        s.data_bytes = 10 * 1024 * 1024;
        let report = TransferReport::new(vec![s], ErrorCode::Ok, Duration::from_secs(2), None);
        assert!((report.throughput_mbytes_per_sec() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn progress_fraction_clamped() {
        let p = ProgressCounters::default();
        assert_eq!(p.fraction(), 0.0);
        p.set_total(100, 1);
        p.add_bytes(50);
        assert_eq!(p.fraction(), 0.5);
        p.add_bytes(80);
        assert_eq!(p.fraction(), 1.0);
    }
}
