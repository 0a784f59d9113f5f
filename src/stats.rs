//! Request statistics for the load harness.
//!
//! Each worker owns a plain `WorkerStatistics` and mutates it without any
//! synchronization. When the worker finishes it folds its totals into the
//! shared `AggregateStatistics` with a single atomic add per field. Merges are
//! commutative, so the order in which workers finish does not matter.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters owned by a single worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatistics {
    pub successful: u64,
    pub unsuccessful: u64,
    pub bytes_sent: u64,
    pub successful_ns: u64,
    pub unsuccessful_ns: u64,
}

impl WorkerStatistics {
    /// Record one finished request.
    ///
    /// A request counts as successful when the transport reported a non-zero
    /// byte count.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        self.bytes_sent += bytes;
        if bytes == 0 {
            self.unsuccessful += 1;
            self.unsuccessful_ns += nanos;
        } else {
            self.successful += 1;
            self.successful_ns += nanos;
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.successful + self.unsuccessful
    }
}

/// Shared totals across all workers of one run.
#[derive(Debug, Default)]
pub struct AggregateStatistics {
    successful: AtomicU64,
    unsuccessful: AtomicU64,
    bytes_sent: AtomicU64,
    successful_ns: AtomicU64,
    unsuccessful_ns: AtomicU64,
}

impl AggregateStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's totals in. Called exactly once per worker.
    pub fn merge(&self, local: &WorkerStatistics) {
        self.successful
            .fetch_add(local.successful, Ordering::Relaxed);
        self.unsuccessful
            .fetch_add(local.unsuccessful, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(local.bytes_sent, Ordering::Relaxed);
        self.successful_ns
            .fetch_add(local.successful_ns, Ordering::Relaxed);
        self.unsuccessful_ns
            .fetch_add(local.unsuccessful_ns, Ordering::Relaxed);
    }

    /// Read the current totals.
    ///
    /// Only meaningful once every worker has merged; the load harness calls
    /// this after its completion barrier.
    pub fn snapshot(&self) -> WorkerStatistics {
        WorkerStatistics {
            successful: self.successful.load(Ordering::Relaxed),
            unsuccessful: self.unsuccessful.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            successful_ns: self.successful_ns.load(Ordering::Relaxed),
            unsuccessful_ns: self.unsuccessful_ns.load(Ordering::Relaxed),
        }
    }
}

/// Final report of a load run.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub started_at: DateTime<Local>,
    pub workers: usize,
    pub totals: WorkerStatistics,
}

impl LoadReport {
    /// Successful requests per second of time spent in successful requests.
    pub fn requests_per_second(&self) -> f64 {
        per_second(self.totals.successful as f64, self.totals.successful_ns)
    }

    pub fn bytes_per_second(&self) -> f64 {
        per_second(self.totals.bytes_sent as f64, self.totals.successful_ns)
    }
}

fn per_second(amount: f64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    amount / (nanos as f64 / 1_000_000_000.0)
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Load run started {} ({} workers)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.workers
        )?;
        writeln!(f, "Successful requests: {}", self.totals.successful)?;
        writeln!(f, "Unsuccessful requests: {}", self.totals.unsuccessful)?;
        writeln!(f, "Bytes sent: {}", self.totals.bytes_sent)?;
        writeln!(
            f,
            "Time spent for successful requests: {} ns",
            self.totals.successful_ns
        )?;
        writeln!(
            f,
            "Time spent for unsuccessful requests: {} ns",
            self.totals.unsuccessful_ns
        )?;
        writeln!(f, "Requests per second: {:.1}", self.requests_per_second())?;
        write!(f, "Bytes per second: {:.1}", self.bytes_per_second())
    }
}

/// Counters maintained by the reactor thread and readable from anywhere.
#[derive(Debug, Default)]
pub struct ServerCounters {
    accepted: AtomicU64,
    closed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerCounters {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl fmt::Display for ServerCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Server:")?;
        writeln!(f, "Connections accepted: {}", self.accepted())?;
        writeln!(f, "Connections closed: {}", self.closed())?;
        writeln!(f, "Bytes received: {}", self.bytes_received())?;
        write!(f, "Bytes sent: {}", self.bytes_sent())
    }
}
