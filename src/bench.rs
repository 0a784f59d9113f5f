//! Latency and throughput trials over a reader/writer channel pair.
//!
//! A latency trial writes one packet, reads it back through the reader and
//! times both halves separately. A throughput trial writes a batch of packets,
//! then reads the whole batch, and reports bytes moved per unit of time.
//! Both endpoints are cleared after every latency trial and after every
//! throughput repetition so trials never see each other's bytes.

use crate::channel::{Channel, Role};
use crate::error::{Error, Result};
use crate::load::random_bytes;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialKind {
    Latency,
    Throughput,
}

/// One cell of the benchmark matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trial {
    pub kind: TrialKind,
    pub packet_size: usize,
    /// Packets per repetition. Always 1 for latency trials.
    pub packet_amount: usize,
    pub repetitions: usize,
}

impl Trial {
    pub fn latency(packet_size: usize, repetitions: usize) -> Self {
        Self {
            kind: TrialKind::Latency,
            packet_size,
            packet_amount: 1,
            repetitions,
        }
    }

    pub fn throughput(packet_size: usize, packet_amount: usize, repetitions: usize) -> Self {
        Self {
            kind: TrialKind::Throughput,
            packet_size,
            packet_amount,
            repetitions,
        }
    }

    /// Latency trials twice, then throughput trials by batch shape and size.
    pub fn default_matrix() -> Vec<Trial> {
        let mut trials = Vec::new();
        for _ in 0..2 {
            for (size, repetitions) in [(10, 1000), (100, 100), (1000, 10)] {
                trials.push(Trial::latency(size, repetitions));
            }
        }
        for (amount, repetitions) in [(1, 10), (1, 100), (100, 100)] {
            for size in [1024, 4096, 20480, 102400] {
                trials.push(Trial::throughput(size, amount, repetitions));
            }
        }
        trials
    }

    /// Total payload bytes the trial moves.
    pub fn bytes_transferred(&self) -> u64 {
        (self.packet_size * self.packet_amount * self.repetitions) as u64
    }

    /// Bytes written between two clears of the channel.
    fn bytes_between_clears(&self) -> u64 {
        match self.kind {
            TrialKind::Latency => (self.packet_size * self.repetitions) as u64,
            TrialKind::Throughput => (self.packet_size * self.packet_amount) as u64,
        }
    }

    /// Most bytes written before the reader consumes any of them.
    fn unread_peak(&self) -> u64 {
        (self.packet_size * self.packet_amount) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    pub packet_size: usize,
    pub repetitions: usize,
    pub mean_write_ns: f64,
    pub mean_read_ns: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputReport {
    pub packet_size: usize,
    pub packet_amount: usize,
    pub repetitions: usize,
    pub bytes: u64,
    /// Summed time of the write batches.
    pub write_ns: u64,
    /// Summed time of the read batches.
    pub read_ns: u64,
    /// MB/s
    pub write_rate: f64,
    /// MB/s
    pub read_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialReport {
    Latency(LatencyReport),
    Throughput(ThroughputReport),
}

impl fmt::Display for TrialReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialReport::Latency(r) => {
                writeln!(f, "Latency test: packet size = {}", r.packet_size)?;
                writeln!(f, "Average write latency: {:.1} ns", r.mean_write_ns)?;
                write!(f, "Average read latency: {:.1} ns", r.mean_read_ns)
            }
            TrialReport::Throughput(r) => {
                writeln!(
                    f,
                    "Throughput test: packet size = {}, packet amount = {}",
                    r.packet_size, r.packet_amount
                )?;
                writeln!(f, "Write throughput (MB/s): {:.3}", r.write_rate)?;
                write!(f, "Read throughput (MB/s): {:.3}", r.read_rate)
            }
        }
    }
}

/// Bytes per nanosecond scaled by 1000, i.e. MB/s. Zero when no time elapsed.
pub fn transfer_rate(bytes: u64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    bytes as f64 * 1000.0 / nanos as f64
}

/// Runs trials against one reader/writer pair.
pub struct ChannelBenchmark<R, W> {
    reader: R,
    writer: W,
    /// Largest unread batch the medium can absorb without blocking the writer.
    batch_limit: Option<u64>,
}

impl<R: Channel, W: Channel> ChannelBenchmark<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        debug_assert_eq!(reader.role(), Role::Reader);
        debug_assert_eq!(writer.role(), Role::Writer);
        Self {
            reader,
            writer,
            batch_limit: None,
        }
    }

    /// Reject trials whose unread batch exceeds `limit` bytes.
    ///
    /// Needed for stream sockets, where reader and writer share this thread
    /// and an oversized batch would block the writer forever.
    pub fn with_batch_limit(mut self, limit: u64) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    fn check_fits(&self, trial: &Trial) -> Result<()> {
        let capacity = self.writer.capacity().max(self.reader.capacity());
        let needed = trial.bytes_between_clears();
        if capacity > 0 && needed > capacity {
            return Err(Error::Capacity { needed, capacity });
        }
        if let Some(limit) = self.batch_limit {
            let needed = trial.unread_peak();
            if needed > limit {
                return Err(Error::Capacity {
                    needed,
                    capacity: limit,
                });
            }
        }
        Ok(())
    }

    pub fn run_trial(&mut self, trial: &Trial) -> Result<TrialReport> {
        self.check_fits(trial)?;
        debug!(?trial, "Running trial");

        let packet = random_bytes(&mut rand::thread_rng(), trial.packet_size);
        let mut buffer = vec![0u8; trial.packet_size];

        match trial.kind {
            TrialKind::Latency => self.latency(trial, &packet, &mut buffer),
            TrialKind::Throughput => self.throughput(trial, &packet, &mut buffer),
        }
    }

    fn latency(&mut self, trial: &Trial, packet: &[u8], buffer: &mut [u8]) -> Result<TrialReport> {
        let mut write_ns = 0u64;
        let mut read_ns = 0u64;

        for _ in 0..trial.repetitions {
            let before_write = Instant::now();
            self.writer.write(packet)?;
            let after_write = Instant::now();
            self.reader.read(buffer)?;
            let after_read = Instant::now();

            write_ns += (after_write - before_write).as_nanos() as u64;
            read_ns += (after_read - after_write).as_nanos() as u64;
        }
        self.clear()?;

        let repetitions = trial.repetitions.max(1) as f64;
        Ok(TrialReport::Latency(LatencyReport {
            packet_size: trial.packet_size,
            repetitions: trial.repetitions,
            mean_write_ns: write_ns as f64 / repetitions,
            mean_read_ns: read_ns as f64 / repetitions,
        }))
    }

    fn throughput(
        &mut self,
        trial: &Trial,
        packet: &[u8],
        buffer: &mut [u8],
    ) -> Result<TrialReport> {
        let mut write_ns = 0u64;
        let mut read_ns = 0u64;

        for _ in 0..trial.repetitions {
            let before_write = Instant::now();
            for _ in 0..trial.packet_amount {
                self.writer.write(packet)?;
            }
            let after_write = Instant::now();
            for _ in 0..trial.packet_amount {
                self.reader.read(buffer)?;
            }
            let after_read = Instant::now();

            write_ns += (after_write - before_write).as_nanos() as u64;
            read_ns += (after_read - after_write).as_nanos() as u64;

            self.clear()?;
        }

        let bytes = trial.bytes_transferred();
        Ok(TrialReport::Throughput(ThroughputReport {
            packet_size: trial.packet_size,
            packet_amount: trial.packet_amount,
            repetitions: trial.repetitions,
            bytes,
            write_ns,
            read_ns,
            write_rate: transfer_rate(bytes, write_ns),
            read_rate: transfer_rate(bytes, read_ns),
        }))
    }

    fn clear(&mut self) -> Result<()> {
        self.writer.clear()?;
        self.reader.clear()
    }

    /// Run `trials` in order, skipping those the channel cannot hold.
    pub fn run_matrix(&mut self, trials: &[Trial]) -> Result<Vec<TrialReport>> {
        let mut reports = Vec::with_capacity(trials.len());
        for trial in trials {
            match self.run_trial(trial) {
                Ok(report) => reports.push(report),
                Err(Error::Capacity { needed, capacity }) => {
                    warn!(?trial, needed, capacity, "Skipping trial");
                }
                Err(e) => return Err(e),
            }
        }
        info!(run = reports.len(), skipped = trials.len() - reports.len(), "Trials finished");
        Ok(reports)
    }

    /// Close the reader, then the writer.
    pub fn close(self) -> Result<()> {
        self.reader.close()?;
        self.writer.close()
    }
}
