//! Multi-threaded load generator.
//!
//! `LoadGenerator::start` spawns one blocking worker thread per configured
//! worker. Every worker repeats request/response exchanges through a shared
//! `Transport` until it has collected its quota of successful requests or the
//! run is stopped. Workers keep their counters to themselves and merge them
//! into the shared aggregate once, right before signalling the completion
//! barrier. The aggregate is only handed out after that barrier.

mod provider;
mod transport;

pub use provider::{CachedPayload, RandomPayload, RequestProvider};
pub(crate) use provider::random_bytes;
pub use transport::Transport;

use crate::error::{Error, Result};
use crate::stats::{AggregateStatistics, LoadReport, WorkerStatistics};
use chrono::Local;
use crossbeam::sync::WaitGroup;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shape of a load run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfig {
    pub workers: usize,
    /// Successful requests across all workers, split evenly between them.
    pub total_requests: u64,
}

impl LoadConfig {
    /// Successful requests each worker aims for.
    pub fn quota_per_worker(&self) -> u64 {
        self.total_requests / self.workers.max(1) as u64
    }
}

pub struct LoadGenerator;

impl LoadGenerator {
    /// Spawn the workers and return immediately.
    pub fn start(
        config: LoadConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn RequestProvider>,
    ) -> Result<LoadRun> {
        if config.workers == 0 {
            return Err(Error::Config("load run needs at least one worker".to_string()));
        }

        let quota = config.quota_per_worker();
        let stop = Arc::new(AtomicBool::new(false));
        let aggregate = Arc::new(AggregateStatistics::new());
        let wait_group = WaitGroup::new();
        let started_at = Local::now();

        info!(
            workers = config.workers,
            total_requests = config.total_requests,
            quota,
            "Starting load run"
        );

        let mut threads = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let worker = Worker {
                id,
                quota,
                transport: Arc::clone(&transport),
                provider: Arc::clone(&provider),
                stop: Arc::clone(&stop),
            };
            let aggregate = Arc::clone(&aggregate);
            let done = wait_group.clone();

            let spawned = thread::Builder::new()
                .name(format!("load-worker-{id}"))
                .spawn(move || {
                    let local = worker.run();
                    aggregate.merge(&local);
                    drop(done);
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Release the workers already running before bailing out
                    stop.store(true, Ordering::Release);
                    drop(wait_group);
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(LoadRun {
            stop,
            aggregate,
            wait_group,
            threads,
            started_at,
            workers: config.workers,
        })
    }
}

/// A running load generation.
pub struct LoadRun {
    stop: Arc<AtomicBool>,
    aggregate: Arc<AggregateStatistics>,
    wait_group: WaitGroup,
    threads: Vec<JoinHandle<()>>,
    started_at: chrono::DateTime<Local>,
    workers: usize,
}

impl LoadRun {
    /// Ask workers to finish after their current request.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Block until every worker has merged its counters, then report.
    pub fn wait(self) -> LoadReport {
        let started = Instant::now();
        self.wait_group.wait();
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("Load worker panicked");
            }
        }

        let totals = self.aggregate.snapshot();
        info!(
            requests = totals.total_requests(),
            successful = totals.successful,
            unsuccessful = totals.unsuccessful,
            waited_ms = started.elapsed().as_millis() as u64,
            "Load run finished"
        );

        LoadReport {
            started_at: self.started_at,
            workers: self.workers,
            totals,
        }
    }
}

struct Worker {
    id: usize,
    quota: u64,
    transport: Arc<dyn Transport>,
    provider: Arc<dyn RequestProvider>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) -> WorkerStatistics {
        let mut stats = WorkerStatistics::default();

        while stats.successful < self.quota && !self.stop.load(Ordering::Acquire) {
            let request = self.provider.request();
            let started = Instant::now();
            let bytes = match self.transport.round_trip(&request) {
                Ok(response) => {
                    if !response.is_empty() && self.provider.is_correct(&request, &response) {
                        request.len() as u64
                    } else {
                        debug!(
                            worker = self.id,
                            sent = request.len(),
                            received = response.len(),
                            "Incorrect response"
                        );
                        0
                    }
                }
                Err(source) => {
                    let e = Error::WorkerTransport(source);
                    if e.is_peer_closed() {
                        debug!(worker = self.id, error = %e, "Peer closed mid-request");
                    } else {
                        warn!(worker = self.id, error = %e, "Request failed");
                    }
                    0
                }
            };
            stats.record(bytes, started.elapsed());
        }

        debug!(
            worker = self.id,
            successful = stats.successful,
            unsuccessful = stats.unsuccessful,
            "Load worker done"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Endpoint, Reactor, ReactorConfig};
    use bytes::Bytes;
    use std::io;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Echoes requests, failing every `fail_every`-th call.
    struct FlakyTransport {
        calls: AtomicU64,
        fail_every: u64,
    }

    impl FlakyTransport {
        fn new(fail_every: u64) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_every,
            }
        }
    }

    impl Transport for FlakyTransport {
        fn round_trip(&self, request: &[u8]) -> io::Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "flaky"));
            }
            Ok(request.to_vec())
        }
    }

    struct Fixed(Bytes);

    impl RequestProvider for Fixed {
        fn request(&self) -> Bytes {
            self.0.clone()
        }
    }

    #[test]
    fn test_quota_per_worker() {
        let config = LoadConfig {
            workers: 3,
            total_requests: 10,
        };
        assert_eq!(config.quota_per_worker(), 3);
    }

    #[test]
    fn test_counter_conservation() {
        for workers in [1usize, 5, 20] {
            let transport = Arc::new(FlakyTransport::new(7));
            let config = LoadConfig {
                workers,
                total_requests: 40 * workers as u64,
            };
            let run = LoadGenerator::start(
                config,
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::new(Fixed(Bytes::from_static(b"0123456789"))),
            )
            .unwrap();
            let report = run.wait();
            let totals = report.totals;

            assert_eq!(report.workers, workers);
            assert_eq!(totals.successful, 40 * workers as u64);
            assert_eq!(
                totals.total_requests(),
                transport.calls.load(Ordering::Relaxed),
                "workers {workers}"
            );
            assert_eq!(totals.bytes_sent, 10 * totals.successful);
            assert!(totals.unsuccessful > 0);
        }
    }

    #[test]
    fn test_incorrect_responses_are_unsuccessful() {
        struct Truncating;
        impl Transport for Truncating {
            fn round_trip(&self, request: &[u8]) -> io::Result<Vec<u8>> {
                Ok(request[..request.len() / 2].to_vec())
            }
        }

        let run = LoadGenerator::start(
            LoadConfig {
                workers: 2,
                total_requests: 4,
            },
            Arc::new(Truncating),
            Arc::new(Fixed(Bytes::from_static(b"abcd"))),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        run.stop();
        let totals = run.wait().totals;

        assert_eq!(totals.successful, 0);
        assert_eq!(totals.bytes_sent, 0);
        assert!(totals.unsuccessful > 0);
    }

    #[test]
    fn test_stop_ends_run() {
        let run = LoadGenerator::start(
            LoadConfig {
                workers: 4,
                total_requests: u64::MAX,
            },
            Arc::new(FlakyTransport::new(0)),
            Arc::new(Fixed(Bytes::from_static(b"x"))),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        run.stop();

        let totals = run.wait().totals;
        assert!(totals.successful > 0);
        assert_eq!(totals.unsuccessful, 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = LoadGenerator::start(
            LoadConfig {
                workers: 0,
                total_requests: 1,
            },
            Arc::new(FlakyTransport::new(0)),
            Arc::new(Fixed(Bytes::from_static(b"x"))),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_against_reactor() {
        let provider = Arc::new(RandomPayload::new(1, 4096).unwrap());
        let config = ReactorConfig::new(Endpoint::Tcp("127.0.0.1:0".parse().unwrap()));
        let handle = Reactor::bind(config, provider.response_fn())
            .unwrap()
            .spawn()
            .unwrap();
        let transport: Arc<dyn Transport> = Arc::new(handle.local_endpoint().clone());

        let report = LoadGenerator::start(
            LoadConfig {
                workers: 4,
                total_requests: 40,
            },
            transport,
            provider,
        )
        .unwrap()
        .wait();

        assert_eq!(report.totals.successful, 40);
        assert_eq!(report.totals.unsuccessful, 0);
        assert_eq!(handle.counters().bytes_received(), report.totals.bytes_sent);

        handle.stop().unwrap();
    }

    #[test]
    fn test_default_payload_over_unix() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(CachedPayload::new(1_999_999, 2_000_000).unwrap());
        let config = ReactorConfig::new(Endpoint::Unix(dir.path().join("load.sock")));
        let handle = Reactor::bind(config, provider.response_fn())
            .unwrap()
            .spawn()
            .unwrap();
        let transport: Arc<dyn Transport> = Arc::new(handle.local_endpoint().clone());

        let report = LoadGenerator::start(
            LoadConfig {
                workers: 2,
                total_requests: 4,
            },
            transport,
            Arc::clone(&provider) as Arc<dyn RequestProvider>,
        )
        .unwrap()
        .wait();

        assert_eq!(report.totals.successful, 4);
        assert_eq!(report.totals.unsuccessful, 0);
        assert_eq!(report.totals.bytes_sent, 4 * provider.payload_len() as u64);

        handle.stop().unwrap();
    }
}
