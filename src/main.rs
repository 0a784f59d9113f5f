//! echo-bench: an echo reactor with load and IPC benchmarks
//!
//! Modes:
//! - `serve`: run the readiness-based echo reactor until Ctrl-C
//! - `load`: start the reactor and drive it with concurrent socket clients
//! - `ipc`: run latency/throughput trials over tcp, unix, file or mmap channels
//!
//! Configuration via CLI arguments or TOML file.

mod bench;
mod channel;
mod config;
mod error;
mod load;
mod runtime;
mod stats;

use bench::{ChannelBenchmark, Trial};
use channel::{Channel, ChannelKind, FileChannel, MmapChannel, StreamChannel};
use config::{Config, IpcSettings, Mode};
use load::{CachedPayload, LoadConfig, LoadGenerator, RandomPayload, RequestProvider, Transport};
use runtime::{identity, Reactor};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(mode = ?config.mode, "Starting echo-bench");

    match config.mode {
        Mode::Serve => run_serve(config),
        Mode::Load => run_load(config),
        Mode::Ipc => run_ipc(&config.ipc),
    }
}

/// Serve until Ctrl-C
fn run_serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let handle = Reactor::bind(config.reactor, identity())?.spawn()?;
    info!(endpoint = %handle.local_endpoint(), "Serving, press Ctrl-C to stop");

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;

    info!("Shutdown signal received");
    println!("{}", handle.counters());
    handle.stop()?;
    Ok(())
}

fn run_load(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let settings = &config.load;
    let provider: Arc<dyn RequestProvider> = if settings.cached_payload {
        let cached = CachedPayload::new(settings.min_payload, settings.max_payload)?;
        info!(payload_len = cached.payload_len(), "Using cached payload");
        Arc::new(cached)
    } else {
        Arc::new(RandomPayload::new(settings.min_payload, settings.max_payload)?)
    };

    let handle = Reactor::bind(config.reactor.clone(), provider.response_fn())?.spawn()?;
    let transport: Arc<dyn Transport> = Arc::new(handle.local_endpoint().clone());

    let run = LoadGenerator::start(
        LoadConfig {
            workers: settings.workers,
            total_requests: settings.requests,
        },
        transport,
        provider,
    )?;
    let report = run.wait();

    println!("{report}");
    println!("{}", handle.counters());
    handle.stop()?;
    Ok(())
}

fn run_ipc(settings: &IpcSettings) -> Result<(), Box<dyn std::error::Error>> {
    match settings.channel {
        ChannelKind::Tcp => info!(
            channel = ?settings.channel,
            listen = %settings.listen,
            capacity = settings.capacity,
            "Running IPC benchmark"
        ),
        _ => info!(
            channel = ?settings.channel,
            path = %settings.path.display(),
            capacity = settings.capacity,
            "Running IPC benchmark"
        ),
    }

    match settings.channel {
        ChannelKind::Tcp => {
            let (reader, writer) = StreamChannel::tcp_pair(settings.listen, settings.capacity)?;
            // Kernel reports doubled buffer sizes that include bookkeeping overhead
            let limit = writer.buffered_limit()? / 2;
            run_matrix(ChannelBenchmark::new(reader, writer).with_batch_limit(limit))
        }
        ChannelKind::Unix => {
            let (reader, writer) = StreamChannel::unix_pair(&settings.path, settings.capacity)?;
            let limit = writer.buffered_limit()? / 2;
            run_matrix(ChannelBenchmark::new(reader, writer).with_batch_limit(limit))
        }
        ChannelKind::File => {
            let (reader, writer) = FileChannel::pair(&settings.path)?;
            run_matrix(ChannelBenchmark::new(reader, writer))
        }
        ChannelKind::Mmap => {
            let (reader, writer) = MmapChannel::pair(&settings.path, settings.capacity)?;
            run_matrix(ChannelBenchmark::new(reader, writer))
        }
    }
}

fn run_matrix<R: Channel, W: Channel>(
    mut bench: ChannelBenchmark<R, W>,
) -> Result<(), Box<dyn std::error::Error>> {
    let reports = bench.run_matrix(&Trial::default_matrix());
    // Release files and sockets even when a trial failed
    let closed = bench.close();

    for report in reports? {
        println!("{report}\n");
    }
    closed?;
    Ok(())
}
