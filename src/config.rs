//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::channel::ChannelKind;
use crate::runtime::{Endpoint, ReactorConfig};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for echo-bench
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Echo reactor with socket load and IPC channel benchmarks", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides `[logging] level`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Run the echo reactor until Ctrl-C
    Serve(EndpointArgs),
    /// Start an echo reactor and drive load against it
    Load {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Number of load worker threads
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Successful requests across all workers
        #[arg(short = 'n', long)]
        requests: Option<u64>,

        /// Generate a fresh random payload per request
        #[arg(long)]
        random_payload: bool,
    },
    /// Run the latency/throughput matrix over a channel pair
    Ipc {
        /// Channel medium
        #[arg(long, value_enum)]
        channel: Option<ChannelKind>,

        /// Backing file or socket path for file, mmap and unix channels
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct EndpointArgs {
    /// Address to bind to (e.g., 127.0.0.1:8103)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen on a Unix-domain socket at this path instead of TCP
    #[arg(short = 'u', long)]
    pub unix_socket: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub load: LoadSection,
    #[serde(default)]
    pub ipc: IpcSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reactor configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Takes precedence over `listen` when set
    pub unix_socket: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            unix_socket: None,
            max_connections: default_max_connections(),
            max_request_size: default_max_request_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Load generator configuration
#[derive(Debug, Deserialize)]
pub struct LoadSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_requests")]
    pub requests: u64,
    #[serde(default = "default_min_payload")]
    pub min_payload: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Reuse one payload for every request
    #[serde(default = "default_cached_payload")]
    pub cached_payload: bool,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requests: default_requests(),
            min_payload: default_min_payload(),
            max_payload: default_max_payload(),
            cached_payload: default_cached_payload(),
        }
    }
}

/// IPC benchmark configuration
#[derive(Debug, Deserialize)]
pub struct IpcSection {
    #[serde(default = "default_channel")]
    pub channel: ChannelKind,
    pub path: Option<PathBuf>,
    /// Address for the tcp channel
    #[serde(default = "default_ipc_listen")]
    pub listen: String,
    /// Mapping length for mmap, requested socket buffer size for tcp/unix
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            path: None,
            listen: default_ipc_listen(),
            capacity: default_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8103".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_request_size() -> usize {
    2_100_000
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_workers() -> usize {
    10
}

fn default_requests() -> u64 {
    200
}

fn default_min_payload() -> usize {
    1_999_999
}

fn default_max_payload() -> usize {
    2_000_000
}

fn default_cached_payload() -> bool {
    true
}

fn default_channel() -> ChannelKind {
    ChannelKind::Mmap
}

fn default_ipc_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_capacity() -> usize {
    102_400 * 2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// TCP channels are addressed by `ipc.listen` and carry no path.
fn default_ipc_path(channel: ChannelKind) -> PathBuf {
    match channel {
        ChannelKind::Unix => PathBuf::from("ipc_test.sock"),
        ChannelKind::File => PathBuf::from("file_test.dat"),
        ChannelKind::Mmap => PathBuf::from("mmap_test.dat"),
        ChannelKind::Tcp => PathBuf::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Load,
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSettings {
    pub workers: usize,
    pub requests: u64,
    pub min_payload: usize,
    pub max_payload: usize,
    pub cached_payload: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcSettings {
    pub channel: ChannelKind,
    /// Backing path for unix, file and mmap channels; empty for tcp
    pub path: PathBuf,
    pub listen: SocketAddr,
    pub capacity: usize,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub reactor: ReactorConfig,
    pub load: LoadSettings,
    pub ipc: IpcSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            mut server,
            load,
            ipc,
            logging,
        } = toml_config;

        let mut load = LoadSettings {
            workers: load.workers,
            requests: load.requests,
            min_payload: load.min_payload,
            max_payload: load.max_payload,
            cached_payload: load.cached_payload,
        };
        let mut channel = ipc.channel;
        let mut ipc_path = ipc.path;

        let mode = match cli.mode {
            ModeArgs::Serve(endpoint) => {
                apply_endpoint_args(&mut server, endpoint);
                Mode::Serve
            }
            ModeArgs::Load {
                endpoint,
                workers,
                requests,
                random_payload,
            } => {
                apply_endpoint_args(&mut server, endpoint);
                load.workers = workers.unwrap_or(load.workers);
                load.requests = requests.unwrap_or(load.requests);
                if random_payload {
                    load.cached_payload = false;
                }
                Mode::Load
            }
            ModeArgs::Ipc { channel: c, path } => {
                channel = c.unwrap_or(channel);
                ipc_path = path.or(ipc_path);
                Mode::Ipc
            }
        };

        if load.workers == 0 {
            return Err(ConfigError::Invalid("load.workers must be at least 1".to_string()));
        }
        if load.min_payload == 0 {
            return Err(ConfigError::Invalid(
                "load.min_payload must be at least 1".to_string(),
            ));
        }
        if load.max_payload < load.min_payload {
            return Err(ConfigError::Invalid(
                "load.max_payload must not be below load.min_payload".to_string(),
            ));
        }
        if server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be at least 1".to_string(),
            ));
        }

        let endpoint = match server.unix_socket {
            Some(path) => Endpoint::Unix(path),
            None => Endpoint::Tcp(parse_addr("server.listen", &server.listen)?),
        };
        let mut reactor = ReactorConfig::new(endpoint);
        reactor.max_connections = server.max_connections;
        reactor.max_request_size = server.max_request_size;
        reactor.poll_timeout = Duration::from_millis(server.poll_timeout_ms);

        let ipc = IpcSettings {
            channel,
            path: match channel {
                ChannelKind::Tcp => default_ipc_path(channel),
                _ => ipc_path.unwrap_or_else(|| default_ipc_path(channel)),
            },
            listen: parse_addr("ipc.listen", &ipc.listen)?,
            capacity: ipc.capacity,
        };

        Ok(Config {
            mode,
            reactor,
            load,
            ipc,
            log_level: cli.log_level.unwrap_or(logging.level),
        })
    }
}

fn apply_endpoint_args(server: &mut ServerConfig, args: EndpointArgs) {
    if let Some(listen) = args.listen {
        server.listen = listen;
        // An explicit TCP address on the command line wins over a configured socket
        server.unix_socket = None;
    }
    if let Some(path) = args.unix_socket {
        server.unix_socket = Some(path);
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{field}: invalid socket address '{value}'")))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
