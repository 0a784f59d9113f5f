//! Error types shared by the reactor, the load harness and the channel
//! benchmarks.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for echo-bench operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Read or write fault on a single server-side connection.
    #[error("connection {conn_id} I/O error: {source}")]
    ConnectionIo { conn_id: usize, source: io::Error },

    /// The peer ended the stream in an orderly way.
    #[error("peer closed the stream")]
    PeerClosed,

    /// Client-side send/receive failure during a load round trip.
    #[error("transport error: {0}")]
    WorkerTransport(#[source] io::Error),

    /// The listening socket could not be created or bound.
    #[error("failed to bind {endpoint}: {source}")]
    FatalBind { endpoint: String, source: io::Error },

    /// A trial needs more room than the channel can hold.
    #[error("trial needs {needed} bytes but channel capacity is {capacity}")]
    Capacity { needed: u64, capacity: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Path { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error marks a normal end of a connection rather than a fault.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::ConnectionIo { source, .. } | Error::WorkerTransport(source) => {
                source.kind() == io::ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
