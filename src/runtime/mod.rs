//! Readiness-based echo reactor.
//!
//! A single thread owns a mio `Poll`, the listening socket and every accepted
//! connection. Each connection alternates between reading one request chunk
//! and writing the transformed reply:
//! - `Connection`: per-connection state machine and pending reply
//! - `ConnectionRegistry`: slab of live connections keyed by token
//! - `Reactor`/`ReactorHandle`: the event loop and its cross-thread stop handle

mod connection;
mod event_loop;
mod stream;

pub(crate) use connection::{ConnState, Connection, ConnectionRegistry};
pub use event_loop::{Reactor, ReactorConfig};
pub(crate) use stream::{remove_stale_socket, Listener, Stream};

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Maps the bytes of one received request to the reply bytes.
pub type ResponseFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Reply with exactly the bytes received.
pub fn identity() -> ResponseFn {
    Arc::new(|request: &[u8]| request.to_vec())
}

/// Address a reactor listens on or a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let transform = identity();
        assert_eq!(transform(b"hello"), b"hello".to_vec());
        assert!(transform(b"").is_empty());
    }

    #[test]
    fn test_endpoint_display() {
        let tcp = Endpoint::Tcp("127.0.0.1:8103".parse().unwrap());
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:8103");

        let unix = Endpoint::Unix(PathBuf::from("/tmp/echo.sock"));
        assert_eq!(unix.to_string(), "unix:///tmp/echo.sock");
    }
}
