//! Socket kinds served by the reactor.
//!
//! Wraps mio TCP and Unix-domain sockets behind one type so the event loop and
//! the connection registry do not care which transport a client used.

use super::Endpoint;
use crate::error::Error;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// An accepted, non-blocking client socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

/// The listening socket. Unix listeners own their socket file.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind a non-blocking listener for `endpoint`.
    pub fn bind(endpoint: &Endpoint) -> Result<Self, Error> {
        let result = match endpoint {
            Endpoint::Tcp(addr) => create_tcp_listener(*addr).map(Listener::Tcp),
            Endpoint::Unix(path) => bind_unix(path),
        };
        result.map_err(|source| Error::FatalBind {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    /// Accept one pending connection, returning it with a printable peer name.
    pub fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            Listener::Unix { listener, .. } => {
                let (stream, peer) = listener.accept()?;
                Ok((Stream::Unix(stream), format!("{peer:?}")))
            }
        }
    }

    /// The address actually bound (resolves port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(Endpoint::Tcp),
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Remove the socket file of a Unix listener.
    pub fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.register(registry, token, interests),
            Listener::Unix { listener, .. } => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.reregister(registry, token, interests),
            Listener::Unix { listener, .. } => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.deregister(registry),
            Listener::Unix { listener, .. } => listener.deregister(registry),
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR so quick restarts can rebind.
fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

fn bind_unix(path: &Path) -> io::Result<Listener> {
    remove_stale_socket(path)?;
    let listener = UnixListener::bind(path)?;
    Ok(Listener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

/// Remove a socket file left behind by an earlier run.
///
/// Anything at `path` that is not a socket is left alone and reported as
/// `AlreadyExists`.
pub(crate) fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    std::fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_bind_resolves_port() {
        let endpoint = Endpoint::Tcp("127.0.0.1:0".parse().unwrap());
        let listener = Listener::bind(&endpoint).unwrap();
        match listener.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let first = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".parse().unwrap())).unwrap();
        let taken = first.local_endpoint().unwrap();

        // SO_REUSEADDR does not allow two live listeners on one port.
        match Listener::bind(&taken) {
            Err(Error::FatalBind { endpoint, .. }) => assert_eq!(endpoint, taken.to_string()),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        // A listener dropped without cleanup leaves its socket file behind
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind(&Endpoint::Unix(path.clone())).unwrap();
        assert_eq!(listener.local_endpoint().unwrap(), Endpoint::Unix(path.clone()));

        listener.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn test_unix_bind_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"user data").unwrap();

        match Listener::bind(&Endpoint::Unix(path.clone())) {
            Err(Error::FatalBind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"user data");
    }
}
