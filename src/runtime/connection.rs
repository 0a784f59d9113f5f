//! Connection state machine for reactor clients.
//!
//! Each connection is half-duplex: it reads one request chunk, then writes the
//! whole reply before reading again. The pending reply lives inside the
//! connection record, so it can never be attached to two connections.

use super::Stream;
use bytes::{Buf, Bytes};
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};

/// Current state of a connection.
#[derive(Debug, Clone)]
pub enum ConnState {
    /// Waiting for the next request chunk.
    Reading,
    /// Flushing a reply. `remaining` is advanced past every byte written.
    Writing { remaining: Bytes },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: Stream,
    pub state: ConnState,
}

impl Connection {
    /// Create a new connection in the reading state.
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
        }
    }

    /// Transition to writing `reply`.
    pub fn start_writing(&mut self, reply: Bytes) {
        self.state = ConnState::Writing { remaining: reply };
    }

    /// Transition back to reading.
    pub fn start_reading(&mut self) {
        self.state = ConnState::Reading;
    }

    /// Write as much of the pending reply as the socket accepts.
    ///
    /// Returns the bytes written by this call and whether the reply is now
    /// fully flushed. `WouldBlock` leaves the cursor where the socket stopped.
    pub fn flush_pending(&mut self) -> io::Result<(usize, bool)> {
        let ConnState::Writing { remaining } = &mut self.state else {
            return Ok((0, true));
        };

        let mut written = 0;
        while !remaining.is_empty() {
            match self.stream.write(&remaining[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    remaining.advance(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((written, false)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((written, true))
    }

    /// Bytes of the reply not yet written.
    pub fn pending_len(&self) -> usize {
        match &self.state {
            ConnState::Writing { remaining } => remaining.len(),
            ConnState::Reading => 0,
        }
    }

    /// Readiness the connection waits for. Never both.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Reading => Interest::READABLE,
            ConnState::Writing { .. } => Interest::WRITABLE,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as mio tokens, giving O(1) lookup per event.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. A second removal of the same id returns `None`.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn test_stream() -> (Stream, StdUnixStream) {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Stream::Unix(mio::net::UnixStream::from_std(a)), b)
    }

    #[test]
    fn test_connection_state_transitions() {
        let (stream, mut peer) = test_stream();
        let mut conn = Connection::new(stream);

        assert!(matches!(conn.state, ConnState::Reading));
        assert_eq!(conn.interest(), Interest::READABLE);

        conn.start_writing(Bytes::from_static(b"hello world"));
        assert_eq!(conn.interest(), Interest::WRITABLE);
        assert_eq!(conn.pending_len(), 11);

        assert_eq!(conn.flush_pending().unwrap(), (11, true));
        assert_eq!(conn.pending_len(), 0);

        let mut received = [0u8; 11];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"hello world");

        conn.start_reading();
        assert!(matches!(conn.state, ConnState::Reading));
        assert_eq!(conn.interest(), Interest::READABLE);
        assert_eq!(conn.flush_pending().unwrap(), (0, true));
    }

    #[test]
    fn test_partial_write_keeps_cursor() {
        let (stream, mut peer) = test_stream();
        let mut conn = Connection::new(stream);

        // Far more than a socket buffer holds while the peer is not reading
        let reply: Vec<u8> = (0..16 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
        conn.start_writing(Bytes::from(reply.clone()));

        let (first, flushed) = conn.flush_pending().unwrap();
        assert!(!flushed);
        assert!(first > 0);
        assert_eq!(conn.pending_len(), reply.len() - first);

        let reader = std::thread::spawn(move || {
            let mut received = vec![0u8; reply.len()];
            peer.read_exact(&mut received).unwrap();
            received == reply
        });

        let mut total = first;
        loop {
            let (n, flushed) = conn.flush_pending().unwrap();
            total += n;
            if flushed {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(conn.pending_len(), 0);
        assert!(reader.join().unwrap());
        assert_eq!(total, 16 * 1024 * 1024);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);
        let (s1, _p1) = test_stream();
        let (s2, _p2) = test_stream();
        let (s3, _p3) = test_stream();

        let id1 = registry.insert(Connection::new(s1)).unwrap();
        let id2 = registry.insert(Connection::new(s2)).unwrap();

        // At capacity
        assert!(registry.insert(Connection::new(s3)).is_err());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get(id1).is_none());
        assert!(registry.get(id2).is_some());

        assert_eq!(registry.drain().count(), 1);
        assert_eq!(registry.len(), 0);
    }
}
