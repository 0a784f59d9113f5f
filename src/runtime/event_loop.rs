//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The loop runs on one thread and owns every connection. The only state
//! shared with other threads is the stop flag, the waker used to interrupt a
//! blocked poll, and the server counters.

use super::{ConnState, Connection, ConnectionRegistry, Endpoint, Listener, ResponseFn};
use crate::error::{Error, Result};
use crate::stats::ServerCounters;
use bytes::Bytes;
use mio::event::Event;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub endpoint: Endpoint,
    /// Connections accepted past this limit are dropped immediately.
    pub max_connections: usize,
    /// Size of the scratch buffer, i.e. the largest request read at once.
    pub max_request_size: usize,
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
    pub events_capacity: usize,
}

impl ReactorConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_connections: 10_000,
            max_request_size: 2_100_000,
            poll_timeout: Duration::from_millis(100),
            events_capacity: 1024,
        }
    }
}

/// A bound, not yet running echo reactor.
pub struct Reactor {
    poll: Poll,
    listener: Listener,
    connections: ConnectionRegistry,
    scratch: Vec<u8>,
    transform: ResponseFn,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    counters: Arc<ServerCounters>,
    local_endpoint: Endpoint,
    config: ReactorConfig,
}

impl Reactor {
    /// Bind the listener and set up the poller.
    ///
    /// Bind failures are fatal and surface as `Error::FatalBind`.
    pub fn bind(config: ReactorConfig, transform: ResponseFn) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::bind(&config.endpoint)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_endpoint = listener.local_endpoint()?;

        info!(
            endpoint = %local_endpoint,
            max_connections = config.max_connections,
            max_request_size = config.max_request_size,
            "Reactor bound"
        );

        Ok(Self {
            poll,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            scratch: vec![0u8; config.max_request_size.max(1)],
            transform,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
            counters: Arc::new(ServerCounters::default()),
            local_endpoint,
            config,
        })
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<ReactorHandle> {
        let stop = Arc::clone(&self.stop);
        let waker = Arc::clone(&self.waker);
        let counters = Arc::clone(&self.counters);
        let local_endpoint = self.local_endpoint.clone();

        let thread = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    error!(error = %e, "Reactor failed");
                }
            })?;

        Ok(ReactorHandle {
            stop,
            waker,
            counters,
            local_endpoint,
            thread: Some(thread),
        })
    }

    /// Run the loop on the current thread until stopped.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        info!(endpoint = %self.local_endpoint, "Reactor started");

        while !self.stop.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => trace!("Reactor woken"),
                    Token(conn_id) => {
                        if let Err(source) = self.handle_connection_event(conn_id, event) {
                            let e = Error::ConnectionIo { conn_id, source };
                            debug!(error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn_id = match self.connections.insert(Connection::new(stream)) {
                        Ok(id) => id,
                        Err(_) => {
                            warn!(peer = %peer, "Connection limit reached");
                            continue;
                        }
                    };

                    if let Some(conn) = self.connections.get_mut(conn_id) {
                        if let Err(e) = self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        ) {
                            warn!(conn_id, error = %e, "Failed to register connection");
                            self.connections.remove(conn_id);
                            continue;
                        }
                    }

                    self.counters.record_accepted();
                    debug!(
                        conn_id,
                        peer = %peer,
                        active = self.connections.len(),
                        "Accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Discard and wait for the next readiness event
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        let reading = match self.connections.get(conn_id) {
            Some(conn) => matches!(conn.state, ConnState::Reading),
            None => return Ok(()),
        };

        // Half-duplex: only the readiness matching the current state matters
        if reading {
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                return self.handle_readable(conn_id);
            }
        } else if event.is_writable() || event.is_error() {
            return self.handle_writable(conn_id);
        }
        Ok(())
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let n = match conn.stream.read(&mut self.scratch) {
            Ok(0) => {
                debug!(conn_id, "Peer closed");
                self.close_connection(conn_id);
                return Ok(());
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        self.counters.record_received(n);
        trace!(conn_id, bytes = n, "Read request");

        let reply = (self.transform)(&self.scratch[..n]);
        if reply.is_empty() {
            // Nothing to send; re-arm so data that is already queued is seen.
            return self.poll.registry().reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE,
            );
        }

        conn.start_writing(Bytes::from(reply));
        let interest = conn.interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), interest)
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let (written, flushed) = conn.flush_pending()?;
        self.counters.record_sent(written);
        if !flushed {
            // Partial write, resume from the cursor on the next event
            trace!(conn_id, remaining = conn.pending_len(), "Partial write");
            return Ok(());
        }

        conn.start_reading();
        let interest = conn.interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), interest)
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.counters.record_closed();
            debug!(conn_id, active = self.connections.len(), "Connection closed");
        }
    }

    /// Drop every live connection without draining pending replies.
    fn shutdown(&mut self) {
        let registry = self.poll.registry();
        let mut dropped = 0usize;
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(&mut conn.stream);
            self.counters.record_closed();
            dropped += 1;
        }
        let _ = registry.deregister(&mut self.listener);
        self.listener.cleanup();
        info!(endpoint = %self.local_endpoint, dropped, "Reactor stopped");
    }
}

/// Cross-thread handle to a running reactor.
pub struct ReactorHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    counters: Arc<ServerCounters>,
    local_endpoint: Endpoint,
    thread: Option<JoinHandle<()>>,
}

impl ReactorHandle {
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local_endpoint
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    /// Signal the loop to exit and wait for its thread.
    pub fn stop(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            // The bounded poll timeout still lets the loop notice the flag
            warn!(error = %e, "Failed to wake reactor");
        }
        thread
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "reactor thread panicked"))
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::identity;
    use std::io::{Read, Write};
    use std::net::{Shutdown, SocketAddr, TcpStream};
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn tcp_config() -> ReactorConfig {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        ReactorConfig::new(Endpoint::Tcp(addr))
    }

    fn tcp_addr(handle: &ReactorHandle) -> SocketAddr {
        match handle.local_endpoint() {
            Endpoint::Tcp(addr) => *addr,
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn round_trip<S: Read + Write>(stream: &mut S, payload: &[u8], finish: impl FnOnce(&S)) -> Vec<u8> {
        stream.write_all(payload).unwrap();
        finish(stream);
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_echo_round_trip() {
        let handle = Reactor::bind(tcp_config(), identity()).unwrap().spawn().unwrap();
        let addr = tcp_addr(&handle);

        for size in [1usize, 10, 1000, 64 * 1024, 256 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut stream = TcpStream::connect(addr).unwrap();
            let response = round_trip(&mut stream, &payload, |s| {
                s.shutdown(Shutdown::Write).unwrap()
            });
            assert_eq!(response.len(), payload.len());
            assert_eq!(response, payload);
        }

        handle.stop().unwrap();
    }

    #[test]
    fn test_small_scratch_buffer_splits_requests() {
        let mut config = tcp_config();
        config.max_request_size = 7;
        let handle = Reactor::bind(config, identity()).unwrap().spawn().unwrap();

        let payload = vec![42u8; 10_000];
        let mut stream = TcpStream::connect(tcp_addr(&handle)).unwrap();
        let response = round_trip(&mut stream, &payload, |s| {
            s.shutdown(Shutdown::Write).unwrap()
        });
        assert_eq!(response, payload);

        handle.stop().unwrap();
    }

    #[test]
    fn test_custom_transform() {
        let transform: ResponseFn = Arc::new(|req: &[u8]| req.to_ascii_uppercase());
        let handle = Reactor::bind(tcp_config(), transform).unwrap().spawn().unwrap();

        let mut stream = TcpStream::connect(tcp_addr(&handle)).unwrap();
        let response = round_trip(&mut stream, b"ping", |s| s.shutdown(Shutdown::Write).unwrap());
        assert_eq!(response, b"PING");

        handle.stop().unwrap();
    }

    #[test]
    fn test_unix_echo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reactor.sock");
        let config = ReactorConfig::new(Endpoint::Unix(path.clone()));
        let handle = Reactor::bind(config, identity()).unwrap().spawn().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let payload = vec![7u8; 100_000];
        let response = round_trip(&mut stream, &payload, |s| {
            s.shutdown(Shutdown::Write).unwrap()
        });
        assert_eq!(response.len(), payload.len());

        handle.stop().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_single_close_per_connection() {
        let handle = Reactor::bind(tcp_config(), identity()).unwrap().spawn().unwrap();
        let addr = tcp_addr(&handle);
        const CYCLES: u64 = 50;

        for i in 0..CYCLES {
            let mut stream = TcpStream::connect(addr).unwrap();
            if i % 2 == 0 {
                // Orderly request/response followed by end-of-stream
                let response = round_trip(&mut stream, b"abc", |s| {
                    s.shutdown(Shutdown::Write).unwrap()
                });
                assert_eq!(response, b"abc");
            } else {
                // Connect and hang up without sending anything
                drop(stream);
            }
        }

        let counters = handle.counters();
        assert!(wait_until(|| counters.closed() == CYCLES));
        assert_eq!(counters.accepted(), CYCLES);
        assert_eq!(counters.closed(), CYCLES);
        assert_eq!(counters.bytes_received(), 3 * CYCLES / 2);
        assert_eq!(counters.bytes_sent(), 3 * CYCLES / 2);

        handle.stop().unwrap();
    }

    #[test]
    fn test_connection_reset_is_contained() {
        let handle = Reactor::bind(tcp_config(), identity()).unwrap().spawn().unwrap();
        let addr = tcp_addr(&handle);

        // Abort a connection with RST via SO_LINGER(0)
        let stream = TcpStream::connect(addr).unwrap();
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::from_secs(0)))
            .unwrap();
        drop(stream);

        assert!(wait_until(|| handle.counters().closed() == 1));

        // The loop keeps serving other clients
        let mut stream = TcpStream::connect(addr).unwrap();
        let response = round_trip(&mut stream, b"still alive", |s| {
            s.shutdown(Shutdown::Write).unwrap()
        });
        assert_eq!(response, b"still alive");

        handle.stop().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let mut config = tcp_config();
        config.max_connections = 1;
        let handle = Reactor::bind(config, identity()).unwrap().spawn().unwrap();
        let addr = tcp_addr(&handle);

        let mut first = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| handle.counters().accepted() == 1));

        // Second client is dropped by the server
        let mut second = TcpStream::connect(addr).unwrap();
        second.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));

        let response = round_trip(&mut first, b"ok", |s| s.shutdown(Shutdown::Write).unwrap());
        assert_eq!(response, b"ok");

        handle.stop().unwrap();
    }

    #[test]
    fn test_bounded_shutdown() {
        let mut config = tcp_config();
        // Even a long poll timeout must not delay shutdown
        config.poll_timeout = Duration::from_secs(30);
        let handle = Reactor::bind(config, identity()).unwrap().spawn().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_drops_open_connections() {
        let handle = Reactor::bind(tcp_config(), identity()).unwrap().spawn().unwrap();
        let mut stream = TcpStream::connect(tcp_addr(&handle)).unwrap();
        assert!(wait_until(|| handle.counters().accepted() == 1));

        let counters = Arc::clone(&handle.counters);
        handle.stop().unwrap();
        assert_eq!(counters.closed(), 1);

        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
    }
}
