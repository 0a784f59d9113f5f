//! Client side of a single request/response exchange.

use crate::runtime::Endpoint;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::thread;

/// Performs one synchronous send-and-receive.
pub trait Transport: Send + Sync {
    /// Send `request` and return everything the peer answered with.
    fn round_trip(&self, request: &[u8]) -> io::Result<Vec<u8>>;
}

/// A fresh connection per request: write everything, half-close, read to EOF.
///
/// The reply is drained while the request is still being written. The echo
/// server stops reading until its pending reply is flushed, so a client that
/// only reads after sending would deadlock once a request outgrows the socket
/// buffers.
impl Transport for Endpoint {
    fn round_trip(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)?;
                stream.set_nodelay(true)?;
                let writer = stream.try_clone()?;
                exchange(stream, writer, request, |s: &TcpStream| {
                    s.shutdown(Shutdown::Write)
                })
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                let writer = stream.try_clone()?;
                exchange(stream, writer, request, |s: &UnixStream| {
                    s.shutdown(Shutdown::Write)
                })
            }
        }
    }
}

fn exchange<S, F>(mut reader: S, mut writer: S, request: &[u8], half_close: F) -> io::Result<Vec<u8>>
where
    S: Read + Write + Send,
    F: FnOnce(&S) -> io::Result<()> + Send,
{
    thread::scope(|scope| {
        let sender = scope.spawn(move || {
            let written = writer.write_all(request);
            // Half-close even after a failed write so the reader sees EOF
            half_close(&writer)?;
            written
        });

        let mut response = Vec::new();
        let received = reader.read_to_end(&mut response);
        sender
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "request writer panicked"))??;
        received?;
        Ok(response)
    })
}
