//! Stream socket channels.
//!
//! The reader end is the accepted side of a connection, the writer end is the
//! connecting side. Sockets keep no positional state, so clearing is a no-op.

use super::{Channel, Role};
use crate::error::{Error, Result};
use crate::runtime::remove_stale_socket;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One end of a connected stream socket.
#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
    role: Role,
    /// Socket file removed when the reader closes (Unix sockets only).
    socket_path: Option<PathBuf>,
}

impl StreamChannel<TcpStream> {
    /// Connect a reader/writer pair over loopback TCP.
    ///
    /// `buffer_size` is applied as SO_RCVBUF on the reader and SO_SNDBUF on
    /// the writer when non-zero.
    pub fn tcp_pair(addr: SocketAddr, buffer_size: usize) -> Result<(Self, Self)> {
        let listener = TcpListener::bind(addr).map_err(|source| Error::FatalBind {
            endpoint: addr.to_string(),
            source,
        })?;
        let addr = listener.local_addr()?;

        let writer = TcpStream::connect(addr)?;
        let (reader, peer) = listener.accept()?;
        reader.set_nodelay(true)?;
        writer.set_nodelay(true)?;
        debug!(addr = %addr, peer = %peer, "TCP channel pair connected");

        let reader = Self::new(reader, Role::Reader, None);
        let writer = Self::new(writer, Role::Writer, None);
        if buffer_size > 0 {
            set_buffer_sizes(&reader, &writer, buffer_size)?;
        }
        Ok((reader, writer))
    }
}

impl StreamChannel<UnixStream> {
    /// Connect a reader/writer pair over a Unix-domain socket at `path`.
    pub fn unix_pair(path: &Path, buffer_size: usize) -> Result<(Self, Self)> {
        let listener = remove_stale_socket(path)
            .and_then(|()| UnixListener::bind(path))
            .map_err(|source| Error::FatalBind {
                endpoint: path.display().to_string(),
                source,
            })?;

        let writer = UnixStream::connect(path)?;
        let (reader, _) = listener.accept()?;
        debug!(path = %path.display(), "Unix channel pair connected");

        let reader = Self::new(reader, Role::Reader, Some(path.to_path_buf()));
        let writer = Self::new(writer, Role::Writer, None);
        if buffer_size > 0 {
            set_buffer_sizes(&reader, &writer, buffer_size)?;
        }
        Ok((reader, writer))
    }
}

impl<S: AsFd> StreamChannel<S> {
    fn new(stream: S, role: Role, socket_path: Option<PathBuf>) -> Self {
        Self {
            stream,
            role,
            socket_path,
        }
    }

    /// Socket buffer size of this end as the kernel reports it.
    ///
    /// A writer can queue roughly this many bytes before `write` blocks.
    pub fn buffered_limit(&self) -> Result<u64> {
        let sock = socket2::SockRef::from(&self.stream);
        let size = match self.role {
            Role::Reader => sock.recv_buffer_size()?,
            Role::Writer => sock.send_buffer_size()?,
        };
        Ok(size as u64)
    }
}

fn set_buffer_sizes<S: AsFd>(
    reader: &StreamChannel<S>,
    writer: &StreamChannel<S>,
    size: usize,
) -> io::Result<()> {
    socket2::SockRef::from(&reader.stream).set_recv_buffer_size(size)?;
    socket2::SockRef::from(&writer.stream).set_send_buffer_size(size)
}

impl<S: Read + Write + AsFd> Channel for StreamChannel<S> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buffer).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::PeerClosed
            } else {
                Error::Io(e)
            }
        })
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self) -> Result<()> {
        drop(self.stream);
        if let Some(path) = self.socket_path {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(Error::Path { path, source }),
            }
        }
        Ok(())
    }

    fn role(&self) -> Role {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_pair_transfers_bytes() {
        let (mut reader, mut writer) =
            StreamChannel::tcp_pair("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        assert_eq!(reader.role(), Role::Reader);
        assert_eq!(writer.role(), Role::Writer);
        assert_eq!(writer.capacity(), 0);

        writer.write(b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(writer.buffered_limit().unwrap() > 0);

        writer.close().unwrap();
        assert!(matches!(reader.read(&mut buf), Err(Error::PeerClosed)));
        reader.close().unwrap();
    }

    #[test]
    fn test_unix_pair_removes_socket_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sock");
        let (mut reader, mut writer) = StreamChannel::unix_pair(&path, 64 * 1024).unwrap();

        let payload = vec![9u8; 1000];
        writer.write(&payload).unwrap();
        let mut buf = vec![0u8; 1000];
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, payload);

        writer.close().unwrap();
        reader.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_unix_pair_refuses_non_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"keep me").unwrap();

        assert!(matches!(
            StreamChannel::unix_pair(&path, 0),
            Err(Error::FatalBind { .. })
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }
}
