//! Byte channels used by the IPC benchmarks.
//!
//! A channel is one endpoint (reader or writer) of a medium that moves bytes
//! from a writer to a reader:
//! - `socket`: TCP and Unix-domain stream sockets
//! - `file`: a plain file shared by both endpoints
//! - `mmap`: a shared memory mapping of a file
//!
//! Endpoints are always created in pairs of the same medium.

pub mod file;
pub mod mmap;
pub mod socket;

pub use file::FileChannel;
pub use mmap::MmapChannel;
pub use socket::StreamChannel;

use crate::error::Result;
use serde::Deserialize;

/// Which side of a pair an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
}

/// Media a channel pair can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Tcp,
    Unix,
    File,
    Mmap,
}

/// One endpoint of a byte channel.
pub trait Channel {
    /// Write all of `data`, failing if the medium rejects it.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Fill `buffer` with the next bytes from the medium.
    ///
    /// Fails if the peer or medium has terminated before the buffer is full.
    fn read(&mut self, buffer: &mut [u8]) -> Result<()>;

    /// Reset cursors and content so the next trial starts from scratch.
    fn clear(&mut self) -> Result<()>;

    /// Release the underlying resources.
    fn close(self) -> Result<()>
    where
        Self: Sized;

    /// Maximum number of bytes the medium can hold, 0 when unbounded.
    fn capacity(&self) -> u64 {
        0
    }

    fn role(&self) -> Role;
}
