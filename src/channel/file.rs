//! Plain file channel.
//!
//! Both endpoints open the same path with independent cursors. The writer
//! appends and syncs each packet; the reader consumes from its own offset.
//! Clearing truncates the file and rewinds both cursors.

use super::{Channel, Role};
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct FileChannel {
    file: File,
    path: PathBuf,
    role: Role,
}

impl FileChannel {
    /// Create (or truncate) the file at `path` and open a reader/writer pair on it.
    pub fn pair(path: &Path) -> Result<(Self, Self)> {
        let path_err = |source: io::Error| Error::Path {
            path: path.to_path_buf(),
            source,
        };

        let writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(path_err)?;
        let reader = File::open(path).map_err(path_err)?;
        debug!(path = %path.display(), "File channel pair opened");

        Ok((
            Self {
                file: reader,
                path: path.to_path_buf(),
                role: Role::Reader,
            },
            Self {
                file: writer,
                path: path.to_path_buf(),
                role: Role::Writer,
            },
        ))
    }

    fn path_err(&self, source: io::Error) -> Error {
        Error::Path {
            path: self.path.clone(),
            source,
        }
    }
}

impl Channel for FileChannel {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .and_then(|()| self.file.sync_data())
            .map_err(|e| self.path_err(e))
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact(buffer).map_err(|e| self.path_err(e))
    }

    fn clear(&mut self) -> Result<()> {
        let result = match self.role {
            Role::Writer => self.file.set_len(0).and_then(|()| self.file.rewind()),
            Role::Reader => self.file.seek(SeekFrom::Start(0)).map(|_| ()),
        };
        result.map_err(|e| self.path_err(e))
    }

    fn close(self) -> Result<()> {
        drop(self.file);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            // The other endpoint of the pair already removed it
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Path {
                path: self.path,
                source,
            }),
        }
    }

    fn role(&self) -> Role {
        self.role
    }
}
