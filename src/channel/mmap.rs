//! Memory-mapped file channel.
//!
//! Both endpoints map the same backing file as shared mappings, so bytes the
//! writer copies into its mapping are visible through the reader's mapping.
//! Each keeps its own cursor; clearing rewinds it without touching content.

use super::{Channel, Role};
use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

enum Mapping {
    /// Read-only view for the reader end.
    Reader(Mmap),
    Writer(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Reader(map) => map,
            Mapping::Writer(map) => map,
        }
    }
}

pub struct MmapChannel {
    map: Mapping,
    cursor: usize,
    path: PathBuf,
}

impl MmapChannel {
    /// Size the file at `path` to `capacity` bytes and map it once per endpoint.
    pub fn pair(path: &Path, capacity: usize) -> Result<(Self, Self)> {
        if capacity == 0 {
            return Err(Error::Config("mmap capacity must be non-zero".to_string()));
        }
        let path_err = |source: io::Error| Error::Path {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(path_err)?;
        file.set_len(capacity as u64).map_err(path_err)?;

        let reader = Self::map_reader(&file, path).map_err(path_err)?;
        let writer = Self::map_writer(&file, path).map_err(path_err)?;
        debug!(path = %path.display(), capacity, "Mmap channel pair mapped");
        Ok((reader, writer))
    }

    fn map_reader(file: &File, path: &Path) -> io::Result<Self> {
        // SAFETY: the file was sized above and is only resized again by
        // `close`, after both mappings are gone.
        let map = unsafe { Mmap::map(file) }?;
        Ok(Self {
            map: Mapping::Reader(map),
            cursor: 0,
            path: path.to_path_buf(),
        })
    }

    fn map_writer(file: &File, path: &Path) -> io::Result<Self> {
        // SAFETY: as for the reader mapping.
        let map = unsafe { MmapMut::map_mut(file) }?;
        Ok(Self {
            map: Mapping::Writer(map),
            cursor: 0,
            path: path.to_path_buf(),
        })
    }

    fn check_room(&self, needed: usize) -> Result<()> {
        let capacity = self.map.bytes().len();
        if self.cursor + needed > capacity {
            return Err(Error::Capacity {
                needed: (self.cursor + needed) as u64,
                capacity: capacity as u64,
            });
        }
        Ok(())
    }
}

impl Channel for MmapChannel {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_room(data.len())?;
        let Mapping::Writer(map) = &mut self.map else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "reader mapping is read-only",
            )));
        };

        let offset = self.cursor;
        map[offset..offset + data.len()].copy_from_slice(data);
        map.flush_range(offset, data.len())
            .map_err(|source| Error::Path {
                path: self.path.clone(),
                source,
            })?;
        self.cursor += data.len();
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.check_room(buffer.len())?;
        let offset = self.cursor;
        buffer.copy_from_slice(&self.map.bytes()[offset..offset + buffer.len()]);
        self.cursor += buffer.len();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn close(self) -> Result<()> {
        let Self { map, path, .. } = self;
        drop(map);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Path { path, source }),
        }
    }

    fn capacity(&self) -> u64 {
        self.map.bytes().len() as u64
    }

    fn role(&self) -> Role {
        match self.map {
            Mapping::Reader(_) => Role::Reader,
            Mapping::Writer(_) => Role::Writer,
        }
    }
}
