//! Byte-addressed storage behind the swap extent.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A fixed-size extent of bytes. Slot contents mean nothing to the store.
pub trait BackingStore: Send {
    /// Fills `buf` from the bytes starting at `offset`.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()>;
    /// Stores `buf` at `offset`.
    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()>;
    /// Size of the extent in bytes.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Deletes the extent. The store must not be used afterwards.
    fn remove(&mut self) -> io::Result<()>;
}

fn check_bounds(offset: usize, len: usize, extent: usize) -> io::Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= extent => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{len} bytes at offset {offset} run past a {extent}-byte extent"),
        )),
    }
}

/// Swap extent kept in a host file, created at kernel initialization.
pub struct FileStore {
    path: PathBuf,
    file: Option<File>,
    len: usize,
}

impl FileStore {
    /// Creates (or truncates) the file at `path` and sizes it to `len` bytes.
    pub fn open(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;
        log::debug!("opened swap file {} ({} bytes)", path.display(), len);

        Ok(Self {
            path,
            file: Some(file),
            len,
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "swap file already removed"))
    }
}

impl BackingStore for FileStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(buf)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn remove(&mut self) -> io::Result<()> {
        if self.file.take().is_some() {
            fs::remove_file(&self.path)?;
            log::debug!("removed swap file {}", self.path.display());
        }
        Ok(())
    }
}

/// Swap extent in host memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }
}

impl BackingStore for MemoryStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.bytes.len())?;
        self.bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn remove(&mut self) -> io::Result<()> {
        self.bytes.clear();
        Ok(())
    }
}
