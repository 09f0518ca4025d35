//! Append-only data file holding serialized postings lists.
//!
//! Lists are written back to back at offsets handed out by a free
//! cursor; the dictionary records where each one lives. A single
//! separator byte follows every list.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CallunaError, Result};

const SEPARATOR: u8 = b'\n';

/// An open data file with its write cursor.
pub struct DataFile {
    file: File,
    free: u64,
}

impl DataFile {
    /// Open (or create) a data file. The write cursor starts at the
    /// current end of the file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let free = file.metadata()?.len();
        Ok(DataFile { file, free })
    }

    /// Offset of the first free byte.
    pub fn free(&self) -> u64 {
        self.free
    }

    /// Append one serialized list, returning its (offset, length). The
    /// cursor advances past the list and its separator byte. Regions
    /// are bounded by the u32 length a dictionary entry can record.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(u64, u32)> {
        let length = u32::try_from(bytes.len()).map_err(|_| {
            CallunaError::index("serialized postings list exceeds the data region size limit")
        })?;
        let offset = self.free;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.write_all(&[SEPARATOR])?;
        self.free += length as u64 + 1;
        Ok((offset, length))
    }

    /// Read back the region recorded by a dictionary entry. A region
    /// that extends past the end of the file was never fully written;
    /// it reads as absent, never as an error.
    pub fn read(&mut self, offset: u64, length: u32) -> Result<Option<Vec<u8>>> {
        let len = self.file.metadata()?.len();
        if offset + length as u64 > len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        self.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Flush buffered writes and sync file contents to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile").field("free", &self.free).finish()
    }
}
