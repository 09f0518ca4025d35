//! Fixed-slot on-disk hash dictionary.
//!
//! The dictionary file is a sequence of fixed-width slots. A term hashes
//! to a slot address inside a virtual space of `slot_size * table_size`
//! bytes; collisions are resolved by linear probing, advancing one slot
//! at a time. Probes never wrap: the virtual space is large enough that
//! the file simply grows past it in the worst case, and a read past the
//! end of the file decodes as an empty slot.
//!
//! An occupied slot encodes `term|offset|length|` padded with `_` filler
//! bytes to the slot width. Any slot that fails to decode (all zeroes,
//! truncated by interruption mid-write, garbage) is treated as absent,
//! never as fatal.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use ahash::AHashMap;

use crate::error::{CallunaError, Result};

const SEPARATOR: u8 = b'|';
const FILLER: u8 = b'_';

/// Bytes of each slot reserved for the offset/length metadata and its
/// separators. A u64 offset and u32 length in decimal, three
/// separators, plus slack.
const META_RESERVE: u64 = 40;

/// Longest term (in bytes) that fits a slot of the given width.
pub(crate) fn max_term_len(slot_size: u64) -> usize {
    (slot_size.saturating_sub(META_RESERVE)) as usize
}

/// One dictionary record: where a term's serialized postings list lives
/// in the companion data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    /// The term this entry belongs to.
    pub term: String,

    /// Byte offset of the serialized postings list in the data file.
    pub offset: u64,

    /// Byte length of the serialized postings list. Caps a single
    /// region at `u32::MAX` bytes; `DataFile::append` enforces this.
    pub length: u32,
}

/// An open dictionary file.
pub struct Dictionary {
    file: File,
    slot_size: u64,
    table_size: u64,
    collisions: u64,
}

impl Dictionary {
    /// Open (or create) a dictionary file.
    pub fn open(path: &Path, slot_size: u64, table_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Dictionary {
            file,
            slot_size,
            table_size,
            collisions: 0,
        })
    }

    /// Number of occupied slots skipped over by probes so far.
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Map a term to its home slot address. FNV-1a over the term bytes,
    /// reduced to a slot index, scaled to a byte address. Deterministic
    /// across processes so a reopened index probes the same chain.
    fn hash(&self, term: &str) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in term.as_bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (h % self.table_size) * self.slot_size
    }

    fn encode_entry(&self, entry: &DictEntry) -> Option<Vec<u8>> {
        let meta = format!("|{}|{}|", entry.offset, entry.length);
        if entry.term.len() + meta.len() > self.slot_size as usize {
            return None;
        }
        let mut buf = Vec::with_capacity(self.slot_size as usize);
        buf.extend_from_slice(entry.term.as_bytes());
        buf.extend_from_slice(meta.as_bytes());
        buf.resize(self.slot_size as usize, FILLER);
        Some(buf)
    }

    fn decode_slot(buf: &[u8]) -> Option<DictEntry> {
        let mut parts = buf.split(|&b| b == SEPARATOR);
        let term = parts.next()?;
        let offset = parts.next()?;
        let length = parts.next()?;
        // A valid record has a third separator before the filler.
        parts.next()?;

        if term.is_empty() {
            return None;
        }
        let term = std::str::from_utf8(term).ok()?.to_string();
        let offset = std::str::from_utf8(offset).ok()?.parse::<u64>().ok()?;
        let length = std::str::from_utf8(length).ok()?.parse::<u32>().ok()?;
        Some(DictEntry {
            term,
            offset,
            length,
        })
    }

    /// Read the slot at `ptr`. Returns `None` for empty, unparsable, or
    /// past-end slots.
    pub fn read_entry(&mut self, ptr: u64) -> Result<Option<DictEntry>> {
        let len = self.file.metadata()?.len();
        if ptr + self.slot_size > len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(ptr))?;
        let mut buf = vec![0u8; self.slot_size as usize];
        self.file.read_exact(&mut buf)?;
        Ok(Self::decode_slot(&buf))
    }

    /// Write an entry at the first empty slot on its probe chain.
    pub fn write_entry(&mut self, entry: &DictEntry) -> Result<()> {
        let encoded = self.encode_entry(entry).ok_or_else(|| {
            CallunaError::index(format!(
                "term of {} bytes does not fit a {}-byte dictionary slot",
                entry.term.len(),
                self.slot_size
            ))
        })?;

        let mut ptr = self.hash(&entry.term);
        while self.read_entry(ptr)?.is_some() {
            ptr += self.slot_size;
            self.collisions += 1;
        }

        self.file.seek(SeekFrom::Start(ptr))?;
        self.file.write_all(&encoded)?;
        Ok(())
    }

    /// Look up a term by probing forward from its home slot until the
    /// term matches (hit) or an empty slot is found (miss). Insertion
    /// leaves no gaps in a probe chain, so an empty slot proves absence.
    pub fn lookup(&mut self, term: &str) -> Result<Option<DictEntry>> {
        let mut ptr = self.hash(term);
        loop {
            match self.read_entry(ptr)? {
                None => return Ok(None),
                Some(entry) if entry.term == term => return Ok(Some(entry)),
                Some(_) => ptr += self.slot_size,
            }
        }
    }

    /// Sequentially scan every slot to end-of-file, collecting all
    /// decodable entries. Used by the merge engine to stream a sealed
    /// block's full term set.
    pub fn scan(&mut self) -> Result<AHashMap<String, DictEntry>> {
        let len = self.file.metadata()?.len();
        let mut entries = AHashMap::new();
        let mut ptr = 0;
        while ptr + self.slot_size <= len {
            self.file.seek(SeekFrom::Start(ptr))?;
            let mut buf = vec![0u8; self.slot_size as usize];
            self.file.read_exact(&mut buf)?;
            if let Some(entry) = Self::decode_slot(&buf) {
                entries.insert(entry.term.clone(), entry);
            }
            ptr += self.slot_size;
        }
        Ok(entries)
    }

    /// Flush buffered writes and sync file contents to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary")
            .field("slot_size", &self.slot_size)
            .field("table_size", &self.table_size)
            .field("collisions", &self.collisions)
            .finish()
    }
}
