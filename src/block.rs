//! Blocks: immutable (dictionary, data) file pairs.
//!
//! A block is produced once by sealing an in-memory buffer (or by
//! merging two older blocks), read back only by the merge engine, and
//! deleted after it has been merged away. The single surviving block is
//! promoted to the canonical index files at finalization.

use std::fs;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use log::{debug, warn};

use crate::datafile::DataFile;
use crate::dictionary::{DictEntry, Dictionary};
use crate::error::Result;
use crate::postings::PostingsList;

/// Prefix of every block file name in the index directory.
pub const BLOCK_PREFIX: &str = "block_";

/// Handle to one block's files. The block ID is globally unique within
/// one ingestion run; merged blocks get fresh IDs from the same counter
/// that numbers sealed blocks.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block number.
    pub id: u64,

    /// Path of the dictionary file.
    pub dict_path: PathBuf,

    /// Path of the data file.
    pub data_path: PathBuf,
}

impl Block {
    /// Build the handle for block `id` under `dir`.
    pub fn new(dir: &Path, id: u64) -> Self {
        Block {
            id,
            dict_path: dir.join(format!("{BLOCK_PREFIX}{id:06}.dict")),
            data_path: dir.join(format!("{BLOCK_PREFIX}{id:06}.dat")),
        }
    }

    /// Delete both files of this block.
    pub fn delete(&self) -> Result<()> {
        fs::remove_file(&self.dict_path)?;
        fs::remove_file(&self.data_path)?;
        debug!("deleted block {}", self.id);
        Ok(())
    }
}

/// Writes one block: serialized postings into the data file, entries
/// into the dictionary via probing.
pub struct BlockWriter {
    block: Block,
    dictionary: Dictionary,
    data: DataFile,
    terms_written: u64,
}

impl BlockWriter {
    /// Create the files for a fresh block.
    pub fn create(dir: &Path, id: u64, slot_size: u64, table_size: u64) -> Result<Self> {
        let block = Block::new(dir, id);
        let dictionary = Dictionary::open(&block.dict_path, slot_size, table_size)?;
        let data = DataFile::open(&block.data_path)?;
        Ok(BlockWriter {
            block,
            dictionary,
            data,
            terms_written: 0,
        })
    }

    /// Write one term's postings list and its dictionary entry.
    pub fn write_list(&mut self, term: &str, list: &PostingsList) -> Result<()> {
        let encoded = list.encode();
        let (offset, length) = self.data.append(encoded.as_bytes())?;
        self.dictionary.write_entry(&DictEntry {
            term: term.to_string(),
            offset,
            length,
        })?;
        self.terms_written += 1;
        Ok(())
    }

    /// Sync both files and seal the block.
    pub fn finish(mut self) -> Result<Block> {
        self.dictionary.sync()?;
        self.data.sync()?;
        debug!(
            "sealed block {} ({} terms, {} data bytes, {} dictionary collisions)",
            self.block.id,
            self.terms_written,
            self.data.free(),
            self.dictionary.collisions()
        );
        Ok(self.block)
    }
}

/// Reads a sealed block (or the canonical index files, which share the
/// same layout).
pub struct BlockReader {
    dictionary: Dictionary,
    data: DataFile,
}

impl BlockReader {
    /// Open an existing dictionary/data file pair.
    pub fn open(dict_path: &Path, data_path: &Path, slot_size: u64, table_size: u64) -> Result<Self> {
        let dictionary = Dictionary::open(dict_path, slot_size, table_size)?;
        let data = DataFile::open(data_path)?;
        Ok(BlockReader { dictionary, data })
    }

    /// Stream the full dictionary into a term -> entry map.
    pub fn scan_terms(&mut self) -> Result<AHashMap<String, DictEntry>> {
        self.dictionary.scan()
    }

    /// Read and decode the postings list recorded by `entry`. A region
    /// that fails to decode is reported as absent, never as fatal: a
    /// partially written list from an interrupted process must not
    /// poison readers.
    pub fn read_list(&mut self, entry: &DictEntry) -> Result<Option<PostingsList>> {
        let bytes = match self.data.read(entry.offset, entry.length)? {
            Some(bytes) => bytes,
            None => {
                warn!("postings region for {:?} is truncated", entry.term);
                return Ok(None);
            }
        };
        let text = match std::str::from_utf8(&bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("postings for {:?} are not valid UTF-8: {e}", entry.term);
                return Ok(None);
            }
        };
        match PostingsList::decode(text) {
            Ok(list) => Ok(Some(list)),
            Err(e) => {
                warn!("postings for {:?} failed to decode: {e}", entry.term);
                Ok(None)
            }
        }
    }

    /// Look a term up in the dictionary and read its postings list.
    pub fn lookup(&mut self, term: &str) -> Result<Option<PostingsList>> {
        match self.dictionary.lookup(term)? {
            Some(entry) => self.read_list(&entry),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("dictionary", &self.dictionary)
            .field("data", &self.data)
            .finish()
    }
}
