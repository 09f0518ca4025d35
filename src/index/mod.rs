//! Persistent index implementations.
//!
//! Two implementations share the postings/dictionary codec:
//!
//! - [`persistent::PersistentIndex`]: buffers everything in memory and
//!   writes a single block at cleanup. Suited to corpora that fit in
//!   RAM.
//! - [`scalable::ScalableIndex`]: rotates the in-memory buffer into
//!   sealed blocks and merges them in the background while ingestion
//!   continues.

pub mod persistent;
pub mod scalable;

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockReader};
use crate::config::IndexConfig;
use crate::dictionary;
use crate::error::{CallunaError, Result};
use crate::postings::PostingsList;

/// Canonical dictionary file name.
pub const DICT_FILE: &str = "index.dict";

/// Canonical data file name.
pub const DATA_FILE: &str = "index.dat";

/// Document metadata file name.
pub const DOCINFO_FILE: &str = "index.docs";

/// Index metadata file name.
pub const METADATA_FILE: &str = "metadata.json";

/// The ingestion and lookup contract shared by all index
/// implementations. Upstream tokenizers feed `insert` and
/// `add_document`; the search layer reads through `get_postings`.
pub trait TermIndex {
    /// Record one occurrence of `term` at token offset `offset` in
    /// document `doc_id`. Invalid input (empty term, term too long for
    /// a dictionary slot) is dropped, not errored.
    fn insert(&mut self, term: &str, doc_id: u32, offset: u32);

    /// Record a document's name and token length.
    fn add_document(&mut self, doc_id: u32, name: &str, length: u32);

    /// Fetch the postings list for a term, or `None` if absent.
    fn get_postings(&self, term: &str) -> Result<Option<PostingsList>>;

    /// End ingestion and persist the index. Must be called exactly
    /// once; afterwards `insert` calls are dropped and a second call
    /// errors. Finalization I/O failures surface here.
    fn cleanup(&mut self) -> Result<()>;
}

/// Corpus-level metadata written at finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Number of documents in the corpus.
    pub doc_count: u64,

    /// Incremented on every finalization of this directory.
    pub generation: u64,

    /// Unix timestamp of the last finalization.
    pub modified: u64,
}

impl IndexMetadata {
    /// Read metadata from the index directory, if present and parsable.
    pub fn read(dir: &Path) -> Option<Self> {
        let data = fs::read_to_string(dir.join(METADATA_FILE)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Write metadata into the index directory.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CallunaError::index(format!("failed to serialize metadata: {e}")))?;
        fs::write(dir.join(METADATA_FILE), json)?;
        Ok(())
    }

    /// Bump generation and refresh the timestamp for a new
    /// finalization.
    pub fn next(previous: Option<IndexMetadata>, doc_count: u64) -> Self {
        let generation = previous.map(|m| m.generation + 1).unwrap_or(0);
        let modified = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        IndexMetadata {
            doc_count,
            generation,
            modified,
        }
    }
}

/// Whether a term may enter the index: non-empty, free of the slot
/// separator, and short enough to fit a dictionary slot.
pub(crate) fn valid_term(term: &str, slot_size: u64) -> bool {
    if term.is_empty() || term.contains('|') {
        return false;
    }
    if term.len() > dictionary::max_term_len(slot_size) {
        warn!(
            "dropping term of {} bytes: exceeds the {}-byte slot budget",
            term.len(),
            slot_size
        );
        return false;
    }
    true
}

/// Rename a block's files to the canonical index file names, replacing
/// any previous canonical files.
pub(crate) fn promote_block(block: &Block, dir: &Path) -> Result<()> {
    let dict_target = dir.join(DICT_FILE);
    let data_target = dir.join(DATA_FILE);
    remove_if_present(&dict_target)?;
    remove_if_present(&data_target)?;
    fs::rename(&block.dict_path, &dict_target)?;
    fs::rename(&block.data_path, &data_target)?;
    debug!("promoted block {} to the canonical index files", block.id);
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open a reader over the canonical index files, if they exist.
pub(crate) fn open_canonical_reader(config: &IndexConfig) -> Result<Option<BlockReader>> {
    let dict_path = config.index_dir.join(DICT_FILE);
    let data_path = config.index_dir.join(DATA_FILE);
    if !dict_path.exists() || !data_path.exists() {
        return Ok(None);
    }
    let reader = BlockReader::open(&dict_path, &data_path, config.slot_size, config.table_size)?;
    Ok(Some(reader))
}

/// Delete leftover block files from an interrupted previous run. A
/// crashed merge may leave partial combined blocks behind; anything
/// not promoted to the canonical files is garbage on reopen.
pub(crate) fn sweep_stale_blocks(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(crate::block::BLOCK_PREFIX)
            && (name.ends_with(".dict") || name.ends_with(".dat"))
        {
            warn!("removing stale block file from a previous run: {name}");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
