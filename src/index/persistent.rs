//! Single-block persistent index.
//!
//! The simple strategy: every posting is buffered in one in-memory
//! term map, and `cleanup` writes the whole map as a single block that
//! is immediately promoted to the canonical index files. No background
//! merging is involved. Shares the postings/dictionary codec with the
//! scalable index.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use log::{debug, info};
use parking_lot::Mutex;

use crate::block::{BlockReader, BlockWriter};
use crate::config::IndexConfig;
use crate::docinfo::{DocInfo, DocumentStore};
use crate::error::{CallunaError, Result};
use crate::index::{self, IndexMetadata, TermIndex};
use crate::postings::PostingsList;

/// An inverted index kept fully in memory during ingestion and
/// committed to disk as one block at cleanup.
pub struct PersistentIndex {
    config: IndexConfig,
    buffer: AHashMap<String, PostingsList>,
    docs: DocumentStore,
    reader: Mutex<Option<BlockReader>>,
    next_block_id: AtomicU64,
    postings_added: u64,
    closed: bool,
}

impl PersistentIndex {
    /// Open an index directory, creating it if needed. If a previous
    /// run finalized an index here, its canonical files and document
    /// metadata become readable immediately.
    pub fn open(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.index_dir)?;
        index::sweep_stale_blocks(&config.index_dir)?;

        let docinfo_path = config.index_dir.join(index::DOCINFO_FILE);
        let docs = if docinfo_path.exists() {
            DocumentStore::read(&docinfo_path)?
        } else {
            DocumentStore::new()
        };
        let reader = index::open_canonical_reader(&config)?;
        if reader.is_some() {
            debug!("reopened canonical index in {:?}", config.index_dir);
        }

        Ok(PersistentIndex {
            config,
            buffer: AHashMap::new(),
            docs,
            reader: Mutex::new(reader),
            next_block_id: AtomicU64::new(0),
            postings_added: 0,
            closed: false,
        })
    }

    /// Document metadata recorded so far (or reloaded from disk).
    pub fn doc_info(&self, doc_id: u32) -> Option<DocInfo> {
        self.docs.get(doc_id).cloned()
    }

    /// Number of documents known to the index.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

impl TermIndex for PersistentIndex {
    fn insert(&mut self, term: &str, doc_id: u32, offset: u32) {
        if self.closed || !index::valid_term(term, self.config.slot_size) {
            return;
        }
        self.buffer
            .entry(term.to_string())
            .or_default()
            .add(doc_id, 0.0, offset);
        self.postings_added += 1;
    }

    fn add_document(&mut self, doc_id: u32, name: &str, length: u32) {
        self.docs.add(doc_id, name, length);
    }

    fn get_postings(&self, term: &str) -> Result<Option<PostingsList>> {
        if let Some(list) = self.buffer.get(term) {
            return Ok(Some(list.clone()));
        }
        let mut reader = self.reader.lock();
        match reader.as_mut() {
            Some(reader) => reader.lookup(term),
            None => Ok(None),
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.closed {
            return Err(CallunaError::index("cleanup was already called"));
        }
        self.closed = true;
        info!(
            "writing index to disk: {} unique terms, {} postings",
            self.buffer.len(),
            self.postings_added
        );

        if !self.buffer.is_empty() {
            let id = self.next_block_id.fetch_add(1, Ordering::SeqCst);
            let mut writer = BlockWriter::create(
                &self.config.index_dir,
                id,
                self.config.slot_size,
                self.config.table_size,
            )?;
            let mut terms: Vec<&String> = self.buffer.keys().collect();
            terms.sort();
            for term in terms {
                writer.write_list(term, &self.buffer[term])?;
            }
            let block = writer.finish()?;
            index::promote_block(&block, &self.config.index_dir)?;
            self.buffer.clear();
        }

        self.docs.write(&self.config.index_dir.join(index::DOCINFO_FILE))?;
        let metadata = IndexMetadata::next(
            IndexMetadata::read(&self.config.index_dir),
            self.docs.len() as u64,
        );
        metadata.write(&self.config.index_dir)?;

        *self.reader.lock() = index::open_canonical_reader(&self.config)?;
        info!("index finalized in {:?}", self.config.index_dir);
        Ok(())
    }
}

impl Drop for PersistentIndex {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cleanup();
        }
    }
}

impl std::fmt::Debug for PersistentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentIndex")
            .field("config", &self.config)
            .field("buffered_terms", &self.buffer.len())
            .field("doc_count", &self.docs.len())
            .field("closed", &self.closed)
            .finish()
    }
}
