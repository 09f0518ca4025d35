//! Multi-block index with background merging.
//!
//! Ingestion fills an in-memory term map; once the map holds
//! `block_size` distinct terms it is sealed to disk as a block and
//! handed to the merge engine, and a fresh block begins immediately.
//! Sealing is synchronous inside the builder, merging is fully
//! asynchronous: ingestion never waits for the merge engine.
//!
//! `cleanup` flushes any residual buffer as one final block, drains the
//! merge engine until a single block survives, promotes it to the
//! canonical index files, and persists document metadata.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::block::{BlockReader, BlockWriter};
use crate::config::IndexConfig;
use crate::docinfo::{DocInfo, DocumentStore};
use crate::error::{CallunaError, Result};
use crate::index::{self, IndexMetadata, TermIndex};
use crate::merge::MergeEngine;
use crate::postings::PostingsList;

/// Counters describing an ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Postings accepted by `insert`.
    pub postings_added: u64,

    /// Terms dropped for being invalid or over the slot budget.
    pub terms_dropped: u64,

    /// Blocks sealed to disk (not counting merge outputs).
    pub blocks_sealed: u32,

    /// Documents registered via `add_document`.
    pub docs_added: u64,
}

/// A block-rotating inverted index with concurrent background merging.
pub struct ScalableIndex {
    config: Arc<IndexConfig>,
    buffer: AHashMap<String, PostingsList>,
    current: Option<BlockWriter>,
    docs: DocumentStore,
    engine: Option<MergeEngine>,
    next_block_id: Arc<AtomicU64>,
    reader: Mutex<Option<BlockReader>>,
    stats: IndexStats,
    closed: bool,
}

impl ScalableIndex {
    /// Open an index directory, creating it if needed. Stale block
    /// files from an interrupted previous run are removed; a
    /// previously finalized canonical index becomes readable
    /// immediately. No background thread is spawned here; call
    /// [`start`](Self::start) for that.
    pub fn create(config: IndexConfig) -> Result<Self> {
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

        Ok(ScalableIndex {
            config: Arc::new(config),
            buffer: AHashMap::new(),
            current: None,
            docs,
            engine: None,
            next_block_id: Arc::new(AtomicU64::new(0)),
            reader: Mutex::new(reader),
            stats: IndexStats::default(),
            closed: false,
        })
    }

    /// Spawn the background merge engine. Idempotent. Sealing a block
    /// starts the engine implicitly if this was never called.
    pub fn start(&mut self) {
        if self.engine.is_none() {
            info!("starting merge engine");
            self.engine = Some(MergeEngine::start(
                self.config.clone(),
                self.next_block_id.clone(),
            ));
        }
    }

    /// Counters for this ingestion run.
    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    /// Number of documents known to the index.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Metadata for one document.
    pub fn doc_info(&self, doc_id: u32) -> Option<DocInfo> {
        self.docs.get(doc_id).cloned()
    }

    /// Allocate the current block's files if none are open yet.
    fn ensure_block(&mut self) -> Result<()> {
        if self.current.is_none() {
            let id = self.next_block_id.fetch_add(1, Ordering::SeqCst);
            let writer = BlockWriter::create(
                &self.config.index_dir,
                id,
                self.config.slot_size,
                self.config.table_size,
            )?;
            debug!("opened block {id}");
            self.current = Some(writer);
        }
        Ok(())
    }

    /// Seal the current block: serialize every buffered postings list
    /// into the block's files and push the block to the merge queue.
    fn seal_block(&mut self) -> Result<()> {
        self.ensure_block()?;
        let mut writer = self
            .current
            .take()
            .ok_or_else(|| CallunaError::index("no open block to seal"))?;

        let mut terms: Vec<&String> = self.buffer.keys().collect();
        terms.sort();
        for term in terms {
            writer.write_list(term, &self.buffer[term])?;
        }
        let block = writer.finish()?;
        info!("sealed block {} with {} terms", block.id, self.buffer.len());
        self.buffer.clear();
        self.stats.blocks_sealed += 1;

        self.start();
        if let Some(engine) = &self.engine {
            engine.enqueue(block);
        }
        Ok(())
    }
}

impl TermIndex for ScalableIndex {
    fn insert(&mut self, term: &str, doc_id: u32, offset: u32) {
        if self.closed {
            return;
        }
        if !index::valid_term(term, self.config.slot_size) {
            self.stats.terms_dropped += 1;
            return;
        }
        if let Err(e) = self.ensure_block() {
            error!("failed to open a new block: {e}");
            return;
        }

        self.buffer
            .entry(term.to_string())
            .or_default()
            .add(doc_id, 0.0, offset);
        self.stats.postings_added += 1;

        if self.buffer.len() >= self.config.block_size {
            if let Err(e) = self.seal_block() {
                // Keep the buffer; sealing is retried on the next
                // insert and again at cleanup.
                error!("failed to seal block: {e}");
            }
        }
    }

    fn add_document(&mut self, doc_id: u32, name: &str, length: u32) {
        self.docs.add(doc_id, name, length);
        self.stats.docs_added += 1;
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
            "finishing ingestion: {} postings, {} blocks sealed, {} residual terms",
            self.stats.postings_added,
            self.stats.blocks_sealed,
            self.buffer.len()
        );

        // A residual buffer smaller than one block still holds data;
        // flush it before draining so nothing is dropped.
        if !self.buffer.is_empty() {
            self.seal_block()?;
        }

        let survivor = match self.engine.take() {
            Some(engine) => engine.finish()?,
            None => None,
        };
        if let Some(block) = survivor {
            index::promote_block(&block, &self.config.index_dir)?;
        }

        self.docs
            .write(&self.config.index_dir.join(index::DOCINFO_FILE))?;
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

impl Drop for ScalableIndex {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cleanup();
        }
    }
}

impl std::fmt::Debug for ScalableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalableIndex")
            .field("config", &self.config)
            .field("buffered_terms", &self.buffer.len())
            .field("stats", &self.stats)
            .field("closed", &self.closed)
            .finish()
    }
}
