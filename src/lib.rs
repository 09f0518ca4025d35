//! # Calluna
//!
//! A persistent, block-based, mergeable hashed inverted index for text
//! search.
//!
//! Calluna accepts `(term, doc_id, offset)` triples from an external
//! tokenizer and persists them as a disk-resident hash index that a
//! search component queries for postings lists.
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Fixed-slot on-disk hash dictionary with linear probing
//! - In-memory write buffer with block rotation
//! - Concurrent background block merging during ingestion
//! - Single-block and multi-block index strategies sharing one codec
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use calluna::{IndexConfig, ScalableIndex, TermIndex};
//!
//! let mut index = ScalableIndex::create(IndexConfig::new("./index")).unwrap();
//! index.start();
//!
//! index.add_document(0, "corpus/a.txt", 2);
//! index.insert("hello", 0, 0);
//! index.insert("world", 0, 1);
//! index.cleanup().unwrap();
//!
//! let postings = index.get_postings("hello").unwrap();
//! assert!(postings.is_some());
//! ```

// Core modules
pub mod block;
pub mod config;
pub mod datafile;
pub mod dictionary;
pub mod docinfo;
mod error;
pub mod index;
pub mod merge;
pub mod postings;

// Re-exports for the public API
pub use config::IndexConfig;
pub use docinfo::{DocInfo, DocumentStore};
pub use error::{CallunaError, Result};
pub use index::persistent::PersistentIndex;
pub use index::scalable::{IndexStats, ScalableIndex};
pub use index::{IndexMetadata, TermIndex};
pub use postings::{PostingsEntry, PostingsList};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
