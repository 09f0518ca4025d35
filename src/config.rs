//! Configuration for persistent indexes.

use std::path::PathBuf;
use std::time::Duration;

use crate::dictionary;
use crate::error::{CallunaError, Result};

/// Configuration shared by all persistent index implementations.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Directory where index files are stored.
    pub index_dir: PathBuf,

    /// Number of distinct terms buffered in memory before a block is
    /// sealed to disk. Only used by the scalable (multi-block) index.
    pub block_size: usize,

    /// Width in bytes of one dictionary slot. Terms longer than the
    /// slot width minus the metadata reserve are dropped at insert.
    pub slot_size: u64,

    /// Number of slots in the dictionary hash space. A large prime
    /// keeps clustering low.
    pub table_size: u64,

    /// How long the merge coordinator waits for a newly sealed block
    /// before re-checking its shutdown state.
    pub merge_poll_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            index_dir: PathBuf::from("./index"),
            block_size: 50_000,
            slot_size: 200,
            // The 100,000th prime.
            table_size: 611_953,
            merge_poll_interval: Duration::from_millis(500),
        }
    }
}

impl IndexConfig {
    /// Create a configuration rooted at the given directory with all
    /// other settings at their defaults.
    pub fn new<P: Into<PathBuf>>(index_dir: P) -> Self {
        IndexConfig {
            index_dir: index_dir.into(),
            ..Default::default()
        }
    }

    /// Check the configuration for degenerate values.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CallunaError::config("block_size must be at least 1"));
        }
        if self.table_size == 0 {
            return Err(CallunaError::config("table_size must be at least 1"));
        }
        if dictionary::max_term_len(self.slot_size) == 0 {
            return Err(CallunaError::config(format!(
                "slot_size {} leaves no room for a term after entry metadata",
                self.slot_size
            )));
        }
        Ok(())
    }
}
