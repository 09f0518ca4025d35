//! Document metadata: doc ID -> (name, length in tokens).
//!
//! Owned by the engine, never part of block merging. Written once at
//! finalization so it reflects the final document set, read back when
//! an index directory is reopened. One line per document:
//! `docID;name;length`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use ahash::AHashMap;
use log::warn;

use crate::error::Result;

/// Name and token count of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocInfo {
    /// Document name (typically a file path).
    pub name: String,

    /// Document length in tokens.
    pub length: u32,
}

/// In-memory map of document metadata.
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    docs: AHashMap<u32, DocInfo>,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        DocumentStore::default()
    }

    /// Number of documents recorded.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether no documents are recorded.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Record (or overwrite) one document's metadata.
    pub fn add(&mut self, doc_id: u32, name: &str, length: u32) {
        self.docs.insert(
            doc_id,
            DocInfo {
                name: name.to_string(),
                length,
            },
        );
    }

    /// Metadata for one document.
    pub fn get(&self, doc_id: u32) -> Option<&DocInfo> {
        self.docs.get(&doc_id)
    }

    /// Doc ID -> length map, as the scoring helpers expect it.
    pub fn doc_lengths(&self) -> AHashMap<u32, u32> {
        self.docs.iter().map(|(&id, d)| (id, d.length)).collect()
    }

    /// Write the store to `path`, one line per document, sorted by
    /// doc ID for deterministic output.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut ids: Vec<&u32> = self.docs.keys().collect();
        ids.sort();
        for id in ids {
            let info = &self.docs[id];
            writeln!(writer, "{id};{};{}", info.name, info.length)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a store back from `path`. Malformed lines are skipped.
    pub fn read(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut store = DocumentStore::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            // Names may contain ';', so split the ID off the front and
            // the length off the back.
            let parsed = line.split_once(';').and_then(|(id, rest)| {
                let (name, length) = rest.rsplit_once(';')?;
                Some((id.parse::<u32>().ok()?, name, length.parse::<u32>().ok()?))
            });
            match parsed {
                Some((doc_id, name, length)) => store.add(doc_id, name, length),
                None => warn!("skipping malformed document metadata line: {line:?}"),
            }
        }
        Ok(store)
    }
}
