//! In-memory postings model and its data-file codec.
//!
//! A [`PostingsList`] holds every document a term occurs in, sorted by
//! document ID; each [`PostingsEntry`] holds the token positions of the
//! term within one document, sorted ascending with duplicates discarded.
//! Both invariants are maintained by binary-search insertion so that
//! block-sized lists never pay for linear scans.
//!
//! ## Data-file encoding
//!
//! A list serializes as the concatenation of its entries, each encoded
//! as `docID;score[p0,p1,...]`. The score is carried through the codec
//! but is not authoritative on disk; it is recomputed from the position
//! count, corpus size, and document length during ranking.

use ahash::AHashMap;

use crate::error::{CallunaError, Result};

/// One document's occurrences of one term.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingsEntry {
    /// Identifier of the document.
    pub doc_id: u32,

    /// Ranking score; only meaningful after `compute_score`.
    pub score: f64,

    /// Token offsets of the term within the document, strictly
    /// increasing.
    positions: Vec<u32>,
}

impl PostingsEntry {
    /// Create an entry with no positions yet.
    pub fn new(doc_id: u32, score: f64) -> Self {
        PostingsEntry {
            doc_id,
            score,
            positions: Vec::new(),
        }
    }

    /// Token positions, sorted ascending.
    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Number of occurrences of the term in this document.
    pub fn term_frequency(&self) -> usize {
        self.positions.len()
    }

    /// Insert a position, keeping the sequence sorted. Duplicates are
    /// discarded.
    pub fn add_position(&mut self, position: u32) {
        if let Err(idx) = self.positions.binary_search(&position) {
            self.positions.insert(idx, position);
        }
    }

    /// Union the positions of `other` into this entry. Both entries
    /// must describe the same document; mismatched IDs are ignored.
    pub fn merge(&mut self, other: &PostingsEntry) {
        if self.doc_id != other.doc_id {
            return;
        }
        for &position in &other.positions {
            self.add_position(position);
        }
    }

    /// Set `score = tf * idf / doc_len` where `tf` is the number of
    /// positions.
    pub fn compute_score(&mut self, idf: f64, doc_len: u32) {
        let tf = self.positions.len() as f64;
        self.score = tf * idf / doc_len as f64;
    }

    fn encode_into(&self, out: &mut String) {
        use std::fmt::Write;

        let _ = write!(out, "{};{}[", self.doc_id, self.score);
        for (i, position) in self.positions.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{position}");
        }
        out.push(']');
    }

    fn decode(input: &str) -> Result<Self> {
        let (doc_part, rest) = input
            .split_once(';')
            .ok_or_else(|| CallunaError::index(format!("malformed postings entry: {input:?}")))?;
        let (score_part, pos_part) = rest
            .split_once('[')
            .ok_or_else(|| CallunaError::index(format!("malformed postings entry: {input:?}")))?;

        let doc_id = doc_part
            .parse::<u32>()
            .map_err(|e| CallunaError::index(format!("bad doc ID {doc_part:?}: {e}")))?;
        let score = score_part
            .parse::<f64>()
            .map_err(|e| CallunaError::index(format!("bad score {score_part:?}: {e}")))?;

        let mut entry = PostingsEntry::new(doc_id, score);
        if !pos_part.is_empty() {
            for token in pos_part.split(',') {
                let position = token
                    .parse::<u32>()
                    .map_err(|e| CallunaError::index(format!("bad position {token:?}: {e}")))?;
                entry.add_position(position);
            }
        }
        Ok(entry)
    }
}

/// All documents containing one term, sorted by document ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingsList {
    entries: Vec<PostingsEntry>,
}

impl PostingsList {
    /// Create an empty list.
    pub fn new() -> Self {
        PostingsList::default()
    }

    /// Number of documents in this list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The i-th entry in document-ID order.
    pub fn get(&self, i: usize) -> Option<&PostingsEntry> {
        self.entries.get(i)
    }

    /// Iterate entries in document-ID order.
    pub fn iter(&self) -> std::slice::Iter<'_, PostingsEntry> {
        self.entries.iter()
    }

    /// Find the entry for a document, if present.
    pub fn entry(&self, doc_id: u32) -> Option<&PostingsEntry> {
        self.entries
            .binary_search_by_key(&doc_id, |e| e.doc_id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Whether the document occurs in this list.
    pub fn contains(&self, doc_id: u32) -> bool {
        self.entries
            .binary_search_by_key(&doc_id, |e| e.doc_id)
            .is_ok()
    }

    /// Record one occurrence of the term in a document. The entry is
    /// found (or created at the sorted insertion point) by binary
    /// search, then the position is added.
    pub fn add(&mut self, doc_id: u32, score: f64, position: u32) {
        let idx = match self.entries.binary_search_by_key(&doc_id, |e| e.doc_id) {
            Ok(idx) => idx,
            Err(idx) => {
                self.entries.insert(idx, PostingsEntry::new(doc_id, score));
                idx
            }
        };
        self.entries[idx].add_position(position);
    }

    /// Union `other` into this list. Documents present in both lists
    /// have their position sequences unioned; documents unique to
    /// `other` are inserted at their sorted position.
    ///
    /// This operation is commutative and associative over the final
    /// (doc ID, positions) content, which is what makes block merge
    /// order irrelevant.
    pub fn merge(&mut self, other: &PostingsList) {
        for entry in &other.entries {
            match self
                .entries
                .binary_search_by_key(&entry.doc_id, |e| e.doc_id)
            {
                Ok(idx) => self.entries[idx].merge(entry),
                Err(idx) => self.entries.insert(idx, entry.clone()),
            }
        }
    }

    /// Score every entry with `idf = log10(N / df)` where `N` is the
    /// corpus size and `df` the number of documents in this list.
    /// Entries whose document length is unknown keep their score.
    pub fn compute_scores(&mut self, corpus_size: usize, doc_lengths: &AHashMap<u32, u32>) {
        if self.entries.is_empty() {
            return;
        }
        let idf = (corpus_size as f64 / self.entries.len() as f64).log10();
        for entry in &mut self.entries {
            if let Some(&doc_len) = doc_lengths.get(&entry.doc_id) {
                entry.compute_score(idf, doc_len);
            }
        }
    }

    /// Sort entries by descending score. This breaks the document-ID
    /// ordering and is only meant for presenting ranked results.
    pub fn sort_by_score(&mut self) {
        self.entries
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }

    /// Serialize to the data-file encoding.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out
    }

    /// Parse a list from the data-file encoding.
    pub fn decode(input: &str) -> Result<Self> {
        let mut list = PostingsList::new();
        for chunk in input.split(']') {
            if chunk.is_empty() {
                continue;
            }
            let entry = PostingsEntry::decode(chunk)?;
            match list
                .entries
                .binary_search_by_key(&entry.doc_id, |e| e.doc_id)
            {
                Ok(idx) => list.entries[idx].merge(&entry),
                Err(idx) => list.entries.insert(idx, entry),
            }
        }
        Ok(list)
    }
}
