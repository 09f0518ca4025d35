//! Background merge engine.
//!
//! Sealed blocks arrive over a channel. A coordinator thread keeps a
//! local pending list and, whenever two blocks are available, claims the
//! two oldest and hands them to a worker thread; the worker writes one
//! combined block, deletes the two sources, and sends the combined
//! block back over the same channel, making it eligible for further
//! merging. This yields a balanced, asynchronous multi-way merge in the
//! spirit of an LSM compaction cascade.
//!
//! The coordinator is the only consumer of the channel, so claiming a
//! pair is trivially atomic: no two workers can ever hold the same
//! block. Ingestion never waits on merge progress.
//!
//! # Lifecycle
//!
//! The engine is started explicitly with [`MergeEngine::start`] and
//! stopped with [`MergeEngine::finish`], which drains eagerly until at
//! most one block remains and returns the survivor. A merge that fails
//! on I/O is abandoned: the partial output is removed and both source
//! blocks go back on the queue for a later retry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, warn};

use crate::block::{Block, BlockReader, BlockWriter};
use crate::config::IndexConfig;
use crate::dictionary::DictEntry;
use crate::error::{CallunaError, Result};

/// After this many abandoned merges the engine stops retrying and
/// surfaces an error from `finish`, leaving all source blocks on disk.
const MERGE_FAILURE_LIMIT: u32 = 8;

/// Handle to a running merge engine.
pub struct MergeEngine {
    sender: Sender<Block>,
    finished: Arc<AtomicBool>,
    coordinator: JoinHandle<Result<Option<Block>>>,
}

impl MergeEngine {
    /// Spawn the coordinator thread. Newly merged blocks take their IDs
    /// from `next_block_id`, the same counter that numbers sealed
    /// blocks, so identifiers never collide.
    pub fn start(config: Arc<IndexConfig>, next_block_id: Arc<AtomicU64>) -> Self {
        let (sender, receiver) = unbounded();
        let finished = Arc::new(AtomicBool::new(false));
        let worker_sender = sender.clone();
        let coordinator_finished = finished.clone();
        let coordinator = thread::spawn(move || {
            run_coordinator(
                receiver,
                worker_sender,
                config,
                next_block_id,
                coordinator_finished,
            )
        });
        MergeEngine {
            sender,
            finished,
            coordinator,
        }
    }

    /// Queue a sealed block for merging. Never blocks.
    pub fn enqueue(&self, block: Block) {
        debug!("queueing block {} for merge", block.id);
        if self.sender.send(block).is_err() {
            error!("merge coordinator is gone; sealed block left on disk");
        }
    }

    /// Signal that ingestion is complete, drain until at most one block
    /// remains, and return it.
    pub fn finish(self) -> Result<Option<Block>> {
        let MergeEngine {
            sender,
            finished,
            coordinator,
        } = self;
        finished.store(true, Ordering::SeqCst);
        drop(sender);
        match coordinator.join() {
            Ok(survivor) => survivor,
            Err(_) => Err(CallunaError::index("merge coordinator thread panicked")),
        }
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish()
    }
}

fn run_coordinator(
    receiver: Receiver<Block>,
    sender: Sender<Block>,
    config: Arc<IndexConfig>,
    next_block_id: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
) -> Result<Option<Block>> {
    let mut pending: VecDeque<Block> = VecDeque::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let failures = Arc::new(AtomicU32::new(0));

    loop {
        // Block until a new block arrives or the poll interval passes,
        // then pick up everything else that is already waiting.
        match receiver.recv_timeout(config.merge_poll_interval) {
            Ok(block) => pending.push_back(block),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(block) = receiver.try_recv() {
            pending.push_back(block);
        }

        // Reap exited workers; any result they sent is visible by now.
        let mut i = 0;
        while i < workers.len() {
            if workers[i].is_finished() {
                let _ = workers.swap_remove(i).join();
            } else {
                i += 1;
            }
        }
        while let Ok(block) = receiver.try_recv() {
            pending.push_back(block);
        }

        if failures.load(Ordering::SeqCst) >= MERGE_FAILURE_LIMIT {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
            return Err(CallunaError::index(
                "merge engine stopped after repeated I/O failures; source blocks were left on disk",
            ));
        }

        // Claim the two oldest blocks per available pair. The claim is
        // atomic because this loop is the channel's only consumer.
        while pending.len() >= 2 {
            let first = match pending.pop_front() {
                Some(block) => block,
                None => break,
            };
            let second = match pending.pop_front() {
                Some(block) => block,
                None => {
                    pending.push_front(first);
                    break;
                }
            };
            let out_id = next_block_id.fetch_add(1, Ordering::SeqCst);
            let worker_sender = sender.clone();
            let worker_config = config.clone();
            let worker_failures = failures.clone();
            workers.push(thread::spawn(move || {
                run_worker(first, second, out_id, worker_config, worker_sender, worker_failures);
            }));
        }

        if finished.load(Ordering::SeqCst)
            && workers.is_empty()
            && pending.len() <= 1
            && receiver.is_empty()
        {
            break;
        }
    }

    for handle in workers.drain(..) {
        let _ = handle.join();
    }
    Ok(pending.pop_front())
}

fn run_worker(
    first: Block,
    second: Block,
    out_id: u64,
    config: Arc<IndexConfig>,
    sender: Sender<Block>,
    failures: Arc<AtomicU32>,
) {
    info!("merging block {} and block {}", first.id, second.id);
    match merge_blocks(&first, &second, out_id, &config) {
        Ok(merged) => {
            info!(
                "merged block {} and block {} into block {}",
                first.id, second.id, merged.id
            );
            let _ = sender.send(merged);
        }
        Err(e) => {
            error!(
                "merge of block {} and block {} abandoned: {e}",
                first.id, second.id
            );
            failures.fetch_add(1, Ordering::SeqCst);
            // The partial combined block is garbage; the sources stay
            // intact and go back on the queue.
            let partial = Block::new(&config.index_dir, out_id);
            let _ = std::fs::remove_file(&partial.dict_path);
            let _ = std::fs::remove_file(&partial.data_path);
            let _ = sender.send(first);
            let _ = sender.send(second);
        }
    }
}

/// Merge two sealed blocks into one combined block, then delete the
/// sources. For terms present in both blocks, the shorter postings list
/// is merged into the longer to minimize copy work.
fn merge_blocks(first: &Block, second: &Block, out_id: u64, config: &IndexConfig) -> Result<Block> {
    let slot_size = config.slot_size;
    let table_size = config.table_size;

    let mut reader_a = BlockReader::open(&first.dict_path, &first.data_path, slot_size, table_size)?;
    let mut reader_b =
        BlockReader::open(&second.dict_path, &second.data_path, slot_size, table_size)?;

    let dict_a = reader_a.scan_terms()?;
    let mut dict_b = reader_b.scan_terms()?;

    let mut writer = BlockWriter::create(&config.index_dir, out_id, slot_size, table_size)?;

    let mut terms_a: Vec<&String> = dict_a.keys().collect();
    terms_a.sort();
    for term in terms_a {
        let list_a = reader_a.read_list(&dict_a[term])?;
        let list_b = match dict_b.remove(term) {
            Some(entry) => reader_b.read_list(&entry)?,
            None => None,
        };
        let merged = match (list_a, list_b) {
            (Some(mut a), Some(mut b)) => {
                if a.len() >= b.len() {
                    a.merge(&b);
                    a
                } else {
                    b.merge(&a);
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => continue,
        };
        writer.write_list(term, &merged)?;
    }

    // Terms unique to the second block are copied through unchanged.
    let mut terms_b: Vec<(String, DictEntry)> = dict_b.into_iter().collect();
    terms_b.sort_by(|a, b| a.0.cmp(&b.0));
    for (term, entry) in terms_b {
        if let Some(list) = reader_b.read_list(&entry)? {
            writer.write_list(&term, &list)?;
        }
    }

    let merged = writer.finish()?;

    // Only after the combined block is fully written and synced may the
    // sources go away. Failing to delete a source is not fatal: the
    // stale files are swept the next time the directory is opened.
    if let Err(e) = first.delete() {
        warn!("failed to delete merged source block {}: {e}", first.id);
    }
    if let Err(e) = second.delete() {
        warn!("failed to delete merged source block {}: {e}", second.id);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::TempDir;

    use crate::postings::PostingsList;

    fn test_config(dir: &TempDir) -> Arc<IndexConfig> {
        let mut config = IndexConfig::new(dir.path());
        config.slot_size = 128;
        config.table_size = 31;
        config.merge_poll_interval = Duration::from_millis(10);
        Arc::new(config)
    }

    fn write_test_block(config: &IndexConfig, id: u64, terms: &[(&str, &[(u32, u32)])]) -> Block {
        let mut writer =
            BlockWriter::create(&config.index_dir, id, config.slot_size, config.table_size)
                .unwrap();
        for (term, postings) in terms {
            let mut list = PostingsList::new();
            for &(doc_id, position) in *postings {
                list.add(doc_id, 0.0, position);
            }
            writer.write_list(term, &list).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_merge_blocks_unions_shared_terms() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let a = write_test_block(&config, 0, &[("cat", &[(0, 0)]), ("dog", &[(0, 1)])]);
        let b = write_test_block(&config, 1, &[("cat", &[(1, 0)]), ("fish", &[(2, 5)])]);

        let merged = merge_blocks(&a, &b, 2, &config).unwrap();

        // Sources are gone, the combined block remains.
        assert!(!a.dict_path.exists());
        assert!(!b.dict_path.exists());
        assert!(merged.dict_path.exists());

        let mut reader = BlockReader::open(
            &merged.dict_path,
            &merged.data_path,
            config.slot_size,
            config.table_size,
        )
        .unwrap();
        let cat = reader.lookup("cat").unwrap().unwrap();
        assert_eq!(cat.len(), 2);
        assert_eq!(cat.entry(0).unwrap().positions(), &[0]);
        assert_eq!(cat.entry(1).unwrap().positions(), &[0]);
        assert_eq!(reader.lookup("dog").unwrap().unwrap().len(), 1);
        assert_eq!(reader.lookup("fish").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_engine_drains_to_single_block() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let next_block_id = Arc::new(AtomicU64::new(5));

        let engine = MergeEngine::start(config.clone(), next_block_id);
        for id in 0..5 {
            let block = write_test_block(
                &config,
                id,
                &[("shared", &[(id as u32, id as u32)]), (&format!("only{id}"), &[(9, 9)])],
            );
            engine.enqueue(block);
        }

        let survivor = engine.finish().unwrap().expect("one block should survive");
        let mut reader = BlockReader::open(
            &survivor.dict_path,
            &survivor.data_path,
            config.slot_size,
            config.table_size,
        )
        .unwrap();

        let shared = reader.lookup("shared").unwrap().unwrap();
        assert_eq!(shared.len(), 5);
        for id in 0..5u32 {
            assert_eq!(shared.entry(id).unwrap().positions(), &[id]);
            assert!(reader.lookup(&format!("only{id}")).unwrap().is_some());
        }

        // Exactly one block pair of files remains in the directory.
        let block_files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("block_"))
            .collect();
        assert_eq!(block_files.len(), 2);
    }

    #[test]
    fn test_repeated_merge_failures_stop_the_engine() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let healthy = write_test_block(&config, 0, &[("cat", &[(0, 0)])]);

        // A data path that is a directory makes every attempt to open
        // the block fail with an I/O error, so each retry is abandoned
        // until the failure budget runs out.
        let broken = Block::new(&config.index_dir, 1);
        std::fs::write(&broken.dict_path, b"").unwrap();
        std::fs::create_dir(&broken.data_path).unwrap();

        let engine = MergeEngine::start(config.clone(), Arc::new(AtomicU64::new(2)));
        engine.enqueue(healthy.clone());
        engine.enqueue(broken.clone());
        assert!(engine.finish().is_err());

        // Abandoned merges leave both sources on disk and write no
        // partial combined block.
        assert!(healthy.dict_path.exists());
        assert!(healthy.data_path.exists());
        assert!(broken.dict_path.exists());
        let partials: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("block_") && !name.contains("block_000000") && !name.contains("block_000001"))
            .collect();
        assert!(partials.is_empty(), "partial outputs left behind: {partials:?}");
    }

    #[test]
    fn test_engine_with_no_blocks_returns_none() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let engine = MergeEngine::start(config, Arc::new(AtomicU64::new(0)));
        assert!(engine.finish().unwrap().is_none());
    }

    #[test]
    fn test_merge_pairing_order_is_irrelevant() {
        use rand::prelude::*;

        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut rng = StdRng::seed_from_u64(11);

        // The same six blocks enqueued in different orders must drain
        // to identical postings content.
        let blocks: Vec<Vec<(String, Vec<(u32, u32)>)>> = (0..6)
            .map(|b| {
                (0..4)
                    .map(|t| {
                        let term = format!("term{}", (b + t) % 5);
                        let postings =
                            (0..3).map(|p| (rng.random_range(0..8), p)).collect::<Vec<_>>();
                        (term, postings)
                    })
                    .collect()
            })
            .collect();

        let mut outcomes = Vec::new();
        for round in 0..3 {
            let round_dir = dir.path().join(format!("round{round}"));
            std::fs::create_dir(&round_dir).unwrap();
            let mut round_config = (*config).clone();
            round_config.index_dir = round_dir;
            let round_config = Arc::new(round_config);

            let mut order: Vec<usize> = (0..blocks.len()).collect();
            order.shuffle(&mut rng);

            let engine =
                MergeEngine::start(round_config.clone(), Arc::new(AtomicU64::new(100)));
            for &b in &order {
                let spec: Vec<(&str, &[(u32, u32)])> = blocks[b]
                    .iter()
                    .map(|(term, postings)| (term.as_str(), postings.as_slice()))
                    .collect();
                let block = write_test_block(&round_config, b as u64, &spec);
                engine.enqueue(block);
            }
            let survivor = engine.finish().unwrap().unwrap();
            let mut reader = BlockReader::open(
                &survivor.dict_path,
                &survivor.data_path,
                round_config.slot_size,
                round_config.table_size,
            )
            .unwrap();

            let mut content: Vec<(String, PostingsList)> = Vec::new();
            for t in 0..5 {
                let term = format!("term{t}");
                if let Some(list) = reader.lookup(&term).unwrap() {
                    content.push((term, list));
                }
            }
            outcomes.push(content);
        }

        // Scores are all zero here, so full equality holds.
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[1], outcomes[2]);
    }
}
