use std::time::Duration;

use rand::prelude::*;
use tempfile::TempDir;

use calluna::{IndexConfig, PersistentIndex, PostingsList, ScalableIndex, TermIndex};

fn test_config(dir: &TempDir, block_size: usize) -> IndexConfig {
    let mut config = IndexConfig::new(dir.path());
    config.block_size = block_size;
    config.slot_size = 128;
    config.table_size = 101;
    config.merge_poll_interval = Duration::from_millis(10);
    config
}

fn block_files_in(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("block_"))
        .collect()
}

#[test]
fn test_block_rotation_and_merge() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 2))?;
    index.start();

    index.add_document(0, "doc0.txt", 2);
    index.add_document(1, "doc1.txt", 1);
    index.insert("cat", 0, 0);
    index.insert("dog", 0, 1);
    // The two distinct terms hit the threshold and sealed a block.
    assert_eq!(index.stats().blocks_sealed, 1);
    index.insert("cat", 1, 0);

    index.cleanup()?;
    assert_eq!(index.stats().blocks_sealed, 2);

    let cat = index.get_postings("cat")?.expect("cat should be indexed");
    assert_eq!(cat.len(), 2);
    assert_eq!(cat.entry(0).unwrap().positions(), &[0]);
    assert_eq!(cat.entry(1).unwrap().positions(), &[0]);

    let dog = index.get_postings("dog")?.expect("dog should be indexed");
    assert_eq!(dog.len(), 1);
    assert_eq!(dog.entry(0).unwrap().positions(), &[1]);

    assert!(index.get_postings("fish")?.is_none());

    // Only the canonical files remain.
    assert!(block_files_in(&dir).is_empty());
    assert!(dir.path().join("index.dict").exists());
    assert!(dir.path().join("index.dat").exists());
    Ok(())
}

#[test]
fn test_threshold_one_forces_a_seal_per_insert() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 1))?;
    index.start();

    let terms = ["alpha", "bravo", "charlie", "delta", "echo"];
    for (i, term) in terms.iter().enumerate() {
        index.insert(term, i as u32, 0);
    }
    assert_eq!(index.stats().blocks_sealed, 5);

    index.cleanup()?;

    for (i, term) in terms.iter().enumerate() {
        let list = index.get_postings(term)?.expect("term should survive drain");
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().doc_id, i as u32);
    }
    assert!(block_files_in(&dir).is_empty());
    Ok(())
}

#[test]
fn test_duplicate_triple_is_idempotent() -> calluna::Result<()> {
    // Within one buffer.
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 100))?;
    index.insert("cat", 3, 7);
    index.insert("cat", 3, 7);
    index.cleanup()?;
    let cat = index.get_postings("cat")?.unwrap();
    assert_eq!(cat.len(), 1);
    assert_eq!(cat.entry(3).unwrap().positions(), &[7]);

    // Across two blocks that get merged.
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 1))?;
    index.start();
    index.insert("cat", 3, 7);
    index.insert("cat", 3, 7);
    index.cleanup()?;
    let cat = index.get_postings("cat")?.unwrap();
    assert_eq!(cat.len(), 1);
    assert_eq!(cat.entry(3).unwrap().positions(), &[7]);
    Ok(())
}

#[test]
fn test_postings_are_sorted_after_cleanup() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 4))?;
    index.start();

    let mut rng = StdRng::seed_from_u64(99);
    let terms = ["ant", "bee", "cow", "doe", "elk", "fox"];
    for _ in 0..300 {
        let term = terms[rng.random_range(0..terms.len())];
        index.insert(term, rng.random_range(0..30), rng.random_range(0..200));
    }
    index.cleanup()?;

    for term in terms {
        let list = index.get_postings(term)?.expect("term should be present");
        let ids: Vec<u32> = list.iter().map(|e| e.doc_id).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "doc IDs out of order for {term}");
        }
        for entry in list.iter() {
            let positions = entry.positions();
            for pair in positions.windows(2) {
                assert!(pair[0] < pair[1], "positions not strictly ascending");
            }
        }
    }
    Ok(())
}

#[test]
fn test_scalable_matches_single_block_reference() -> calluna::Result<()> {
    // The multi-way background merge must produce exactly the postings
    // a single-block build of the same triples produces.
    let scalable_dir = TempDir::new().unwrap();
    let reference_dir = TempDir::new().unwrap();

    let mut scalable = ScalableIndex::create(test_config(&scalable_dir, 3))?;
    scalable.start();
    let mut reference = PersistentIndex::open(test_config(&reference_dir, 3))?;

    let mut rng = StdRng::seed_from_u64(4242);
    let terms: Vec<String> = (0..12).map(|i| format!("word{i}")).collect();
    let mut triples = Vec::new();
    for _ in 0..500 {
        let term = terms[rng.random_range(0..terms.len())].clone();
        let doc_id = rng.random_range(0..25u32);
        let offset = rng.random_range(0..400u32);
        triples.push((term, doc_id, offset));
    }
    triples.shuffle(&mut rng);

    for (term, doc_id, offset) in &triples {
        scalable.insert(term, *doc_id, *offset);
        reference.insert(term, *doc_id, *offset);
    }
    scalable.cleanup()?;
    reference.cleanup()?;

    for term in &terms {
        let a: Option<PostingsList> = scalable.get_postings(term)?;
        let b: Option<PostingsList> = reference.get_postings(term)?;
        assert_eq!(a, b, "postings diverge for {term}");
    }
    Ok(())
}

#[test]
fn test_reopen_reads_canonical_index() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    {
        let mut index = ScalableIndex::create(test_config(&dir, 2))?;
        index.start();
        index.add_document(0, "a.txt", 3);
        index.add_document(1, "b.txt", 5);
        index.insert("heather", 0, 0);
        index.insert("moor", 0, 1);
        index.insert("heather", 1, 2);
        index.cleanup()?;
    }

    let index = ScalableIndex::create(test_config(&dir, 2))?;
    assert_eq!(index.doc_count(), 2);
    assert_eq!(index.doc_info(1).unwrap().name, "b.txt");

    let heather = index.get_postings("heather")?.expect("index should reopen");
    assert_eq!(heather.len(), 2);
    assert!(index.get_postings("absent")?.is_none());
    Ok(())
}

#[test]
fn test_invalid_input_is_dropped() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 100))?;

    index.insert("", 0, 0);
    index.insert(&"x".repeat(500), 0, 0);
    index.insert("pipe|term", 0, 0);
    assert_eq!(index.stats().terms_dropped, 3);
    assert_eq!(index.stats().postings_added, 0);

    index.insert("fine", 0, 0);
    index.cleanup()?;
    assert!(index.get_postings("fine")?.is_some());
    assert!(index.get_postings("")?.is_none());
    Ok(())
}

#[test]
fn test_cleanup_is_terminal() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    let mut index = ScalableIndex::create(test_config(&dir, 10))?;
    index.insert("one", 0, 0);
    index.cleanup()?;

    // Inserts after cleanup are dropped, and a second cleanup errors.
    index.insert("two", 1, 0);
    assert!(index.get_postings("two")?.is_none());
    assert!(index.cleanup().is_err());
    Ok(())
}

#[test]
fn test_stale_block_files_swept_on_reopen() -> calluna::Result<()> {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("block_000007.dict"), b"leftover").unwrap();
    std::fs::write(dir.path().join("block_000007.dat"), b"leftover").unwrap();

    let index = ScalableIndex::create(test_config(&dir, 10))?;
    assert!(block_files_in(&dir).is_empty());
    drop(index);
    Ok(())
}
