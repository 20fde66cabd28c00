//! Commit, eviction and restart against real and faulty stores.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tempfile::tempdir;
use vindex::index::{Database, Tree, TreeConfig, TreeError, Value, check_invariants};
use vindex::storage::{FileStore, MemoryStore};
use vindex::testing::{as_u64s, chain_entries, id_for, insert_all, memory_tree, reopen};

fn v(n: u64) -> Value {
    Value::from_u64(n)
}

#[test]
fn file_store_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.log");
    let config = TreeConfig::with_fanout(8, 8);

    let root = {
        let store = FileStore::open(&path).unwrap();
        let mut tree = reopen(store, config.clone()).unwrap();
        insert_all(&mut tree, &(0..300).rev().collect::<Vec<_>>()).unwrap();
        tree.commit().unwrap()
    };

    let store = FileStore::open(&path).unwrap();
    let tree = reopen(store, config.clone()).unwrap();
    assert_eq!(tree.root(), Some(root));
    assert_eq!(as_u64s(&tree.topk_search(4).unwrap()), vec![0, 1, 2, 3]);
    assert_eq!(tree.specific_search(&v(150)).unwrap(), Some(vec![id_for(150)]));
    assert_eq!(
        as_u64s(&tree.range_search(&v(295), &v(1000), 10).unwrap()),
        vec![295, 296, 297, 298, 299]
    );
    assert!(check_invariants(&tree).unwrap().is_empty());
}

#[test]
fn second_session_continues_the_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.log");
    let config = TreeConfig::with_fanout(4, 4);

    let first_sequence = {
        let mut tree = reopen(FileStore::open(&path).unwrap(), config.clone()).unwrap();
        insert_all(&mut tree, &(0..40).collect::<Vec<_>>()).unwrap();
        tree.commit().unwrap();
        tree.sequence()
    };

    {
        let mut tree = reopen(FileStore::open(&path).unwrap(), config.clone()).unwrap();
        assert_eq!(tree.sequence(), first_sequence);
        insert_all(&mut tree, &(40..80).collect::<Vec<_>>()).unwrap();
        tree.commit().unwrap();
        assert!(tree.sequence() > first_sequence);
    }

    let tree = reopen(FileStore::open(&path).unwrap(), config).unwrap();
    assert_eq!(
        as_u64s(&chain_entries(&tree).unwrap()),
        (0..80).collect::<Vec<_>>()
    );
    assert!(check_invariants(&tree).unwrap().is_empty());
}

#[test]
fn torn_tail_is_dropped_on_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.log");
    let config = TreeConfig::with_fanout(4, 4);

    {
        let mut tree = reopen(FileStore::open(&path).unwrap(), config.clone()).unwrap();
        insert_all(&mut tree, &[5, 3, 9, 1]).unwrap();
        tree.commit().unwrap();
    }

    // A crash mid-append leaves a partial header behind
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x40, 0x00, 0x00]).unwrap();
    drop(file);

    let (store, recovery) = FileStore::open_with_stats(&path).unwrap();
    assert_eq!(recovery.truncated_bytes, 3);
    assert!(recovery.records > 0);

    let tree = reopen(store, config).unwrap();
    assert_eq!(as_u64s(&tree.topk_search(4).unwrap()), vec![1, 3, 5, 9]);
}

#[test]
fn uncommitted_changes_are_not_visible_after_restart() {
    let config = TreeConfig::with_fanout(4, 4);
    let (mut tree, store) = memory_tree(config.clone()).unwrap();
    insert_all(&mut tree, &[1, 2, 3]).unwrap();
    tree.commit().unwrap();
    insert_all(&mut tree, &[4, 5, 6]).unwrap();
    drop(tree);

    let reopened = reopen(store, config).unwrap();
    assert_eq!(as_u64s(&chain_entries(&reopened).unwrap()), vec![1, 2, 3]);
}

#[test]
fn commit_after_failed_write_succeeds() {
    let config = TreeConfig::with_fanout(4, 4);
    let (mut tree, store) = memory_tree(config.clone()).unwrap();
    insert_all(&mut tree, &(0..30).collect::<Vec<_>>()).unwrap();

    store.fail_next_writes(1).unwrap();
    let err = tree.commit().unwrap_err();
    assert!(matches!(err, TreeError::Database(_)), "{err:?}");
    assert!(tree.has_changes());
    assert!(tree.db().stats().unwrap().dirty_nodes > 0);

    let root = tree.commit().unwrap();
    assert!(!tree.has_changes());
    assert_eq!(tree.db().stats().unwrap().dirty_nodes, 0);

    let reopened = reopen(store, config).unwrap();
    assert_eq!(reopened.root(), Some(root));
    assert_eq!(
        as_u64s(&chain_entries(&reopened).unwrap()),
        (0..30).collect::<Vec<_>>()
    );
}

#[test]
fn cap_then_commit_flushes_stragglers() {
    let config = TreeConfig::with_fanout(4, 4);
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(Database::new(Arc::clone(&store)));
    let mut tree = Tree::open(Arc::clone(&db), None, config.clone()).unwrap();

    insert_all(&mut tree, &(0..200).collect::<Vec<_>>()).unwrap();
    let before = db.cached_size().unwrap();
    let report = db.cap(before / 4).unwrap();
    assert!(report.evicted_nodes > 0);
    assert!(db.cached_size().unwrap() < before / 4);

    // Evicted nodes are read back from the store transparently
    assert_eq!(tree.specific_search(&v(17)).unwrap(), Some(vec![id_for(17)]));

    insert_all(&mut tree, &(200..260).collect::<Vec<_>>()).unwrap();
    tree.commit().unwrap();
    assert_eq!(db.stats().unwrap().dirty_nodes, 0);
    drop(tree);

    let reopened = reopen(store, config).unwrap();
    assert_eq!(
        as_u64s(&chain_entries(&reopened).unwrap()),
        (0..260).collect::<Vec<_>>()
    );
    assert!(check_invariants(&reopened).unwrap().is_empty());
}

#[test]
fn dangling_root_is_rejected() {
    let config = TreeConfig::with_fanout(4, 4);
    let (mut tree, store) = memory_tree(config.clone()).unwrap();
    insert_all(&mut tree, &(0..20).collect::<Vec<_>>()).unwrap();
    let root = tree.commit().unwrap();
    drop(tree);

    // Point the root past the sequence counter
    store
        .put_raw(b"root", &(root + 1000).to_be_bytes())
        .unwrap();
    match reopen(store, config) {
        Err(TreeError::Corrupt(_)) => {}
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("opened a tree with a dangling root"),
    }
}
