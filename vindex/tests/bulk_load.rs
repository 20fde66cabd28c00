//! Parallel bulk loading compared against plain inserts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vindex::index::{
    BulkLoadError, BulkLoader, ExtractError, ExtractTask, Identifier, TreeConfig, Value,
    check_invariants,
};
use vindex::testing::{chain_entries, memory_tree, reopen};

fn task(pairs: Vec<(u64, String)>) -> ExtractTask {
    Box::new(move || -> Result<Vec<(Value, Identifier)>, ExtractError> {
        Ok(pairs
            .into_iter()
            .map(|(n, id)| (Value::from_u64(n), id.into_bytes()))
            .collect())
    })
}

fn random_pairs(seed: u64, tasks: usize, per_task: usize) -> Vec<Vec<(u64, String)>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..tasks)
        .map(|t| {
            (0..per_task)
                .map(|i| (rng.random_range(0..5_000u64), format!("t{t}-{i}")))
                .collect()
        })
        .collect()
}

#[test]
fn bulk_load_matches_sequential_inserts() {
    let config = TreeConfig::with_fanout(16, 16);
    let pairs = random_pairs(42, 6, 800);

    let (mut sequential, _) = memory_tree(config.clone()).unwrap();
    // Task order, then extraction order within a task
    let mut flat: Vec<(u64, usize, String)> = pairs
        .iter()
        .enumerate()
        .flat_map(|(t, run)| run.iter().map(move |(n, id)| (*n, t, id.clone())))
        .collect();
    flat.sort_by_key(|(n, t, _)| (*n, *t));
    for (n, _, id) in flat {
        sequential.insert(Value::from_u64(n), id.into_bytes()).unwrap();
    }

    let (mut bulk, _) = memory_tree(config).unwrap();
    let report = BulkLoader::new(3)
        .load(&mut bulk, pairs.into_iter().map(task).collect())
        .unwrap();

    assert_eq!(report.tasks, 6);
    assert_eq!(report.pairs, 4800);
    assert_eq!(report.entries, chain_entries(&sequential).unwrap().len());
    assert!(report.fast_path_appends > 0);

    assert_eq!(chain_entries(&bulk).unwrap(), chain_entries(&sequential).unwrap());
    assert!(check_invariants(&bulk).unwrap().is_empty());
}

#[test]
fn bulk_load_into_existing_tree_with_cache_limit() {
    let config = TreeConfig::with_fanout(8, 8);
    let (mut tree, store) = memory_tree(config.clone()).unwrap();
    for n in (0..3000u64).step_by(2) {
        tree.insert(Value::from_u64(n), b"even".to_vec()).unwrap();
    }
    tree.commit().unwrap();

    let odds: Vec<(u64, String)> = (1..3000u64)
        .step_by(2)
        .map(|n| (n, "odd".to_string()))
        .collect();
    let (low, high) = odds.split_at(odds.len() / 2);
    let tasks = vec![task(high.to_vec()), task(low.to_vec())];

    BulkLoader::new(2)
        .with_cache_limit(16 * 1024)
        .load(&mut tree, tasks)
        .unwrap();
    assert!(tree.db().stats().unwrap().evicted_nodes > 0);
    tree.commit().unwrap();

    let reopened = reopen(store, config).unwrap();
    let entries = chain_entries(&reopened).unwrap();
    assert_eq!(entries.len(), 3000);
    for (n, entry) in entries.iter().enumerate() {
        assert_eq!(entry.value, Value::from_u64(n as u64));
        let expected: &[u8] = if n % 2 == 0 { b"even" } else { b"odd" };
        assert_eq!(entry.identifiers, vec![expected.to_vec()]);
    }
    assert!(check_invariants(&reopened).unwrap().is_empty());
}

#[test]
fn failing_task_aborts_before_insertion() {
    let (mut tree, _) = memory_tree(TreeConfig::default()).unwrap();
    let failing: ExtractTask = Box::new(|| -> Result<Vec<(Value, Identifier)>, ExtractError> {
        Err("source unreadable".into())
    });
    let tasks = vec![task(vec![(1, "a".to_string())]), failing];

    match BulkLoader::new(2).load(&mut tree, tasks) {
        Err(BulkLoadError::Extract { task, source }) => {
            assert_eq!(task, 1);
            assert_eq!(source.to_string(), "source unreadable");
        }
        other => panic!("expected an extraction error, got {other:?}"),
    }
    assert!(tree.root().is_none());
}

#[test]
fn panicking_task_is_reported() {
    let (mut tree, _) = memory_tree(TreeConfig::default()).unwrap();
    let panicking: ExtractTask = Box::new(|| -> Result<Vec<(Value, Identifier)>, ExtractError> {
        panic!("worker blew up")
    });

    match BulkLoader::new(1).load(&mut tree, vec![panicking]) {
        Err(BulkLoadError::WorkerPanicked { task }) => assert_eq!(task, 0),
        other => panic!("expected a panic report, got {other:?}"),
    }
}

#[test]
fn no_tasks_is_a_no_op() {
    let (mut tree, _) = memory_tree(TreeConfig::default()).unwrap();
    let report = BulkLoader::new(4).load(&mut tree, Vec::new()).unwrap();
    assert_eq!(report.entries, 0);
    assert!(!tree.has_changes());
}
