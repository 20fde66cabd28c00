//! Searches racing commits and evictions on the same cache.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use vindex::index::{Database, DatabaseError, Node, NodeId, TreeConfig, TreeError, Value};
use vindex::storage::KvStore;
use vindex::testing::{id_for, insert_all, memory_tree};

const VALUES: u64 = 400;
const ROUNDS: usize = 60;
const READERS: usize = 4;

/// Every node ID reachable from `root`.
fn all_nodes<S: KvStore>(db: &Database<S>, root: NodeId) -> Vec<NodeId> {
    let mut ids = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        ids.push(id);
        if let Node::Internal(internal) = db.node(id).unwrap().as_ref() {
            stack.extend(internal.children.iter().map(|c| c.child));
        }
    }
    ids
}

#[test]
fn searches_never_miss_nodes_during_commit_and_cap() {
    let (mut tree, _store) = memory_tree(TreeConfig::with_fanout(4, 4)).unwrap();
    insert_all(&mut tree, &(0..VALUES).collect::<Vec<_>>()).unwrap();
    let root = tree.commit().unwrap();

    let tree = &tree;
    let db = tree.db();
    let ids = all_nodes(db, root);
    let snapshot: Vec<(NodeId, Arc<Node>)> =
        ids.iter().map(|id| (*id, db.node(*id).unwrap())).collect();

    let done = AtomicBool::new(false);
    let lookups = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for reader in 0..READERS {
            let done = &done;
            let lookups = &lookups;
            let snapshot = &snapshot;
            scope.spawn(move || {
                let mut n = reader as u64;
                loop {
                    let value = n % VALUES;
                    match tree.specific_search(&Value::from_u64(value)) {
                        Ok(found) => assert_eq!(found, Some(vec![id_for(value)])),
                        Err(TreeError::Database(DatabaseError::MissingNode(id))) => {
                            panic!("node {id} vanished from cache and store")
                        }
                        Err(e) => panic!("search for {value} failed: {e}"),
                    }

                    let (id, expected) = &snapshot[(n as usize) % snapshot.len()];
                    assert_eq!(db.node(*id).unwrap().as_ref(), expected.as_ref());

                    lookups.fetch_add(1, Ordering::Relaxed);
                    n += 7;
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
            });
        }

        // Keep re-dirtying every node and flushing it out again, alternating
        // between full commits and evictions. Readers stop before any
        // failure is reported so the scope can join them.
        let churn = (0..ROUNDS).try_fold(0, |left_dirty, round| -> Result<usize, DatabaseError> {
            for (_, node) in &snapshot {
                db.insert(node.as_ref().clone())?;
            }
            if round % 2 == 0 {
                db.commit(Some(root), &[])?;
            } else {
                db.cap(0)?;
            }
            Ok(left_dirty + db.stats()?.dirty_nodes)
        });
        done.store(true, Ordering::Release);
        assert_eq!(churn.unwrap(), 0);
    });

    assert!(lookups.load(Ordering::Relaxed) >= READERS as u64);
    assert_eq!(
        tree.specific_search(&Value::from_u64(VALUES - 1)).unwrap(),
        Some(vec![id_for(VALUES - 1)])
    );
}
