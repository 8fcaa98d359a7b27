//! Revision Tree Integration Tests
//!
//! Tests the invariants around document revisions:
//! - Updates must name a current leaf; anything else is a conflict
//! - Replicated revisions merge without conflicts and can fork the tree
//! - The winner is deterministic: live before deleted, then generation, then hash
//! - Stemming bounds history but never changes leaves or the winner
//! - Bodies of stemmed revisions are discarded
//! - Histories as long as rev_limit store, read and extend like short ones

mod common;

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use serde_json::json;
use sofadb::rev_tree::{RevNode, RevPath, RevStatus, RevTree};
use sofadb::config::WriterSection;
use sofadb::{ChangesOptions, DbConfig, Error, GetOptions, OpenRevResult, OpenRevs, RevId};

fn rev(s: &str) -> RevId {
    RevId::parse(s).unwrap()
}

/// Tests that an update without the current rev conflicts.
#[tokio::test]
async fn update_requires_current_rev() {
    let db = common::memory_db().await;

    let rev1 = common::put(&db, json!({"_id": "doc", "n": 1})).await;
    assert!(rev1.starts_with("1-"));

    let missing_rev = db.put(json!({"_id": "doc", "n": 2})).await;
    assert!(matches!(missing_rev, Err(Error::RevConflict(_))));

    let rev2 = common::put(&db, json!({"_id": "doc", "_rev": rev1, "n": 2})).await;
    assert!(rev2.starts_with("2-"));

    let stale = db.put(json!({"_id": "doc", "_rev": rev1, "n": 3})).await.unwrap_err();
    assert!(stale.is_conflict());
    assert_eq!(stale.status(), 409);

    let doc = common::get(&db, "doc").await;
    assert_eq!(doc["n"], json!(2));
    assert_eq!(doc["_rev"], json!(rev2));

    db.shutdown().await;
}

/// Tests that deleting leaves a tombstone that reads as deleted.
#[tokio::test]
async fn delete_leaves_tombstone() {
    let db = common::memory_db().await;

    let rev1 = common::put(&db, json!({"_id": "doc", "n": 1})).await;
    let deleted = db.remove("doc", &rev1).await.unwrap();
    assert!(deleted.rev.starts_with("2-"));

    let err = db.get("doc", GetOptions::default()).await.unwrap_err();
    assert!(matches!(&err, Error::MissingDoc(reason) if reason == "deleted"));

    // The tombstone is still readable by rev.
    let opts = GetOptions {
        rev: Some(rev(&deleted.rev)),
        ..GetOptions::default()
    };
    let tombstone = db.get("doc", opts).await.unwrap();
    assert_eq!(tombstone["_deleted"], json!(true));

    // Recreating after a delete continues the same tree.
    let recreated = common::put(&db, json!({"_id": "doc", "n": 2})).await;
    assert!(recreated.starts_with("3-"));
    assert_eq!(db.info().await.unwrap().doc_count, 1);

    db.shutdown().await;
}

/// Tests that replicated revisions fork the tree and the winner is deterministic.
#[tokio::test]
async fn replicated_fork_picks_highest_hash() {
    let db = common::memory_db().await;

    let docs = vec![
        common::replicated("doc", 2, &["bbb", "aaa"], json!({"side": "b"})),
        common::replicated("doc", 2, &["ccc", "aaa"], json!({"side": "c"})),
    ];
    let results = db.bulk_docs(docs, false).await.unwrap();
    assert!(results.iter().all(Result::is_ok));

    let opts = GetOptions {
        conflicts: true,
        ..GetOptions::default()
    };
    let doc = db.get("doc", opts).await.unwrap();
    assert_eq!(doc["_rev"], json!("2-ccc"));
    assert_eq!(doc["side"], json!("c"));
    assert_eq!(doc["_conflicts"], json!(["2-bbb"]));

    // Deleting the winner promotes the conflict.
    db.remove("doc", "2-ccc").await.unwrap();
    let doc = common::get(&db, "doc").await;
    assert_eq!(doc["_rev"], json!("2-bbb"));

    db.shutdown().await;
}

/// Tests that a longer branch beats a higher hash.
#[tokio::test]
async fn generation_beats_hash() {
    let db = common::memory_db().await;

    let docs = vec![
        common::replicated("doc", 3, &["aaa", "a2", "a1"], json!({})),
        common::replicated("doc", 2, &["zzz", "a1"], json!({})),
    ];
    db.bulk_docs(docs, false).await.unwrap();

    let doc = common::get(&db, "doc").await;
    assert_eq!(doc["_rev"], json!("3-aaa"));

    db.shutdown().await;
}

/// Tests that replicating the same revision twice changes nothing.
#[tokio::test]
async fn replicated_writes_are_idempotent() {
    let db = common::memory_db().await;

    let doc = common::replicated("doc", 1, &["abc"], json!({"n": 1}));
    db.bulk_docs(vec![doc.clone()], false).await.unwrap();
    let seq = db.info().await.unwrap().update_seq;

    let results = db.bulk_docs(vec![doc], false).await.unwrap();
    assert!(results[0].is_ok());
    assert_eq!(db.info().await.unwrap().update_seq, seq);

    db.shutdown().await;
}

/// Tests revs_diff and open_revs, the two halves of replication reads.
#[tokio::test]
async fn revs_diff_and_open_revs() {
    let db = common::memory_db().await;

    db.bulk_docs(vec![common::replicated("doc", 2, &["bbb", "aaa"], json!({"v": 2}))], false)
        .await
        .unwrap();

    let mut wanted = BTreeMap::new();
    wanted.insert("doc".to_string(), vec![rev("1-aaa"), rev("2-bbb"), rev("3-ccc")]);
    wanted.insert("other".to_string(), vec![rev("1-xyz")]);
    let diff = db.revs_diff(wanted).await.unwrap();
    assert_eq!(diff["doc"].missing, vec!["3-ccc".to_string()]);
    assert_eq!(diff["other"].missing, vec!["1-xyz".to_string()]);

    let found = db
        .get_open_revs("doc", OpenRevs::Revs(vec![rev("2-bbb"), rev("9-zzz")]))
        .await
        .unwrap();
    match &found[0] {
        OpenRevResult::Ok(doc) => {
            assert_eq!(doc["_revisions"], json!({"start": 2, "ids": ["bbb", "aaa"]}));
            assert_eq!(doc["v"], json!(2));
        }
        other => panic!("expected revision, got {other:?}"),
    }
    assert_eq!(found[1], OpenRevResult::Missing("9-zzz".to_string()));

    let all = db.get_open_revs("doc", OpenRevs::All).await.unwrap();
    assert_eq!(all.len(), 1);

    db.shutdown().await;
}

/// Tests that history is bounded by rev_limit and stemmed bodies are gone.
#[tokio::test]
async fn history_is_stemmed_to_rev_limit() {
    let config = DbConfig {
        rev_limit: 3,
        ..DbConfig::default()
    };
    let db = common::memory_db_with(config).await;

    let mut revs = vec![common::put(&db, json!({"_id": "doc", "n": 0})).await];
    for n in 1..6 {
        let current = revs[revs.len() - 1].clone();
        revs.push(common::put(&db, json!({"_id": "doc", "_rev": current, "n": n})).await);
    }

    let opts = GetOptions {
        revs: true,
        ..GetOptions::default()
    };
    let doc = db.get("doc", opts).await.unwrap();
    assert_eq!(doc["_revisions"]["start"], json!(6));
    assert_eq!(doc["_revisions"]["ids"].as_array().unwrap().len(), 3);

    let stemmed = GetOptions {
        rev: Some(rev(&revs[0])),
        ..GetOptions::default()
    };
    assert!(db.get("doc", stemmed).await.unwrap_err().is_not_found());

    let parent = GetOptions {
        rev: Some(rev(&revs[4])),
        ..GetOptions::default()
    };
    assert_eq!(db.get("doc", parent).await.unwrap()["n"], json!(4));

    db.shutdown().await;
}

/// Tests a document edited past the default rev_limit.
#[tokio::test]
async fn long_history_at_default_rev_limit() {
    let config = DbConfig {
        writer: WriterSection {
            batch_timeout_ms: 0,
            batch_max_size: 1,
        },
        ..DbConfig::default()
    };
    assert_eq!(config.rev_limit, 1000);
    let db = common::memory_db_with(config).await;

    let edits = 1100;
    let mut revs = vec![common::put(&db, json!({"_id": "doc", "n": 0})).await];
    for n in 1..edits {
        let current = revs[revs.len() - 1].clone();
        revs.push(common::put(&db, json!({"_id": "doc", "_rev": current, "n": n})).await);
    }
    let last = revs[revs.len() - 1].clone();
    assert!(last.starts_with(&format!("{edits}-")));

    let doc = db
        .get(
            "doc",
            GetOptions {
                revs: true,
                ..GetOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(doc["_rev"], json!(last));
    assert_eq!(doc["n"], json!(edits - 1));
    assert_eq!(doc["_revisions"]["start"], json!(edits));
    assert_eq!(doc["_revisions"]["ids"].as_array().unwrap().len(), 1000);

    // The oldest kept revision is generation edits - 999.
    let oldest_kept = GetOptions {
        rev: Some(rev(&revs[edits - 1000])),
        ..GetOptions::default()
    };
    assert_eq!(db.get("doc", oldest_kept).await.unwrap()["n"], json!(edits - 1000));
    let first_stemmed = GetOptions {
        rev: Some(rev(&revs[edits - 1001])),
        ..GetOptions::default()
    };
    assert!(db.get("doc", first_stemmed).await.unwrap_err().is_not_found());

    let next = common::put(&db, json!({"_id": "doc", "_rev": last, "n": edits})).await;
    assert!(next.starts_with(&format!("{}-", edits + 1)));

    db.shutdown().await;
}

/// Tests replicated histories longer than a shallow tree would hold.
#[tokio::test]
async fn long_replicated_history() {
    let db = common::memory_db().await;

    let hashes: Vec<String> = (0..1500).rev().map(|i| format!("h{i}")).collect();
    let short: Vec<&str> = hashes[1500 - 80..].iter().map(String::as_str).collect();
    let results = db
        .bulk_docs(vec![common::replicated("r", 80, &short, json!({"v": 80}))], false)
        .await
        .unwrap();
    assert_eq!(results[0].as_ref().unwrap().rev, "80-h79");

    let revs_opts = || GetOptions {
        revs: true,
        ..GetOptions::default()
    };
    let doc = db.get("r", revs_opts()).await.unwrap();
    assert_eq!(doc["v"], json!(80));
    assert_eq!(doc["_revisions"]["ids"].as_array().unwrap().len(), 80);

    // The full chain extends the same branch and is stemmed to rev_limit.
    let full: Vec<&str> = hashes.iter().map(String::as_str).collect();
    db.bulk_docs(vec![common::replicated("r", 1500, &full, json!({"v": 1500}))], false)
        .await
        .unwrap()
        .remove(0)
        .unwrap();
    let doc = db.get("r", revs_opts()).await.unwrap();
    assert_eq!(doc["_rev"], json!("1500-h1499"));
    assert_eq!(doc["_revisions"]["ids"].as_array().unwrap().len(), 1000);
    let leaves = db.get_open_revs("r", OpenRevs::All).await.unwrap();
    assert_eq!(leaves.len(), 1);

    db.shutdown().await;
}

/// Tests revision strings that parse but cannot be built upon.
#[tokio::test]
async fn out_of_range_generations_are_invalid() {
    let db = common::memory_db().await;

    let overflow = db
        .put(json!({"_id": "o", "_rev": "18446744073709551615-a"}))
        .await
        .unwrap_err();
    assert!(matches!(overflow, Error::InvalidRev(_)));
    let zero = db.put(json!({"_id": "o", "_rev": "0-a"})).await.unwrap_err();
    assert!(matches!(zero, Error::InvalidRev(_)));

    assert!(common::put(&db, json!({"_id": "o"})).await.starts_with("1-"));

    db.shutdown().await;
}

/// Tests that bodies too deep to read back are refused up front.
#[tokio::test]
async fn overly_nested_bodies_are_rejected() {
    let db = common::memory_db().await;
    let nested = |levels: usize| {
        let mut value = json!("leaf");
        for _ in 0..levels {
            value = json!({ "a": value });
        }
        value
    };

    let err = db.put(json!({"_id": "deep", "x": nested(130)})).await.unwrap_err();
    assert!(matches!(err, Error::DocValidation(_)));
    assert!(db.get("deep", GetOptions::default()).await.unwrap_err().is_not_found());
    let err = db.put(json!({"_id": "_local/deep", "x": nested(130)})).await.unwrap_err();
    assert!(matches!(err, Error::DocValidation(_)));

    common::put(&db, json!({"_id": "ok", "x": nested(90)})).await;
    assert_eq!(common::get(&db, "ok").await["x"], nested(90));
    let feed = db
        .changes(ChangesOptions {
            include_docs: true,
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(feed.results.len(), 1);
    assert_eq!(feed.results[0].doc.as_ref().unwrap()["x"], nested(90));

    db.shutdown().await;
}

/// Tests that a deleted document can be revived from an ancestor of its tombstone.
#[tokio::test]
async fn revival_may_fork_below_tombstone() {
    let db = common::memory_db().await;
    let rev1 = common::put(&db, json!({"_id": "doc", "v": 1})).await;
    let rev2 = db.remove("doc", &rev1).await.unwrap().rev;

    let revived = common::put(&db, json!({"_id": "doc", "_rev": rev1, "v": 2})).await;
    assert!(revived.starts_with("2-"));
    let doc = db
        .get(
            "doc",
            GetOptions {
                deleted_conflicts: true,
                ..GetOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(doc["_rev"], json!(revived));
    assert_eq!(doc["_deleted_conflicts"], json!([rev2]));
    assert_eq!(db.info().await.unwrap().doc_count, 1);

    db.shutdown().await;
}

/// Tests that revs_info lists the ancestry newest first.
#[tokio::test]
async fn revs_info_reports_availability() {
    let db = common::memory_db().await;

    let rev1 = common::put(&db, json!({"_id": "doc"})).await;
    let rev2 = common::put(&db, json!({"_id": "doc", "_rev": rev1})).await;

    let opts = GetOptions {
        revs_info: true,
        ..GetOptions::default()
    };
    let doc = db.get("doc", opts).await.unwrap();
    assert_eq!(
        doc["_revs_info"],
        json!([
            {"rev": rev2, "status": "available"},
            {"rev": rev1, "status": "available"},
        ])
    );

    db.shutdown().await;
}

// =============================================================================
// Properties
// =============================================================================

/// Branches of one document: each forks from a shared root.
fn branch(letter: u8, depth: usize, deleted: bool) -> RevPath {
    let mut nodes = vec![RevNode::new("root", RevStatus::Available, false)];
    for i in 0..depth {
        nodes.push(RevNode::new(format!("{}{i}", letter as char), RevStatus::Available, false));
    }
    if let Some(last) = nodes.last_mut() {
        last.deleted = deleted;
    }
    RevPath::linear(1, nodes).unwrap()
}

fn merge_all(paths: impl IntoIterator<Item = RevPath>, depth: usize) -> RevTree {
    paths
        .into_iter()
        .fold(RevTree::new(), |tree, path| tree.merge(path, depth).tree)
}

fn leaf_set(tree: &RevTree) -> BTreeSet<String> {
    tree.leaves().into_iter().map(|leaf| leaf.rev.to_string()).collect()
}

proptest! {
    #[test]
    fn winner_is_independent_of_merge_order(
        branches in prop::collection::btree_map(b'a'..b'h', (1usize..4, any::<bool>()), 1..6),
    ) {
        let paths: Vec<RevPath> = branches
            .iter()
            .map(|(letter, (depth, deleted))| branch(*letter, *depth, *deleted))
            .collect();

        let forward = merge_all(paths.clone(), 1000);
        let backward = merge_all(paths.into_iter().rev(), 1000);

        prop_assert_eq!(forward.winning_rev(), backward.winning_rev());
        prop_assert_eq!(leaf_set(&forward), leaf_set(&backward));
    }

    #[test]
    fn stemming_keeps_leaves_and_winner(
        branches in prop::collection::btree_map(b'a'..b'h', (1usize..6, any::<bool>()), 1..6),
        depth in 1usize..5,
    ) {
        let paths: Vec<RevPath> = branches
            .iter()
            .map(|(letter, (d, deleted))| branch(*letter, *d, *deleted))
            .collect();

        let full = merge_all(paths, 1000);
        let (stemmed, removed) = full.stem(depth);

        prop_assert_eq!(stemmed.winning_rev(), full.winning_rev());
        prop_assert_eq!(leaf_set(&stemmed), leaf_set(&full));
        for rev in removed {
            prop_assert!(!stemmed.contains(&rev));
        }
    }
}
