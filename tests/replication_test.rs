//! Replication Tests
//!
//! Tests the invariants around replication between two databases:
//! - Every leaf the target lacks is copied, with its history and attachments
//! - Conflicts replicate as conflicts and both sides pick the same winner
//! - A rerun resumes from the checkpoint both peers agree on
//! - Filters narrow what is copied and get their own checkpoint
//! - Local documents never leave their database

mod common;

use std::collections::BTreeMap;

use serde_json::json;
use sofadb::checkpoint::replication_id;
use sofadb::{
    CheckpointDoc, GetOptions, OpenRevs, ReplicationOptions, RevId, Seq, SofaDB,
};

async fn winner(db: &SofaDB, id: &str) -> String {
    common::get(db, id).await["_rev"].as_str().unwrap().to_string()
}

/// Tests a full copy: edits, deletions, attachments and design documents.
#[tokio::test]
async fn replicates_everything_the_target_lacks() {
    let source = common::memory_db().await;
    let target = common::memory_db().await;

    let rev = common::put(&source, json!({"_id": "edited", "v": 1})).await;
    common::put(&source, json!({"_id": "edited", "_rev": rev, "v": 2})).await;
    let gone = common::put(&source, json!({"_id": "gone"})).await;
    source.remove("gone", &gone).await.unwrap();
    source
        .put_attachment("files", "a.txt", None, "text/plain", b"payload".to_vec())
        .await
        .unwrap();
    common::put(&source, json!({"_id": "_design/app", "views": {}})).await;
    common::put(&source, json!({"_id": "_local/private", "secret": true})).await;

    let result = source.replicate_to(&target, ReplicationOptions::default()).await.unwrap();
    assert!(result.ok);
    assert!(!result.cancelled);
    assert_eq!(result.start_seq, Seq::ZERO);
    assert_eq!(result.last_seq, source.info().await.unwrap().update_seq);
    assert_eq!(result.docs_written, 4);
    assert_eq!(result.doc_write_failures, 0);

    let edited = target
        .get(
            "edited",
            GetOptions {
                revs: true,
                ..GetOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited["v"], json!(2));
    assert_eq!(edited["_rev"], json!(winner(&source, "edited").await));
    assert_eq!(edited["_revisions"]["ids"].as_array().unwrap().len(), 2);

    assert!(target.get("gone", GetOptions::default()).await.unwrap_err().is_not_found());
    let (_, bytes) = target.get_attachment("files", "a.txt", None).await.unwrap();
    assert_eq!(bytes, b"payload");
    assert!(target.get("_design/app", GetOptions::default()).await.is_ok());
    assert!(target.get_local("_local/private").await.unwrap_err().is_not_found());

    assert_eq!(target.info().await.unwrap().doc_count, source.info().await.unwrap().doc_count);

    source.shutdown().await;
    target.shutdown().await;
}

/// Tests that a second run resumes from the shared checkpoint.
#[tokio::test]
async fn rerun_resumes_from_checkpoint() {
    let source = common::memory_db().await;
    let target = common::memory_db().await;
    for i in 0..5 {
        common::put(&source, json!({"_id": format!("d{i}")})).await;
    }

    let opts = || ReplicationOptions {
        batch_size: 2,
        ..ReplicationOptions::default()
    };
    let first = source.replicate_to(&target, opts()).await.unwrap();
    assert_eq!(first.last_seq, Seq::from_raw(5));
    assert_eq!(first.docs_written, 5);

    // Both peers hold the same record.
    let source_id = source.info().await.unwrap().instance_id;
    let target_id = target.info().await.unwrap().instance_id;
    let checkpoint_id = replication_id(&source_id, &target_id, "");
    let on_source: CheckpointDoc = serde_json::from_value(source.get_local(&checkpoint_id).await.unwrap()).unwrap();
    let on_target: CheckpointDoc = serde_json::from_value(target.get_local(&checkpoint_id).await.unwrap()).unwrap();
    assert_eq!(on_source.last_seq, Seq::from_raw(5));
    assert_eq!(on_source.session_id, on_target.session_id);
    assert_eq!(on_source.session_id.as_deref(), Some(first.session_id.as_str()));

    common::put(&source, json!({"_id": "d5"})).await;
    let second = source.replicate_to(&target, opts()).await.unwrap();
    assert_eq!(second.start_seq, Seq::from_raw(5));
    assert_eq!(second.last_seq, Seq::from_raw(6));
    assert_eq!(second.docs_read, 1);
    assert_ne!(second.session_id, first.session_id);

    // Nothing new: nothing read, nothing written.
    let third = source.replicate_to(&target, opts()).await.unwrap();
    assert_eq!(third.start_seq, Seq::from_raw(6));
    assert_eq!(third.docs_read, 0);
    assert_eq!(third.docs_written, 0);

    source.shutdown().await;
    target.shutdown().await;
}

/// Tests that concurrent edits on both sides converge to the same winner.
#[tokio::test]
async fn divergent_edits_converge() {
    let left = common::memory_db().await;
    let right = common::memory_db().await;

    let base = common::put(&left, json!({"_id": "doc", "v": 0})).await;
    left.replicate_to(&right, ReplicationOptions::default()).await.unwrap();
    assert_eq!(winner(&right, "doc").await, base);

    common::put(&left, json!({"_id": "doc", "_rev": base, "v": "left"})).await;
    common::put(&right, json!({"_id": "doc", "_rev": base, "v": "right"})).await;

    left.replicate_to(&right, ReplicationOptions::default()).await.unwrap();
    right.replicate_to(&left, ReplicationOptions::default()).await.unwrap();

    let left_winner = winner(&left, "doc").await;
    assert_eq!(left_winner, winner(&right, "doc").await);

    let conflicts = |db: SofaDB| async move {
        db.get(
            "doc",
            GetOptions {
                conflicts: true,
                ..GetOptions::default()
            },
        )
        .await
        .unwrap()["_conflicts"]
            .clone()
    };
    let left_conflicts = conflicts(left.clone()).await;
    assert_eq!(left_conflicts.as_array().unwrap().len(), 1);
    assert_eq!(left_conflicts, conflicts(right.clone()).await);

    let leaves = left.get_open_revs("doc", OpenRevs::All).await.unwrap();
    assert_eq!(leaves.len(), 2);

    left.shutdown().await;
    right.shutdown().await;
}

/// Tests a selector-filtered replication.
#[tokio::test]
async fn filtered_replication_copies_matching_documents() {
    let source = common::memory_db().await;
    let target = common::memory_db().await;
    common::put(&source, json!({"_id": "a", "keep": true})).await;
    common::put(&source, json!({"_id": "b", "keep": false})).await;
    common::put(&source, json!({"_id": "c", "keep": true})).await;

    let filtered = ReplicationOptions {
        selector: Some(json!({"keep": true})),
        ..ReplicationOptions::default()
    };
    let result = source.replicate_to(&target, filtered).await.unwrap();
    assert_eq!(result.docs_written, 2);
    assert!(target.get("b", GetOptions::default()).await.unwrap_err().is_not_found());

    // The unfiltered replication has its own checkpoint and starts over.
    let full = source.replicate_to(&target, ReplicationOptions::default()).await.unwrap();
    assert_eq!(full.start_seq, Seq::ZERO);
    assert_eq!(full.docs_written, 1);
    assert!(target.get("b", GetOptions::default()).await.is_ok());

    source.shutdown().await;
    target.shutdown().await;
}

/// Tests that a cancelled replication stops without error.
#[tokio::test]
async fn cancelled_replication_stops() {
    let source = common::memory_db().await;
    let target = common::memory_db().await;
    common::put(&source, json!({"_id": "a"})).await;

    let opts = ReplicationOptions::default();
    opts.cancel.cancel();
    let result = source.replicate_to(&target, opts).await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.docs_written, 0);
    assert!(target.get("a", GetOptions::default()).await.unwrap_err().is_not_found());

    source.shutdown().await;
    target.shutdown().await;
}

/// Tests that revisions the target already has are not fetched again.
#[tokio::test]
async fn known_revisions_are_skipped() {
    let source = common::memory_db().await;
    let target = common::memory_db().await;

    let doc = common::replicated("shared", 1, &["abc"], json!({"v": 1}));
    source.bulk_docs(vec![doc.clone()], false).await.unwrap();
    target.bulk_docs(vec![doc], false).await.unwrap();

    let mut wanted = BTreeMap::new();
    wanted.insert("shared".to_string(), vec![RevId::parse("1-abc").unwrap()]);
    assert!(target.revs_diff(wanted).await.unwrap().is_empty());

    let result = target.replicate_from(&source, ReplicationOptions::default()).await.unwrap();
    assert_eq!(result.docs_read, 0);
    assert_eq!(result.last_seq, Seq::from_raw(1));

    source.shutdown().await;
    target.shutdown().await;
}

/// Tests replication between file databases across a restart of the target.
#[tokio::test]
async fn checkpoint_survives_restart() {
    let (source, _source_dir) = common::file_db("source.db").await;
    let (target, target_dir) = common::file_db("target.db").await;
    let target_path = target_dir.path().join("target.db");

    for i in 0..3 {
        common::put(&source, json!({"_id": format!("d{i}")})).await;
    }
    source.replicate_to(&target, ReplicationOptions::default()).await.unwrap();
    target.shutdown().await;

    let target = SofaDB::open(&target_path).await.unwrap();
    common::put(&source, json!({"_id": "d3"})).await;
    let result = source.replicate_to(&target, ReplicationOptions::default()).await.unwrap();
    assert_eq!(result.start_seq, Seq::from_raw(3));
    assert_eq!(result.docs_written, 1);
    assert_eq!(target.info().await.unwrap().doc_count, 4);

    source.shutdown().await;
    target.shutdown().await;
}
