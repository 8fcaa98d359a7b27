//! Change Feed Tests
//!
//! Tests the invariants around changes:
//! - Each document appears once, at the sequence of its latest write
//! - Feeds resume exactly after `since`
//! - Every filter kind sees the winning revision and never a partial batch
//! - Live subscriptions deliver catch-up first, then new commits in order

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sofadb::{ChangeEvent, ChangeFilter, ChangesOptions, ChangesStyle, DbConfig, Error, Seq, SofaDB};

fn ids(events: &[ChangeEvent]) -> Vec<String> {
    events.iter().map(|e| e.id.clone()).collect()
}

async fn seed(db: &SofaDB) {
    let docs = vec![
        json!({"_id": "p1", "type": "post", "score": 5}),
        json!({"_id": "c1", "type": "comment", "score": 1}),
        json!({"_id": "p2", "type": "post", "score": 9}),
    ];
    for result in db.bulk_docs(docs, true).await.unwrap() {
        result.unwrap();
    }
}

/// Tests that an edited document moves to the end of the feed.
#[tokio::test]
async fn updated_document_appears_once_at_latest_seq() {
    let db = common::memory_db().await;
    let first = common::put(&db, json!({"_id": "a"})).await;
    common::put(&db, json!({"_id": "b"})).await;
    common::put(&db, json!({"_id": "a", "_rev": first, "edited": true})).await;

    let feed = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(ids(&feed.results), vec!["b", "a"]);
    assert_eq!(feed.results[1].seq, Seq::from_raw(3));
    assert_eq!(feed.last_seq, Seq::from_raw(3));

    let resumed = db
        .changes(ChangesOptions {
            since: Seq::from_raw(2),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&resumed.results), vec!["a"]);

    db.shutdown().await;
}

/// Tests include_docs, deletions and the limit.
#[tokio::test]
async fn include_docs_and_deletions() {
    let db = common::memory_db().await;
    let rev = common::put(&db, json!({"_id": "gone", "v": 1})).await;
    db.remove("gone", &rev).await.unwrap();
    common::put(&db, json!({"_id": "kept", "v": 2})).await;

    let feed = db
        .changes(ChangesOptions {
            include_docs: true,
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&feed.results), vec!["gone", "kept"]);
    assert!(feed.results[0].deleted);
    assert_eq!(feed.results[0].doc.as_ref().unwrap()["_deleted"], json!(true));
    assert_eq!(feed.results[1].doc.as_ref().unwrap()["v"], json!(2));

    let limited = db
        .changes(ChangesOptions {
            limit: Some(1),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.results.len(), 1);
    assert_eq!(limited.last_seq, limited.results[0].seq);

    db.shutdown().await;
}

/// Tests that all_docs style lists every leaf of a conflicted document.
#[tokio::test]
async fn all_docs_style_lists_conflicts() {
    let db = common::memory_db().await;
    let docs = vec![
        common::replicated("doc", 2, &["bbb", "aaa"], json!({})),
        common::replicated("doc", 2, &["ccc", "aaa"], json!({})),
    ];
    db.bulk_docs(docs, false).await.unwrap();

    let main = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(main.results[0].changes.len(), 1);
    assert_eq!(main.results[0].changes[0].rev, "2-ccc");

    let all = db
        .changes(ChangesOptions {
            style: ChangesStyle::AllDocs,
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    let revs: Vec<&str> = all.results[0].changes.iter().map(|c| c.rev.as_str()).collect();
    assert_eq!(revs, vec!["2-ccc", "2-bbb"]);

    db.shutdown().await;
}

/// Tests a design document filter with query parameters.
#[tokio::test]
async fn design_filter_with_query_params() {
    let db = common::memory_db().await;
    common::put(
        &db,
        json!({
            "_id": "_design/app",
            "filters": {"by_type": "function (doc, req) { return doc.type === req.query.type; }"},
        }),
    )
    .await;
    seed(&db).await;

    let mut query_params = Map::new();
    query_params.insert("type".to_string(), json!("post"));
    let feed = db
        .changes(ChangesOptions {
            filter: Some(ChangeFilter::Named("app/by_type".into())),
            query_params,
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&feed.results), vec!["p1", "p2"]);
    // Non-matching rows still advance the sequence.
    assert_eq!(feed.last_seq, db.info().await.unwrap().update_seq);

    let missing = db
        .changes(ChangesOptions {
            filter: Some(ChangeFilter::Named("app/absent".into())),
            ..ChangesOptions::default()
        })
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    db.shutdown().await;
}

/// Tests the selector, view, doc_ids and predicate filters.
#[tokio::test]
async fn builtin_filters() {
    let db = common::memory_db().await;
    common::put(
        &db,
        json!({
            "_id": "_design/app",
            "views": {"comments": {"map": "function (doc) { if (doc.type === 'comment') { emit(doc._id); } }"}},
        }),
    )
    .await;
    seed(&db).await;

    let selector = db
        .changes(ChangesOptions {
            selector: Some(json!({"type": "post", "score": {"$gt": 6}})),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&selector.results), vec!["p2"]);

    let view = db
        .changes(ChangesOptions {
            view: Some("app/comments".into()),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&view.results), vec!["c1"]);

    let doc_ids = db
        .changes(ChangesOptions {
            doc_ids: Some(vec!["p2".into(), "c1".into()]),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&doc_ids.results), vec!["c1", "p2"]);

    let predicate = db
        .changes(ChangesOptions {
            filter: Some(ChangeFilter::Predicate(Arc::new(|doc: &Value| doc["score"] == json!(5)))),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&predicate.results), vec!["p1"]);

    // doc_ids narrows any other filter too.
    let narrowed = db
        .changes(ChangesOptions {
            selector: Some(json!({"type": "post"})),
            doc_ids: Some(vec!["p1".into()]),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&narrowed.results), vec!["p1"]);

    db.shutdown().await;
}

/// Tests that malformed filter requests are rejected.
#[tokio::test]
async fn invalid_filter_requests() {
    let db = common::memory_db().await;

    let view_without_name = db
        .changes(ChangesOptions {
            filter: Some(ChangeFilter::Named("_view".into())),
            ..ChangesOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(view_without_name, Error::BadRequest(_)));

    let selector_with_filter = db
        .changes(ChangesOptions {
            filter: Some(ChangeFilter::Named("app/f".into())),
            selector: Some(json!({})),
            ..ChangesOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(selector_with_filter, Error::BadRequest(_)));

    db.shutdown().await;
}

/// Tests that a feed larger than one storage batch is read completely.
#[tokio::test]
async fn feed_spans_storage_batches() {
    let config = DbConfig {
        changes_batch_size: 3,
        ..DbConfig::default()
    };
    let db = common::memory_db_with(config).await;
    let docs: Vec<Value> = (0..10).map(|i| json!({"_id": format!("d{i:02}"), "even": i % 2 == 0})).collect();
    db.bulk_docs(docs, true).await.unwrap();

    let all = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(all.results.len(), 10);

    let even = db
        .changes(ChangesOptions {
            selector: Some(json!({"even": true})),
            limit: Some(4),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(ids(&even.results), vec!["d00", "d02", "d04", "d06"]);

    db.shutdown().await;
}

/// Tests that a subscription catches up, then follows new writes.
#[tokio::test]
async fn subscription_catches_up_then_goes_live() {
    let db = common::memory_db().await;
    common::put(&db, json!({"_id": "before"})).await;

    let mut sub = db.subscribe(ChangesOptions::default()).await.unwrap();
    let first = sub.next().await.unwrap().unwrap();
    assert_eq!(first.id, "before");

    let writer = db.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.put(json!({"_id": "after-1"})).await.unwrap();
        writer.put(json!({"_id": "after-2"})).await.unwrap();
    });

    let second = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("live change")
        .unwrap()
        .unwrap();
    let third = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("live change")
        .unwrap()
        .unwrap();
    assert_eq!(second.id, "after-1");
    assert_eq!(third.id, "after-2");
    assert!(second.seq < third.seq);

    sub.cancel();
    assert!(sub.next().await.is_none());

    db.shutdown().await;
}

/// Tests that a filtered subscription honours its filter and limit.
#[tokio::test]
async fn filtered_subscription_with_limit() {
    let db = common::memory_db().await;
    let mut sub = db
        .subscribe(ChangesOptions {
            selector: Some(json!({"type": "post"})),
            limit: Some(2),
            include_docs: true,
            ..ChangesOptions::default()
        })
        .await
        .unwrap();

    seed(&db).await;
    common::put(&db, json!({"_id": "p3", "type": "post"})).await;

    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("subscription stalled")
    {
        let event = event.unwrap();
        assert_eq!(event.doc.as_ref().unwrap()["type"], json!("post"));
        seen.push(event.id);
    }
    assert_eq!(seen, vec!["p1", "p2"]);

    db.shutdown().await;
}

/// Tests that a subscription on a file database sees commits through the reader pool.
#[tokio::test]
async fn subscription_on_file_database() {
    let (db, _dir) = common::file_db("live.db").await;
    let mut sub = db
        .subscribe(ChangesOptions {
            since: db.info().await.unwrap().update_seq,
            limit: Some(1),
            ..ChangesOptions::default()
        })
        .await
        .unwrap();

    db.put(json!({"_id": "x"})).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("live change")
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "x");
    assert!(sub.next().await.is_none());

    db.shutdown().await;
}
