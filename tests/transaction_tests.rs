/// MVCC transaction tests
///
/// Lifecycle, visibility and conflict behavior of the transaction subsystem.
/// Run with: cargo test --test transaction_tests

use rustdocdb::{
    AccessType, DbError, EngineConfig, TransactionHints, TransactionScope, TransactionStatus,
    Vocbase, insert_document, read_document, remove_document, update_document,
};
use rustdocdb::collection::CollectionType;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn vocbase(name: &str) -> Arc<Vocbase> {
    Vocbase::new(name, EngineConfig::default(), None).unwrap()
}

fn write_scope(vocbase: &Arc<Vocbase>, collection: &str) -> TransactionScope {
    TransactionScope::new(
        vocbase,
        &[(collection, AccessType::Write)],
        TransactionHints::new(),
        false,
        false,
    )
    .unwrap()
}

fn read_scope(vocbase: &Arc<Vocbase>, collection: &str) -> TransactionScope {
    TransactionScope::new(
        vocbase,
        &[(collection, AccessType::Read)],
        TransactionHints::new(),
        false,
        false,
    )
    .unwrap()
}

#[test]
fn test_insert_and_read_in_same_transaction() {
    let vocbase = vocbase("txn_insert_read");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();

    let inserted = insert_document(
        &txn,
        &coll,
        json!({"_key": "alice", "city": "Cologne"}),
        false,
    )
    .unwrap();

    let (descriptor, value) = read_document(&txn, &coll, "alice").unwrap();
    assert_eq!(descriptor.revision, inserted.revision);
    assert_eq!(value["city"], json!("Cologne"));

    scope.commit().unwrap();
}

#[test]
fn test_update_in_same_transaction_returns_new_value() {
    let vocbase = vocbase("txn_update_read");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();

    insert_document(&txn, &coll, json!({"_key": "bob", "age": 1}), false).unwrap();
    let updated = update_document(&txn, &coll, "bob", json!({"age": 2}), false).unwrap();

    let (descriptor, value) = read_document(&txn, &coll, "bob").unwrap();
    assert_eq!(descriptor.revision, updated.revision);
    assert_eq!(value["age"], json!(2));

    scope.commit().unwrap();
}

#[test]
fn test_snapshot_reader_does_not_see_later_commit() {
    let vocbase = vocbase("txn_snapshot");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    // reader begins first
    let reader = read_scope(&vocbase, "users");
    let reader_txn = reader.transaction().clone();
    let reader_coll = reader_txn.collection("users", AccessType::Read).unwrap();

    // writer inserts and commits afterwards
    {
        let mut writer = write_scope(&vocbase, "users");
        let txn = writer.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "new"}), false).unwrap();
        writer.commit().unwrap();
    }

    let result = read_document(&reader_txn, &reader_coll, "new");
    assert!(matches!(result, Err(DbError::DocumentNotFound)));
    drop(reader);

    // a reader starting now sees the document
    let late = read_scope(&vocbase, "users");
    let txn = late.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(read_document(&txn, &coll, "new").is_ok());
}

#[test]
fn test_old_snapshot_keeps_seeing_pre_update_version() {
    let vocbase = vocbase("txn_old_version");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "carol", "v": 1}), false).unwrap();
        scope.commit().unwrap();
    }

    let reader = read_scope(&vocbase, "users");
    let reader_txn = reader.transaction().clone();
    let reader_coll = reader_txn.collection("users", AccessType::Read).unwrap();

    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        update_document(&txn, &coll, "carol", json!({"v": 2}), false).unwrap();
        scope.commit().unwrap();
    }

    // the old snapshot still reads version 1
    let (_, value) = read_document(&reader_txn, &reader_coll, "carol").unwrap();
    assert_eq!(value["v"], json!(1));
    drop(reader);

    let late = read_scope(&vocbase, "users");
    let txn = late.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    let (_, value) = read_document(&txn, &coll, "carol").unwrap();
    assert_eq!(value["v"], json!(2));
}

#[test]
fn test_rollback_undoes_inserts_and_keeps_pool_size() {
    let vocbase = vocbase("txn_rollback");
    let collection = vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    // one committed insert so the first arena block exists
    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "keep"}), false).unwrap();
        scope.commit().unwrap();
    }

    let manager = collection.masterpointer_manager();
    let pool_before = manager.pool_size();
    let linked_before = manager.linked_totals().0;

    {
        let scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "gone"}), false).unwrap();
        // dropped without commit: automatic rollback
    }

    assert_eq!(manager.pool_size(), pool_before);
    assert_eq!(manager.linked_totals().0, linked_before);

    let reader = read_scope(&vocbase, "users");
    let txn = reader.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(matches!(
        read_document(&txn, &coll, "gone"),
        Err(DbError::DocumentNotFound)
    ));
    assert!(read_document(&txn, &coll, "keep").is_ok());
}

#[test]
fn test_unique_insert_visible_conflict() {
    let vocbase = vocbase("txn_unique_visible");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["email"], "unique": true, "sparse": false}),
        )
        .unwrap();

    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "1", "email": "a@x"}), false).unwrap();
        scope.commit().unwrap();
    }

    let scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();
    let result = insert_document(&txn, &coll, json!({"_key": "2", "email": "a@x"}), false);
    assert!(matches!(result, Err(DbError::UniqueConstraintViolated(_))));
}

#[test]
fn test_write_conflict_between_concurrent_writers() {
    let vocbase = vocbase("txn_write_conflict");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["email"], "unique": true, "sparse": false}),
        )
        .unwrap();

    let mut scope_a = write_scope(&vocbase, "users");
    let txn_a = scope_a.transaction().clone();
    let coll_a = txn_a.collection("users", AccessType::Write).unwrap();
    insert_document(&txn_a, &coll_a, json!({"_key": "1", "email": "a@x"}), false).unwrap();

    {
        let scope_b = write_scope(&vocbase, "users");
        let txn_b = scope_b.transaction().clone();
        let coll_b = txn_b.collection("users", AccessType::Write).unwrap();
        let result = insert_document(&txn_b, &coll_b, json!({"_key": "2", "email": "a@x"}), false);
        assert!(matches!(result, Err(DbError::WriteConflict(_))));
    }

    // after A commits, a retry hits the committed record instead
    scope_a.commit().unwrap();

    let scope_b = write_scope(&vocbase, "users");
    let txn_b = scope_b.transaction().clone();
    let coll_b = txn_b.collection("users", AccessType::Write).unwrap();
    let result = insert_document(&txn_b, &coll_b, json!({"_key": "2", "email": "a@x"}), false);
    assert!(matches!(result, Err(DbError::UniqueConstraintViolated(_))));
}

#[test]
fn test_nested_commit_becomes_visible_with_top_level() {
    let vocbase = vocbase("txn_nested");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut parent =
        TransactionScope::new(&vocbase, &[], TransactionHints::new(), false, true).unwrap();

    {
        let mut child = TransactionScope::new(
            &vocbase,
            &[("users", AccessType::Write)],
            TransactionHints::new(),
            true,
            true,
        )
        .unwrap();
        let child_txn = child.transaction().clone();
        assert!(!child_txn.is_top_level());

        let coll = child_txn.collection("users", AccessType::Write).unwrap();
        insert_document(&child_txn, &coll, json!({"_key": "k"}), false).unwrap();
        child.commit().unwrap();
    }

    // the child committed, but the top level did not: still invisible
    {
        let outside = read_scope(&vocbase, "users");
        let txn = outside.transaction().clone();
        let coll = txn.collection("users", AccessType::Read).unwrap();
        assert!(matches!(
            read_document(&txn, &coll, "k"),
            Err(DbError::DocumentNotFound)
        ));
    }

    parent.commit().unwrap();

    let outside = read_scope(&vocbase, "users");
    let txn = outside.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(read_document(&txn, &coll, "k").is_ok());
}

#[test]
fn test_nested_rollback_discards_child_writes() {
    let vocbase = vocbase("txn_nested_rollback");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut parent =
        TransactionScope::new(&vocbase, &[], TransactionHints::new(), false, true).unwrap();

    {
        let child = TransactionScope::new(
            &vocbase,
            &[("users", AccessType::Write)],
            TransactionHints::new(),
            true,
            true,
        )
        .unwrap();
        let child_txn = child.transaction().clone();
        let coll = child_txn.collection("users", AccessType::Write).unwrap();
        insert_document(&child_txn, &coll, json!({"_key": "dropped"}), false).unwrap();
        // child scope dropped without commit: rolled back
    }

    parent.commit().unwrap();

    let outside = read_scope(&vocbase, "users");
    let txn = outside.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(matches!(
        read_document(&txn, &coll, "dropped"),
        Err(DbError::DocumentNotFound)
    ));
}

#[test]
fn test_scope_joins_existing_transaction() {
    let vocbase = vocbase("txn_join");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut outer = TransactionScope::new(
        &vocbase,
        &[("users", AccessType::Write)],
        TransactionHints::new(),
        false,
        true,
    )
    .unwrap();
    let outer_txn = outer.transaction().clone();

    {
        let mut inner = TransactionScope::new(
            &vocbase,
            &[("users", AccessType::Write)],
            TransactionHints::new(),
            false,
            true,
        )
        .unwrap();
        assert!(!inner.is_our());
        assert!(Arc::ptr_eq(inner.transaction(), &outer_txn));

        let inner_txn = inner.transaction().clone();
        let coll = inner_txn.collection("users", AccessType::Write).unwrap();
        insert_document(&inner_txn, &coll, json!({"_key": "joined"}), false).unwrap();

        // commit through the inner scope is deferred to the owner
        inner.commit().unwrap();
        assert_eq!(outer_txn.status(), TransactionStatus::Ongoing);
    }

    outer.commit().unwrap();

    let reader = read_scope(&vocbase, "users");
    let txn = reader.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(read_document(&txn, &coll, "joined").is_ok());
}

#[test]
fn test_killed_transaction_rolls_back_at_commit() {
    let vocbase = vocbase("txn_killed");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let mut scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();
    insert_document(&txn, &coll, json!({"_key": "victim"}), false).unwrap();

    txn.manager().kill_transaction(txn.id().own()).unwrap();

    let result = scope.commit();
    assert!(result.is_err());
    assert_eq!(txn.status(), TransactionStatus::RolledBack);

    let reader = read_scope(&vocbase, "users");
    let reader_txn = reader.transaction().clone();
    let reader_coll = reader_txn.collection("users", AccessType::Read).unwrap();
    assert!(matches!(
        read_document(&reader_txn, &reader_coll, "victim"),
        Err(DbError::DocumentNotFound)
    ));
}

#[test]
fn test_status_oracle_reports_terminal_states() {
    let vocbase = vocbase("txn_status");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let committed_id;
    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        committed_id = txn.id();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "s1"}), false).unwrap();
        scope.commit().unwrap();
    }

    let rolled_back_id;
    {
        let scope = write_scope(&vocbase, "users");
        rolled_back_id = scope.transaction().id();
    }

    let manager = rustdocdb::txn::instance().unwrap();
    assert_eq!(
        manager.status_transaction(committed_id),
        TransactionStatus::Committed
    );
    assert_eq!(
        manager.status_transaction(rolled_back_id),
        TransactionStatus::RolledBack
    );
}

#[test]
fn test_running_transactions_snapshot() {
    let vocbase = vocbase("txn_running");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();

    let manager = rustdocdb::txn::instance().unwrap();
    let running = manager.running_transactions(vocbase.id());
    assert!(running.iter().any(|info| info.id == txn.id()));

    drop(scope);
    let running = manager.running_transactions(vocbase.id());
    assert!(!running.iter().any(|info| info.id == txn.id()));
}

#[test]
fn test_write_throttle_timeout() {
    let config = EngineConfig {
        throttle_max_wait: Duration::from_millis(100),
        throttle_poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let vocbase = Vocbase::new("txn_throttle", config, None).unwrap();
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    vocbase.wal().set_throttled(true);
    let result = TransactionScope::new(
        &vocbase,
        &[("users", AccessType::Write)],
        TransactionHints::new(),
        false,
        false,
    );
    assert!(matches!(result, Err(DbError::WriteThrottleTimeout)));

    vocbase.wal().set_throttled(false);
    assert!(write_scope(&vocbase, "users").commit().is_ok());
}

#[test]
fn test_upgrade_to_write_in_nested_scope_fails() {
    let vocbase = vocbase("txn_upgrade");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let _outer = TransactionScope::new(
        &vocbase,
        &[("users", AccessType::Read)],
        TransactionHints::new(),
        false,
        true,
    )
    .unwrap();

    let result = TransactionScope::new(
        &vocbase,
        &[("users", AccessType::Write)],
        TransactionHints::new(),
        false,
        true,
    );
    assert!(matches!(result, Err(DbError::TransactionInternal(_))));
}

#[test]
fn test_concurrent_writers_on_distinct_keys() {
    let vocbase = vocbase("txn_concurrent");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    let num_threads = 4;
    let writes_per_thread = 25;
    let mut handles = vec![];

    for thread_id in 0..num_threads {
        let vocbase = Arc::clone(&vocbase);
        handles.push(thread::spawn(move || {
            for i in 0..writes_per_thread {
                let mut scope = TransactionScope::new(
                    &vocbase,
                    &[("users", AccessType::Write)],
                    TransactionHints::new(),
                    false,
                    false,
                )
                .unwrap();
                let txn = scope.transaction().clone();
                let coll = txn.collection("users", AccessType::Write).unwrap();
                let key = format!("t{}-{}", thread_id, i);
                insert_document(&txn, &coll, json!({"_key": key}), false).unwrap();
                scope.commit().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let collection = vocbase.collection_by_name("users").unwrap();
    assert_eq!(
        collection.document_count(),
        (num_threads * writes_per_thread) as i64
    );
}

#[test]
fn test_remove_then_read_fails() {
    let vocbase = vocbase("txn_remove");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "tmp"}), false).unwrap();
        scope.commit().unwrap();
    }

    {
        let mut scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        remove_document(&txn, &coll, "tmp", false).unwrap();
        // invisible to ourselves right away
        assert!(matches!(
            read_document(&txn, &coll, "tmp"),
            Err(DbError::DocumentNotFound)
        ));
        scope.commit().unwrap();
    }

    let reader = read_scope(&vocbase, "users");
    let txn = reader.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    assert!(matches!(
        read_document(&txn, &coll, "tmp"),
        Err(DbError::DocumentNotFound)
    ));
}
