/// Replay and durability tests
///
/// OpenIterator marker dispatch, replay determinism, and the full
/// WAL round trip across a simulated restart.
/// Run with: cargo test --test replay_tests

use rustdocdb::collection::document::DocumentBody;
use rustdocdb::collection::{CollectionType, DocumentCollection, KeyGenerator, OpenIterator};
use rustdocdb::core::{CollectionId, DatafileId, IndexId, VocbaseId};
use rustdocdb::{
    AccessType, DurabilityMode, EngineConfig, Index, LogEntry, Marker, TickService,
    TransactionHints, TransactionId, TransactionScope, Vocbase, insert_document, read_document,
    remove_document, update_document,
};
use serde_json::json;
use std::sync::Arc;

const VOCBASE: VocbaseId = VocbaseId(1);
const CID: CollectionId = CollectionId(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fresh_collection() -> Arc<DocumentCollection> {
    init_logging();
    Arc::new(
        DocumentCollection::new(
            CID,
            VOCBASE,
            "replayed".to_string(),
            CollectionType::Documents,
            KeyGenerator::traditional(),
            IndexId(3),
            None,
            None,
        )
        .unwrap(),
    )
}

fn body_bytes(key: &str) -> Vec<u8> {
    DocumentBody::new(key.to_string(), 0, 2, &json!({"_key": key}))
        .unwrap()
        .data
}

fn insert_marker(tid: u64, key: &str, revision: u64) -> Marker {
    Marker::MvccDocumentInsert {
        vocbase_id: VOCBASE,
        cid: CID,
        tid: TransactionId::top_level(tid),
        from: TransactionId::top_level(tid),
        to: TransactionId::NONE,
        key: key.to_string(),
        revision,
        shape: 2,
        body: body_bytes(key),
    }
}

fn remove_marker(tid: u64, key: &str, revision: u64) -> Marker {
    Marker::MvccDocumentRemove {
        vocbase_id: VOCBASE,
        cid: CID,
        tid: TransactionId::top_level(tid),
        from: TransactionId::NONE,
        to: TransactionId::top_level(tid),
        key: key.to_string(),
        revision,
    }
}

fn begin_marker(tid: u64) -> Marker {
    Marker::BeginTransaction {
        vocbase_id: VOCBASE,
        tid: TransactionId::top_level(tid),
    }
}

fn commit_marker(tid: u64) -> Marker {
    Marker::CommitTransaction {
        vocbase_id: VOCBASE,
        tid: TransactionId::top_level(tid),
    }
}

fn abort_marker(tid: u64) -> Marker {
    Marker::AbortTransaction {
        vocbase_id: VOCBASE,
        tid: TransactionId::top_level(tid),
    }
}

fn entries(markers: Vec<Marker>) -> Vec<LogEntry> {
    markers
        .into_iter()
        .enumerate()
        .map(|(i, marker)| LogEntry {
            tick: 100 + i as u64,
            marker,
        })
        .collect()
}

fn replay(collection: &Arc<DocumentCollection>, entries: &[LogEntry]) -> (i64, i64, u64) {
    let ticks = Arc::new(TickService::new());
    let mut iterator = OpenIterator::new(Arc::clone(collection), ticks);
    let fid = DatafileId(1);
    for entry in entries {
        iterator.execute(fid, entry).unwrap();
    }
    let summary = iterator.finish().unwrap();
    (
        summary.document_count,
        summary.document_size,
        summary.revision_id,
    )
}

#[test]
fn test_replay_commits_and_drops_aborted_markers() {
    // insert of "a" committed by tid 10, removal aborted by tid 11
    let collection = fresh_collection();
    let log = entries(vec![
        begin_marker(10),
        insert_marker(10, "a", 1),
        commit_marker(10),
        begin_marker(11),
        remove_marker(11, "a", 2),
        abort_marker(11),
    ]);

    let (count, _, _) = replay(&collection, &log);
    assert_eq!(count, 1);

    let primary = collection.primary_index();
    let Index::Primary(primary) = &*primary else {
        panic!("expected the primary index");
    };
    let slot = primary.lookup_replay("a").unwrap().expect("a is present");
    let handle = collection.masterpointer_manager().handle(slot);
    assert_eq!(handle.revision(), 1);

    // the aborted remove still counts as a deletion marker
    let stats = collection.datafile_statistics(DatafileId(1)).unwrap();
    assert_eq!(stats.number_deletion, 1);
    assert_eq!(stats.number_alive, 1);
}

#[test]
fn test_replay_supersedes_by_revision() {
    let collection = fresh_collection();
    let log = entries(vec![
        begin_marker(10),
        insert_marker(10, "a", 5),
        commit_marker(10),
        begin_marker(11),
        insert_marker(11, "a", 9),
        commit_marker(11),
        // an outdated insert arriving late stays dead
        begin_marker(12),
        insert_marker(12, "a", 7),
        commit_marker(12),
    ]);

    let (count, _, revision) = replay(&collection, &log);
    assert_eq!(count, 1);
    assert_eq!(revision, 9);

    let primary = collection.primary_index();
    let Index::Primary(primary) = &*primary else {
        panic!("expected the primary index");
    };
    let slot = primary.lookup_replay("a").unwrap().unwrap();
    assert_eq!(collection.masterpointer_manager().handle(slot).revision(), 9);

    let stats = collection.datafile_statistics(DatafileId(1)).unwrap();
    assert_eq!(stats.number_alive, 1);
    assert_eq!(stats.number_dead, 2);
}

#[test]
fn test_replay_is_deterministic() {
    let log = entries(vec![
        begin_marker(10),
        insert_marker(10, "a", 1),
        insert_marker(10, "b", 2),
        commit_marker(10),
        begin_marker(11),
        insert_marker(11, "a", 3),
        remove_marker(11, "b", 4),
        commit_marker(11),
        begin_marker(12),
        insert_marker(12, "c", 5),
        abort_marker(12),
    ]);

    let first = fresh_collection();
    let second = fresh_collection();
    let summary_first = replay(&first, &log);
    let summary_second = replay(&second, &log);

    assert_eq!(summary_first, summary_second);
    assert_eq!(
        first.all_datafile_statistics(),
        second.all_datafile_statistics()
    );

    for key in ["a", "b", "c"] {
        let lookup = |collection: &Arc<DocumentCollection>| {
            let primary = collection.primary_index();
            let Index::Primary(primary) = &*primary else {
                panic!("expected the primary index");
            };
            primary
                .lookup_replay(key)
                .unwrap()
                .map(|slot| collection.masterpointer_manager().handle(slot).revision())
        };
        assert_eq!(lookup(&first), lookup(&second), "membership of '{}'", key);
    }
}

#[test]
fn test_replay_tracks_ticks() {
    let collection = fresh_collection();
    let ticks = Arc::new(TickService::new());
    let mut iterator = OpenIterator::new(Arc::clone(&collection), Arc::clone(&ticks));
    for entry in entries(vec![
        begin_marker(10),
        insert_marker(10, "a", 1),
        commit_marker(10),
    ]) {
        iterator.execute(DatafileId(1), &entry).unwrap();
    }
    iterator.finish().unwrap();

    // the tick service is seeded past everything replayed
    assert!(ticks.current() >= 102);
    let stats = collection.datafile_statistics(DatafileId(1)).unwrap();
    assert_eq!(stats.tick_min, 100);
    assert_eq!(stats.tick_max, 102);
    assert_eq!(stats.data_min, 101);
    assert_eq!(stats.data_max, 101);
    assert!(collection.tick_max() >= 102);
}

#[test]
fn test_wal_round_trip_across_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        durability: DurabilityMode::Sync,
        ..EngineConfig::default()
    };

    {
        let vocbase = Vocbase::new(
            "restart",
            config.clone(),
            Some(dir.path().to_path_buf()),
        )
        .unwrap();
        vocbase
            .create_collection("users", CollectionType::Documents, None)
            .unwrap();
        vocbase
            .create_index(
                "users",
                &json!({"type": "hash", "fields": ["email"], "unique": true, "sparse": false}),
            )
            .unwrap();

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
        insert_document(&txn, &coll, json!({"_key": "a", "email": "a@x"}), false).unwrap();
        insert_document(&txn, &coll, json!({"_key": "b", "email": "b@x"}), false).unwrap();
        insert_document(&txn, &coll, json!({"_key": "c", "email": "c@x"}), false).unwrap();
        scope.commit().unwrap();

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
        update_document(&txn, &coll, "a", json!({"email": "a@x", "v": 2}), false).unwrap();
        remove_document(&txn, &coll, "b", true).unwrap();
        scope.commit().unwrap();

        // an uncommitted transaction leaves markers that must not replay
        {
            let scope = TransactionScope::new(
                &vocbase,
                &[("users", AccessType::Write)],
                TransactionHints::new(),
                false,
                false,
            )
            .unwrap();
            let txn = scope.transaction().clone();
            let coll = txn.collection("users", AccessType::Write).unwrap();
            insert_document(&txn, &coll, json!({"_key": "x", "email": "x@x"}), false).unwrap();
        }
    }

    // "restart": a new vocbase over the same directory finds the collection
    // through its parameter file and replays the WAL
    let vocbase = Vocbase::new("restart", config, Some(dir.path().to_path_buf())).unwrap();
    let summary = vocbase.open_collection("users").unwrap();
    assert_eq!(summary.document_count, 2);

    let scope = TransactionScope::new(
        &vocbase,
        &[("users", AccessType::Read)],
        TransactionHints::new(),
        false,
        false,
    )
    .unwrap();
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();

    let (_, value) = read_document(&txn, &coll, "a").unwrap();
    assert_eq!(value["v"], json!(2));
    assert!(read_document(&txn, &coll, "b").is_err());
    assert!(read_document(&txn, &coll, "c").is_ok());
    assert!(read_document(&txn, &coll, "x").is_err());

    // the unique hash index was reconstructed from its descriptor and
    // refilled
    let collection = vocbase.collection_by_name("users").unwrap();
    let indexes = collection.indexes();
    assert_eq!(indexes.len(), 2);
    let Index::Hash(hash) = &*indexes[1] else {
        panic!("expected the reconstructed hash index");
    };
    let found = hash.lookup(&coll, &txn, &[json!("c@x")]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key().unwrap(), "c");
}

#[test]
fn test_key_generator_resumes_after_replay() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        durability: DurabilityMode::Sync,
        ..EngineConfig::default()
    };
    let key_options = json!({"type": "autoincrement", "offset": 0, "increment": 5});

    {
        let vocbase = Vocbase::new("keygen", config.clone(), Some(dir.path().to_path_buf()))
            .unwrap();
        vocbase
            .create_collection("seq", CollectionType::Documents, Some(&key_options))
            .unwrap();

        let mut scope = TransactionScope::new(
            &vocbase,
            &[("seq", AccessType::Write)],
            TransactionHints::new(),
            false,
            false,
        )
        .unwrap();
        let txn = scope.transaction().clone();
        let coll = txn.collection("seq", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "20"}), false).unwrap();
        scope.commit().unwrap();
    }

    let vocbase = Vocbase::new("keygen", config, Some(dir.path().to_path_buf())).unwrap();
    vocbase.open_collection("seq").unwrap();

    let mut scope = TransactionScope::new(
        &vocbase,
        &[("seq", AccessType::Write)],
        TransactionHints::new(),
        false,
        false,
    )
    .unwrap();
    let txn = scope.transaction().clone();
    let coll = txn.collection("seq", AccessType::Write).unwrap();
    let descriptor = insert_document(&txn, &coll, json!({"value": 1}), false).unwrap();
    scope.commit().unwrap();

    // generation resumed above the replayed key 20
    assert_eq!(descriptor.key, "25");
}
