/// Secondary index tests
///
/// Hash, skiplist, geo, fulltext, edge and cap-constraint behavior.
/// Run with: cargo test --test index_tests

use rustdocdb::collection::CollectionType;
use rustdocdb::{
    AccessType, DbError, EdgeDirection, EdgeRef, EngineConfig, FulltextTerm, Index,
    SkiplistOperator, TermOperation, TransactionHints, TransactionScope, Vocbase, insert_document,
    insert_edge,
};
use serde_json::json;
use std::sync::Arc;

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

fn insert_all(vocbase: &Arc<Vocbase>, collection: &str, documents: &[serde_json::Value]) {
    let mut scope = write_scope(vocbase, collection);
    let txn = scope.transaction().clone();
    let coll = txn.collection(collection, AccessType::Write).unwrap();
    for document in documents {
        insert_document(&txn, &coll, document.clone(), false).unwrap();
    }
    scope.commit().unwrap();
}

#[test]
fn test_hash_index_lookup() {
    let vocbase = vocbase("idx_hash");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    let index = vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["name"], "unique": false, "sparse": false}),
        )
        .unwrap();

    insert_all(
        &vocbase,
        "users",
        &[
            json!({"_key": "a", "name": "nina"}),
            json!({"_key": "b", "name": "nina"}),
            json!({"_key": "c", "name": "otto"}),
        ],
    );

    let scope = read_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();

    let Index::Hash(hash) = &*index else {
        panic!("expected a hash index");
    };
    let found = hash.lookup(&coll, &txn, &[json!("nina")]).unwrap();
    assert_eq!(found.len(), 2);
    let found = hash.lookup(&coll, &txn, &[json!("paula")]).unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_hash_index_fill_from_existing_documents() {
    let vocbase = vocbase("idx_hash_fill");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();

    insert_all(
        &vocbase,
        "users",
        &[
            json!({"_key": "a", "group": 1}),
            json!({"_key": "b", "group": 1}),
        ],
    );

    // index created after the fact is filled from the primary
    let index = vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["group"], "unique": false, "sparse": false}),
        )
        .unwrap();

    let scope = read_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    let Index::Hash(hash) = &*index else {
        panic!("expected a hash index");
    };
    assert_eq!(hash.lookup(&coll, &txn, &[json!(1)]).unwrap().len(), 2);
}

#[test]
fn test_sparse_index_excludes_missing_and_null_paths() {
    let vocbase = vocbase("idx_sparse");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    let sparse = vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["nick"], "unique": false, "sparse": true}),
        )
        .unwrap();
    let full = vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["nick"], "unique": false, "sparse": false}),
        )
        .unwrap();

    insert_all(
        &vocbase,
        "users",
        &[
            json!({"_key": "a", "nick": "zed"}),
            json!({"_key": "b", "nick": null}),
            json!({"_key": "c"}),
        ],
    );

    let scope = read_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();

    let Index::Hash(sparse) = &*sparse else {
        panic!("expected a hash index");
    };
    let Index::Hash(full) = &*full else {
        panic!("expected a hash index");
    };

    assert_eq!(sparse.lookup(&coll, &txn, &[json!("zed")]).unwrap().len(), 1);
    // the null-valued and missing paths are excluded from the sparse index
    assert!(sparse.lookup(&coll, &txn, &[json!(null)]).unwrap().is_empty());
    // the non-sparse index carries both
    assert_eq!(full.lookup(&coll, &txn, &[json!(null)]).unwrap().len(), 2);
}

#[test]
fn test_skiplist_range_lookup_and_reverse() {
    let vocbase = vocbase("idx_skiplist");
    vocbase
        .create_collection("readings", CollectionType::Documents, None)
        .unwrap();
    let index = vocbase
        .create_index(
            "readings",
            &json!({"type": "skiplist", "fields": ["value"], "unique": false, "sparse": false}),
        )
        .unwrap();

    let documents: Vec<serde_json::Value> = (1..=5)
        .map(|i| json!({"_key": format!("r{}", i), "value": i}))
        .collect();
    insert_all(&vocbase, "readings", &documents);

    let scope = read_scope(&vocbase, "readings");
    let txn = scope.transaction().clone();
    let coll = txn.collection("readings", AccessType::Read).unwrap();
    let Index::Skiplist(skiplist) = &*index else {
        panic!("expected a skiplist index");
    };

    let operator = SkiplistOperator::And(
        Box::new(SkiplistOperator::Ge(vec![json!(2)])),
        Box::new(SkiplistOperator::Le(vec![json!(4)])),
    );

    let mut iter = skiplist.lookup(&coll, &txn, &operator, false).unwrap();
    let mut keys = Vec::new();
    while let Some(handle) = iter.next() {
        keys.push(handle.key().unwrap());
    }
    assert_eq!(keys, vec!["r2", "r3", "r4"]);

    let mut iter = skiplist.lookup(&coll, &txn, &operator, true).unwrap();
    let mut keys = Vec::new();
    while let Some(handle) = iter.next() {
        keys.push(handle.key().unwrap());
    }
    assert_eq!(keys, vec!["r4", "r3", "r2"]);

    let mut iter = skiplist
        .lookup(&coll, &txn, &SkiplistOperator::Eq(vec![json!(3)]), false)
        .unwrap();
    assert_eq!(iter.next().unwrap().key().unwrap(), "r3");
    assert!(iter.next().is_none());

    let mut iter = skiplist
        .lookup(&coll, &txn, &SkiplistOperator::Lt(vec![json!(2)]), false)
        .unwrap();
    assert_eq!(iter.next().unwrap().key().unwrap(), "r1");
    assert!(iter.next().is_none());
}

#[test]
fn test_skiplist_unique_conflict() {
    let vocbase = vocbase("idx_skiplist_unique");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_index(
            "users",
            &json!({"type": "skiplist", "fields": ["rank"], "unique": true, "sparse": false}),
        )
        .unwrap();

    insert_all(&vocbase, "users", &[json!({"_key": "a", "rank": 7})]);

    let scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();
    let result = insert_document(&txn, &coll, json!({"_key": "b", "rank": 7}), false);
    assert!(matches!(result, Err(DbError::UniqueConstraintViolated(_))));
}

#[test]
fn test_geo_combined_near_and_within() {
    let vocbase = vocbase("idx_geo1");
    vocbase
        .create_collection("places", CollectionType::Documents, None)
        .unwrap();
    let index = vocbase
        .create_index(
            "places",
            &json!({"type": "geo1", "fields": ["location"], "geoJson": false}),
        )
        .unwrap();

    insert_all(
        &vocbase,
        "places",
        &[
            json!({"_key": "cologne", "location": [50.9375, 6.9603]}),
            json!({"_key": "bonn", "location": [50.7374, 7.0982]}),
            json!({"_key": "paris", "location": [48.8566, 2.3522]}),
            json!({"_key": "nowhere"}),
        ],
    );

    let scope = read_scope(&vocbase, "places");
    let txn = scope.transaction().clone();
    let coll = txn.collection("places", AccessType::Read).unwrap();
    let Index::Geo(geo) = &*index else {
        panic!("expected a geo index");
    };

    // nearest to Cologne: itself, then Bonn, then Paris
    let near = geo.near(&coll, &txn, 50.9375, 6.9603, 2).unwrap();
    assert_eq!(near.len(), 2);
    assert_eq!(near[0].0.key().unwrap(), "cologne");
    assert_eq!(near[1].0.key().unwrap(), "bonn");
    assert!(near[0].1 < near[1].1);

    // 50 km around Cologne excludes Paris
    let within = geo.within(&coll, &txn, 50.9375, 6.9603, 50_000.0).unwrap();
    let keys: Vec<String> = within.iter().map(|(h, _)| h.key().unwrap()).collect();
    assert_eq!(keys, vec!["cologne", "bonn"]);
}

#[test]
fn test_geo_separate_fields_and_geojson_order() {
    let vocbase = vocbase("idx_geo2");
    vocbase
        .create_collection("places", CollectionType::Documents, None)
        .unwrap();
    let separate = vocbase
        .create_index(
            "places",
            &json!({"type": "geo2", "fields": ["lat", "lon"]}),
        )
        .unwrap();
    let geojson = vocbase
        .create_index(
            "places",
            &json!({"type": "geo1", "fields": ["point"], "geoJson": true}),
        )
        .unwrap();

    insert_all(
        &vocbase,
        "places",
        &[
            // the geoJson pair is [lon, lat]
            json!({"_key": "x", "lat": 50.0, "lon": 6.0, "point": [6.0, 50.0]}),
        ],
    );

    let scope = read_scope(&vocbase, "places");
    let txn = scope.transaction().clone();
    let coll = txn.collection("places", AccessType::Read).unwrap();

    let Index::Geo(separate) = &*separate else {
        panic!("expected a geo index");
    };
    let Index::Geo(geojson) = &*geojson else {
        panic!("expected a geo index");
    };

    let a = separate.near(&coll, &txn, 50.0, 6.0, 1).unwrap();
    let b = geojson.near(&coll, &txn, 50.0, 6.0, 1).unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    // both variants decode to the same coordinates
    assert!(a[0].1 < 1.0);
    assert!(b[0].1 < 1.0);
}

#[test]
fn test_fulltext_query_operations() {
    let vocbase = vocbase("idx_fulltext");
    vocbase
        .create_collection("notes", CollectionType::Documents, None)
        .unwrap();
    let index = vocbase
        .create_index(
            "notes",
            &json!({"type": "fulltext", "fields": ["text"], "minLength": 3}),
        )
        .unwrap();

    insert_all(
        &vocbase,
        "notes",
        &[
            json!({"_key": "n1", "text": "the quick brown fox"}),
            json!({"_key": "n2", "text": "the lazy brown dog"}),
            json!({"_key": "n3", "text": "a quick grey cat"}),
        ],
    );

    let scope = read_scope(&vocbase, "notes");
    let txn = scope.transaction().clone();
    let coll = txn.collection("notes", AccessType::Read).unwrap();
    let Index::Fulltext(fulltext) = &*index else {
        panic!("expected a fulltext index");
    };

    // conjunction
    let found = fulltext
        .query(
            &coll,
            &txn,
            &vec![
                FulltextTerm::new("quick", TermOperation::And),
                FulltextTerm::new("brown", TermOperation::And),
            ],
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key().unwrap(), "n1");

    // disjunction
    let found = fulltext
        .query(
            &coll,
            &txn,
            &vec![
                FulltextTerm::new("fox", TermOperation::Or),
                FulltextTerm::new("cat", TermOperation::Or),
            ],
        )
        .unwrap();
    assert_eq!(found.len(), 2);

    // exclusion
    let found = fulltext
        .query(
            &coll,
            &txn,
            &vec![
                FulltextTerm::new("brown", TermOperation::And),
                FulltextTerm::new("fox", TermOperation::Not),
            ],
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key().unwrap(), "n2");

    // words below the minimum length are not indexed
    let found = fulltext
        .query(&coll, &txn, &vec![FulltextTerm::new("a", TermOperation::And)])
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn test_cap_constraint_evicts_oldest() {
    let vocbase = vocbase("idx_cap");
    let collection = vocbase
        .create_collection("log", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_index("log", &json!({"type": "cap", "size": 3}))
        .unwrap();

    for i in 1..=4 {
        let mut scope = write_scope(&vocbase, "log");
        let txn = scope.transaction().clone();
        let coll = txn.collection("log", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": format!("k{}", i)}), false).unwrap();
        scope.commit().unwrap();
    }

    // publication list holds exactly the three newest documents
    assert_eq!(collection.masterpointer_manager().linked_totals().0, 3);

    let scope = read_scope(&vocbase, "log");
    let txn = scope.transaction().clone();
    let coll = txn.collection("log", AccessType::Read).unwrap();
    let documents = rustdocdb::collection::operations::all_documents(&txn, &coll, false).unwrap();
    let keys: Vec<&str> = documents.iter().map(|(d, _)| d.key.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k3", "k4"]);
}

#[test]
fn test_cap_constraint_rejects_oversized_document() {
    let vocbase = vocbase("idx_cap_size");
    let collection = vocbase
        .create_collection("log", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_index("log", &json!({"type": "cap", "size": 10, "byteSize": 64}))
        .unwrap();

    let scope = write_scope(&vocbase, "log");
    let txn = scope.transaction().clone();
    let coll = txn.collection("log", AccessType::Write).unwrap();

    let result = insert_document(
        &txn,
        &coll,
        json!({"_key": "big", "payload": "x".repeat(200)}),
        false,
    );
    assert!(matches!(result, Err(DbError::DocumentTooLarge(_))));
    // nothing was linked
    assert_eq!(collection.masterpointer_manager().linked_totals().0, 0);
}

#[test]
fn test_edge_index_directions() {
    let vocbase = vocbase("idx_edge");
    let people = vocbase
        .create_collection("people", CollectionType::Documents, None)
        .unwrap();
    vocbase
        .create_collection("likes", CollectionType::Edges, None)
        .unwrap();
    let people_cid = people.id();

    insert_all(
        &vocbase,
        "people",
        &[json!({"_key": "v1"}), json!({"_key": "v2"}), json!({"_key": "v3"})],
    );

    {
        let mut scope = write_scope(&vocbase, "likes");
        let txn = scope.transaction().clone();
        let coll = txn.collection("likes", AccessType::Write).unwrap();
        let vertex = |key: &str| EdgeRef {
            cid: people_cid,
            key: key.to_string(),
        };
        insert_edge(&txn, &coll, json!({"_key": "e1"}), vertex("v1"), vertex("v2"), false)
            .unwrap();
        insert_edge(&txn, &coll, json!({"_key": "e2"}), vertex("v2"), vertex("v3"), false)
            .unwrap();
        insert_edge(&txn, &coll, json!({"_key": "e3"}), vertex("v1"), vertex("v1"), false)
            .unwrap();
        scope.commit().unwrap();
    }

    let scope = read_scope(&vocbase, "likes");
    let txn = scope.transaction().clone();
    let coll = txn.collection("likes", AccessType::Read).unwrap();
    let indexes = coll.collection().indexes();
    let Index::Edge(edge) = &*indexes[1] else {
        panic!("expected the edge index at position 1");
    };

    let out = edge
        .lookup(&coll, &txn, EdgeDirection::Out, people_cid, "v1")
        .unwrap();
    assert_eq!(out.len(), 2); // e1 and the self-loop e3

    let incoming = edge
        .lookup(&coll, &txn, EdgeDirection::In, people_cid, "v2")
        .unwrap();
    assert_eq!(incoming.len(), 1);

    let any = edge
        .lookup(&coll, &txn, EdgeDirection::Any, people_cid, "v2")
        .unwrap();
    assert_eq!(any.len(), 2); // e1 in, e2 out

    // the self-loop is reported once
    let any = edge
        .lookup(&coll, &txn, EdgeDirection::Any, people_cid, "v1")
        .unwrap();
    assert_eq!(any.len(), 2);
}

#[test]
fn test_document_insert_into_edge_collection_fails() {
    let vocbase = vocbase("idx_edge_type");
    vocbase
        .create_collection("likes", CollectionType::Edges, None)
        .unwrap();

    let scope = write_scope(&vocbase, "likes");
    let txn = scope.transaction().clone();
    let coll = txn.collection("likes", AccessType::Write).unwrap();
    let result = insert_document(&txn, &coll, json!({"_key": "nope"}), false);
    assert!(matches!(result, Err(DbError::CollectionTypeInvalid(_))));
}

#[test]
fn test_rolled_back_insert_leaves_no_index_entries() {
    let vocbase = vocbase("idx_rollback");
    vocbase
        .create_collection("users", CollectionType::Documents, None)
        .unwrap();
    let index = vocbase
        .create_index(
            "users",
            &json!({"type": "hash", "fields": ["email"], "unique": true, "sparse": false}),
        )
        .unwrap();

    {
        let scope = write_scope(&vocbase, "users");
        let txn = scope.transaction().clone();
        let coll = txn.collection("users", AccessType::Write).unwrap();
        insert_document(&txn, &coll, json!({"_key": "1", "email": "gone@x"}), false).unwrap();
        // rolled back on drop
    }

    // the key is free again
    let mut scope = write_scope(&vocbase, "users");
    let txn = scope.transaction().clone();
    let coll = txn.collection("users", AccessType::Write).unwrap();
    insert_document(&txn, &coll, json!({"_key": "2", "email": "gone@x"}), false).unwrap();
    scope.commit().unwrap();

    let reader = read_scope(&vocbase, "users");
    let txn = reader.transaction().clone();
    let coll = txn.collection("users", AccessType::Read).unwrap();
    let Index::Hash(hash) = &*index else {
        panic!("expected a hash index");
    };
    let found = hash.lookup(&coll, &txn, &[json!("gone@x")]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key().unwrap(), "2");
}
