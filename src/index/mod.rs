// ============================================================================
// Index Layer
// ============================================================================
//
// All indexes of a collection share one contract: entries are published at
// insert time (so concurrent unique checks can see uncommitted writers),
// tombstoned entries are erased when the removing transaction commits, and
// rolled-back inserts are forgotten. The concrete variants are a tagged enum
// dispatched here; each owns its internal structure behind its own r/w lock.

pub mod cap;
pub mod edge;
pub mod fulltext;
pub mod geo;
pub mod hash;
pub mod primary;
pub mod skiplist;

pub use cap::CapConstraint;
pub use edge::{EdgeDirection, EdgeIndex};
pub use fulltext::{FulltextIndex, FulltextQuery, FulltextTerm, TermOperation};
pub use geo::{GeoIndex, GeoVariant};
pub use hash::HashIndex;
pub use primary::PrimaryIndex;
pub use skiplist::{SkiplistIndex, SkiplistIterator, SkiplistOperator};

use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::{DbError, IndexId, Result, Tick};
use crate::mptr::MptrHandle;
use crate::shape::{ShapedValue, Shaper};
use crate::txn::{Transaction, TransactionCollection, Visibility};

// ============================================================================
// Common header
// ============================================================================

/// The (id, paths, flags) header every index carries.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub id: IndexId,
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexMeta {
    pub fn new(id: IndexId, fields: Vec<String>, unique: bool, sparse: bool) -> Self {
        Self {
            id,
            fields,
            unique,
            sparse,
        }
    }
}

// ============================================================================
// Unique-insert conflict classification
// ============================================================================

/// Outcome of meeting one existing entry with the same key during a unique
/// insert:
///
/// | from       | to         | outcome                   |
/// |------------|------------|---------------------------|
/// | VISIBLE    | VISIBLE    | ignore (superseded)       |
/// | VISIBLE    | CONCURRENT | WriteConflict             |
/// | VISIBLE    | INVISIBLE  | UniqueConstraintViolated  |
/// | CONCURRENT | VISIBLE    | impossible                |
/// | CONCURRENT | other      | WriteConflict             |
/// | INVISIBLE  | INVISIBLE  | ignore                    |
pub(crate) fn check_unique_conflict(
    transaction: &Transaction,
    from: Tick,
    to: Tick,
    what: &str,
) -> Result<()> {
    let vis_from = transaction.visibility(from);
    let vis_to = transaction.visibility(to);

    match vis_from {
        Visibility::Visible => match vis_to {
            Visibility::Visible => Ok(()),
            Visibility::Concurrent => Err(DbError::WriteConflict(what.to_string())),
            Visibility::Invisible => Err(DbError::UniqueConstraintViolated(what.to_string())),
        },
        Visibility::Concurrent => {
            if vis_to == Visibility::Visible {
                // to cannot be visible unless from is
                Err(DbError::Internal(
                    "index entry with concurrent creator but visible remover".into(),
                ))
            } else {
                Err(DbError::WriteConflict(what.to_string()))
            }
        }
        Visibility::Invisible => Ok(()),
    }
}

// ============================================================================
// Field extraction
// ============================================================================

/// Extract the indexed attribute values of a document. The flag is false
/// when any path is missing or evaluates to null, which sparse indexes use
/// to exclude the record.
pub(crate) fn extract_fields(
    shaper: &Shaper,
    body: &Value,
    fields: &[String],
) -> Result<(Vec<ShapedValue>, bool)> {
    let mut values = Vec::with_capacity(fields.len());
    let mut all_set = true;
    for field in fields {
        match shaper.extract(body, field)? {
            Some(value) => {
                if value.is_null() {
                    all_set = false;
                }
                values.push(value);
            }
            None => {
                all_set = false;
                values.push(ShapedValue::null());
            }
        }
    }
    Ok((values, all_set))
}

// ============================================================================
// The index variants
// ============================================================================

pub enum Index {
    Primary(PrimaryIndex),
    Edge(EdgeIndex),
    Hash(HashIndex),
    Skiplist(SkiplistIndex),
    Geo(GeoIndex),
    Fulltext(FulltextIndex),
    Cap(CapConstraint),
}

impl Index {
    pub fn id(&self) -> IndexId {
        self.meta().id
    }

    pub fn meta(&self) -> &IndexMeta {
        match self {
            Index::Primary(index) => index.meta(),
            Index::Edge(index) => index.meta(),
            Index::Hash(index) => index.meta(),
            Index::Skiplist(index) => index.meta(),
            Index::Geo(index) => index.meta(),
            Index::Fulltext(index) => index.meta(),
            Index::Cap(index) => index.meta(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Index::Primary(_) => "primary",
            Index::Edge(_) => "edge",
            Index::Hash(_) => "hash",
            Index::Skiplist(_) => "skiplist",
            Index::Geo(index) => index.type_name(),
            Index::Fulltext(_) => "fulltext",
            Index::Cap(_) => "cap",
        }
    }

    /// Publish a master pointer into the index.
    pub fn insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        match self {
            Index::Primary(index) => index.insert(collection, transaction, mp),
            Index::Edge(index) => index.insert(collection, transaction, mp),
            Index::Hash(index) => index.insert(collection, transaction, mp),
            Index::Skiplist(index) => index.insert(collection, transaction, mp),
            Index::Geo(index) => index.insert(collection, transaction, mp),
            Index::Fulltext(index) => index.insert(collection, transaction, mp),
            Index::Cap(index) => index.insert(collection, transaction, mp),
        }
    }

    /// Tombstone-style removal, applied when the removing transaction
    /// commits. May be a no-op for indexes that derive membership from the
    /// master-pointer list.
    pub fn remove(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        key: &str,
        mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        match self {
            Index::Primary(index) => index.remove(collection, transaction, key, mp),
            Index::Edge(index) => index.remove(collection, transaction, key, mp),
            Index::Hash(index) => index.remove(collection, transaction, key, mp),
            Index::Skiplist(index) => index.remove(collection, transaction, key, mp),
            Index::Geo(index) => index.remove(collection, transaction, key, mp),
            Index::Fulltext(index) => index.remove(collection, transaction, key, mp),
            Index::Cap(index) => index.remove(collection, transaction, key, mp),
        }
    }

    /// Erase the entry of a rolled-back insert.
    pub fn forget(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        match self {
            Index::Primary(index) => index.forget(collection, transaction, mp),
            Index::Edge(index) => index.forget(collection, transaction, mp),
            Index::Hash(index) => index.forget(collection, transaction, mp),
            Index::Skiplist(index) => index.forget(collection, transaction, mp),
            Index::Geo(index) => index.forget(collection, transaction, mp),
            Index::Fulltext(index) => index.forget(collection, transaction, mp),
            Index::Cap(index) => index.forget(collection, transaction, mp),
        }
    }

    /// Called immediately before the commit marker is written.
    pub fn pre_commit(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
    ) -> Result<()> {
        match self {
            Index::Primary(index) => index.pre_commit(collection, transaction),
            Index::Edge(index) => index.pre_commit(collection, transaction),
            Index::Hash(index) => index.pre_commit(collection, transaction),
            Index::Skiplist(index) => index.pre_commit(collection, transaction),
            Index::Geo(index) => index.pre_commit(collection, transaction),
            Index::Fulltext(index) => index.pre_commit(collection, transaction),
            Index::Cap(index) => index.pre_commit(collection, transaction),
        }
    }

    /// Called after a successful insert; only the cap constraint acts here.
    pub fn post_insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Arc<Transaction>,
        mp: &MptrHandle,
    ) -> Result<()> {
        match self {
            Index::Cap(index) => index.post_insert(collection, transaction, mp),
            _ => Ok(()),
        }
    }

    /// Fill one committed record during index (re)construction, bypassing
    /// conflict checks.
    pub fn fill_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        match self {
            Index::Primary(index) => index.fill_slot(shaper, mp),
            Index::Edge(index) => index.fill_slot(shaper, mp),
            Index::Hash(index) => index.fill_slot(shaper, mp),
            Index::Skiplist(index) => index.fill_slot(shaper, mp),
            Index::Geo(index) => index.fill_slot(shaper, mp),
            Index::Fulltext(index) => index.fill_slot(shaper, mp),
            Index::Cap(_) => Ok(()),
        }
    }

    pub fn memory(&self) -> usize {
        match self {
            Index::Primary(index) => index.memory(),
            Index::Edge(index) => index.memory(),
            Index::Hash(index) => index.memory(),
            Index::Skiplist(index) => index.memory(),
            Index::Geo(index) => index.memory(),
            Index::Fulltext(index) => index.memory(),
            Index::Cap(index) => index.memory(),
        }
    }

    /// Acquire and release the index's write lock; lets a caller wait out
    /// all in-flight readers.
    pub fn click_lock(&self) {
        match self {
            Index::Primary(index) => index.click_lock(),
            Index::Edge(index) => index.click_lock(),
            Index::Hash(index) => index.click_lock(),
            Index::Skiplist(index) => index.click_lock(),
            Index::Geo(index) => index.click_lock(),
            Index::Fulltext(index) => index.click_lock(),
            Index::Cap(index) => index.click_lock(),
        }
    }

    /// The persisted JSON descriptor of the index.
    pub fn to_json(&self) -> Value {
        let meta = self.meta();
        let mut descriptor = json!({
            "id": meta.id.0.to_string(),
            "type": self.type_name(),
            "fields": meta.fields,
        });
        let object = descriptor.as_object_mut().expect("descriptor is an object");
        match self {
            Index::Hash(_) | Index::Skiplist(_) => {
                object.insert("unique".into(), json!(meta.unique));
                object.insert("sparse".into(), json!(meta.sparse));
            }
            Index::Geo(index) => {
                if index.variant().is_combined() {
                    object.insert("geoJson".into(), json!(index.geo_json()));
                }
            }
            Index::Fulltext(index) => {
                object.insert("minLength".into(), json!(index.min_length()));
            }
            Index::Cap(index) => {
                object.insert("size".into(), json!(index.max_count()));
                object.insert("byteSize".into(), json!(index.max_byte_size()));
            }
            _ => {}
        }
        descriptor
    }
}

// ============================================================================
// Descriptor parsing
// ============================================================================

/// Build an index from its persisted JSON descriptor. The descriptor is the
/// sole input to reconstruction at collection open.
pub fn index_from_json(descriptor: &Value) -> Result<Index> {
    let id = parse_id(descriptor)?;
    let type_name = descriptor
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::Internal("index descriptor has no type".into()))?;
    let fields: Vec<String> = descriptor
        .get("fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let unique = descriptor
        .get("unique")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // older descriptors of unique hash indexes have no sparse attribute;
    // they were implicitly sparse
    let sparse = match descriptor.get("sparse").and_then(Value::as_bool) {
        Some(sparse) => sparse,
        None => type_name == "hash" && unique,
    };

    match type_name {
        "primary" => Ok(Index::Primary(PrimaryIndex::new(id))),
        "edge" => Ok(Index::Edge(EdgeIndex::new(id))),
        "hash" => {
            require_fields(&fields, type_name)?;
            Ok(Index::Hash(HashIndex::new(id, fields, unique, sparse)))
        }
        "skiplist" => {
            require_fields(&fields, type_name)?;
            Ok(Index::Skiplist(SkiplistIndex::new(id, fields, unique, sparse)))
        }
        "geo1" => {
            require_fields(&fields, type_name)?;
            let geo_json = descriptor
                .get("geoJson")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(Index::Geo(GeoIndex::new_combined(
                id,
                fields[0].clone(),
                geo_json,
            )))
        }
        "geo2" => {
            if fields.len() != 2 {
                return Err(DbError::Internal(
                    "geo2 index needs exactly two fields".into(),
                ));
            }
            Ok(Index::Geo(GeoIndex::new_separate(
                id,
                fields[0].clone(),
                fields[1].clone(),
            )))
        }
        "fulltext" => {
            require_fields(&fields, type_name)?;
            let min_length = descriptor
                .get("minLength")
                .and_then(Value::as_u64)
                .unwrap_or(2) as usize;
            Ok(Index::Fulltext(FulltextIndex::new(
                id,
                fields[0].clone(),
                min_length,
            )))
        }
        "cap" => {
            let max_count = descriptor.get("size").and_then(Value::as_u64).unwrap_or(0) as usize;
            let max_byte_size = descriptor
                .get("byteSize")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(Index::Cap(CapConstraint::new(id, max_count, max_byte_size)))
        }
        other => Err(DbError::Internal(format!("unknown index type '{}'", other))),
    }
}

fn parse_id(descriptor: &Value) -> Result<IndexId> {
    match descriptor.get("id") {
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map(IndexId)
            .map_err(|_| DbError::Internal(format!("invalid index id '{}'", s))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(IndexId)
            .ok_or_else(|| DbError::Internal("invalid index id".into())),
        _ => Err(DbError::Internal("index descriptor has no id".into())),
    }
}

fn require_fields(fields: &[String], type_name: &str) -> Result<()> {
    if fields.is_empty() {
        return Err(DbError::Internal(format!(
            "{} index needs at least one field",
            type_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip() {
        let descriptor = json!({
            "id": "42",
            "type": "hash",
            "fields": ["a", "b"],
            "unique": true,
            "sparse": false,
        });
        let index = index_from_json(&descriptor).unwrap();
        assert_eq!(index.id(), IndexId(42));
        assert_eq!(index.type_name(), "hash");
        assert_eq!(index.to_json(), descriptor);
    }

    #[test]
    fn test_missing_sparse_defaults() {
        // pre-existing unique hash indexes are implicitly sparse
        let unique_hash = json!({"id": 1, "type": "hash", "fields": ["a"], "unique": true});
        assert!(index_from_json(&unique_hash).unwrap().meta().sparse);

        let plain_hash = json!({"id": 2, "type": "hash", "fields": ["a"]});
        assert!(!index_from_json(&plain_hash).unwrap().meta().sparse);

        let skiplist = json!({"id": 3, "type": "skiplist", "fields": ["a"], "unique": true});
        assert!(!index_from_json(&skiplist).unwrap().meta().sparse);
    }

    #[test]
    fn test_unknown_type_fails() {
        let descriptor = json!({"id": 1, "type": "btree", "fields": ["a"]});
        assert!(index_from_json(&descriptor).is_err());
    }
}
