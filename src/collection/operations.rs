// ============================================================================
// Document operations
// ============================================================================
//
// The MVCC read/write paths. An insert allocates a master pointer, writes
// the document marker through the WAL, installs the pointer into the primary
// index under the collection's index read lock, links it into the
// publication list and then updates the secondary indexes. Failures undo the
// partial work; everything that succeeded is recorded on the transaction's
// operation log for rollback.

use log::trace;
use serde_json::Value;
use std::sync::Arc;

use crate::core::{DbError, Result, RevisionId};
use crate::index::Index;
use crate::mptr::MptrHandle;
use crate::shape::signature_of;
use crate::txn::{
    AccessType, Hint, Operation, Transaction, TransactionCollection, TransactionId, Visibility,
};
use crate::wal::{EdgeRef, Marker};

use super::document::DocumentBody;

/// Key and revision of a written or read document version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub key: String,
    pub revision: RevisionId,
}

// ============================================================================
// insert
// ============================================================================

/// Insert a document given as JSON. The `_key` attribute is validated or
/// generated; `wait_for_sync` forces the commit marker to be synced.
pub fn insert_document(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    value: Value,
    wait_for_sync: bool,
) -> Result<DocumentDescriptor> {
    if collection.collection().is_edge_collection() {
        return Err(DbError::CollectionTypeInvalid(format!(
            "collection '{}' stores edges; use insert_edge",
            collection.name()
        )));
    }
    insert_internal(transaction, collection, value, None, wait_for_sync)
}

/// Insert an edge connecting `from` and `to`. Only valid on edge
/// collections.
pub fn insert_edge(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    value: Value,
    from: EdgeRef,
    to: EdgeRef,
    wait_for_sync: bool,
) -> Result<DocumentDescriptor> {
    if !collection.collection().is_edge_collection() {
        return Err(DbError::CollectionTypeInvalid(format!(
            "collection '{}' does not store edges",
            collection.name()
        )));
    }
    super::document::validate_key(&from.key)?;
    super::document::validate_key(&to.key)?;
    insert_internal(transaction, collection, value, Some((from, to)), wait_for_sync)
}

fn insert_internal(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    mut value: Value,
    edge: Option<(EdgeRef, EdgeRef)>,
    wait_for_sync: bool,
) -> Result<DocumentDescriptor> {
    check_write_access(collection)?;

    if !value.is_object() {
        return Err(DbError::IllegalName("document body must be an object".into()));
    }

    let key = prepare_key(transaction, collection, &mut value)?;
    let revision = transaction.manager().ticks().next();

    register_shapes(collection, &value)?;

    let shaper = collection.shaper();
    let (sid, _) = shaper.shape_of(&value)?;
    let body = match &edge {
        Some((from, to)) => DocumentBody::new_edge(
            key.clone(),
            revision,
            sid,
            &value,
            from.clone(),
            to.clone(),
        )?,
        None => DocumentBody::new(key.clone(), revision, sid, &value)?,
    };

    // an oversized document is rejected before any storage mutation
    if let Some(cap) = collection.collection().cap_constraint() {
        if let Index::Cap(cap) = &*cap {
            cap.check_document_size(body.byte_size())?;
        }
    }

    transaction.note_data_marker()?;

    let vocbase = collection.vocbase();
    let tid = marker_tid(transaction);
    let marker = match &edge {
        Some((from, to)) => Marker::MvccEdgeInsert {
            vocbase_id: vocbase.id(),
            cid: collection.id(),
            tid,
            from: transaction.id(),
            to: TransactionId::NONE,
            key: key.clone(),
            revision,
            shape: sid,
            edge_from: from.clone(),
            edge_to: to.clone(),
            body: body.data.clone(),
        },
        None => Marker::MvccDocumentInsert {
            vocbase_id: vocbase.id(),
            cid: collection.id(),
            tid,
            from: transaction.id(),
            to: TransactionId::NONE,
            key: key.clone(),
            revision,
            shape: sid,
            body: body.data.clone(),
        },
    };
    vocbase
        .wal()
        .append(marker, wait_for_sync || collection.wait_for_sync())?;

    let handle = install_master_pointer(transaction, collection, Arc::new(body))?;

    transaction.record_operation(Operation::InsertDocument {
        cid: collection.id(),
        slot: handle.index(),
    });
    transaction.inc_num_inserted(collection.id(), revision, wait_for_sync);

    if let Some(cap) = collection.collection().cap_constraint() {
        cap.post_insert(collection, transaction, &handle)?;
    }

    trace!(
        "inserted document '{}' (rev {}) into '{}'",
        key,
        revision,
        collection.name()
    );
    Ok(DocumentDescriptor { key, revision })
}

/// Allocate the master pointer, install it in the primary index under the
/// index read lock, link it, then update the secondary indexes. Undoes the
/// partial work on failure.
fn install_master_pointer(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    body: Arc<DocumentBody>,
) -> Result<MptrHandle> {
    let document_collection = collection.collection();
    let manager = document_collection.masterpointer_manager();
    let mut container = manager.create(body, transaction.id().own())?;
    let handle = container.handle();

    document_collection.with_indexes(|indexes| {
        collection.lock_compaction(collection.vocbase().config().lock_timeout)?;

        indexes[0].insert(collection, transaction, &handle)?;
        container.link()?;

        for (position, index) in indexes.iter().enumerate().skip(1) {
            if let Err(e) = index.insert(collection, transaction, &handle) {
                for done in &indexes[1..position] {
                    let _ = done.forget(collection, transaction, &handle);
                }
                let _ = indexes[0].forget(collection, transaction, &handle);
                manager.unlink(handle.index());
                return Err(e);
            }
        }
        Ok(())
    })?;

    Ok(handle)
}

// ============================================================================
// read
// ============================================================================

/// Read the version of `key` visible to the transaction.
pub fn read_document(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    key: &str,
) -> Result<(DocumentDescriptor, Value)> {
    let primary = collection.collection().primary_index();
    let Index::Primary(primary) = &*primary else {
        return Err(DbError::Internal("no primary index found".into()));
    };

    let handle = primary
        .lookup(collection, transaction, key)?
        .ok_or(DbError::DocumentNotFound)?;
    let body = handle.body().ok_or(DbError::DocumentNotFound)?;
    let value = body.decode()?;
    Ok((
        DocumentDescriptor {
            key: body.key.clone(),
            revision: body.revision,
        },
        value,
    ))
}

/// Full collection scan in publication order, filtered by the transaction's
/// read visibility.
pub fn all_documents(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    reverse: bool,
) -> Result<Vec<(DocumentDescriptor, Value)>> {
    let manager = collection.collection().masterpointer_manager();
    let predicate_transaction = Arc::clone(transaction);
    let mut iter = manager.iterate(
        move |from, to| predicate_transaction.is_visible_for_read(from, to),
        reverse,
    );

    let mut result = Vec::new();
    while let Some(handle) = iter.next() {
        if let Some(body) = handle.body() {
            result.push((
                DocumentDescriptor {
                    key: body.key.clone(),
                    revision: body.revision,
                },
                body.decode()?,
            ));
        }
    }
    Ok(result)
}

// ============================================================================
// update
// ============================================================================

/// Replace the visible version of `key` with `value`. The old version's
/// `to` is set to this transaction; readers with older snapshots keep
/// seeing it.
pub fn update_document(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    key: &str,
    mut value: Value,
    wait_for_sync: bool,
) -> Result<DocumentDescriptor> {
    check_write_access(collection)?;
    if !value.is_object() {
        return Err(DbError::IllegalName("document body must be an object".into()));
    }

    let old = lookup_for_write(transaction, collection, key)?;

    value["_key"] = Value::String(key.to_string());
    let revision = transaction.manager().ticks().next();
    register_shapes(collection, &value)?;
    let shaper = collection.shaper();
    let (sid, _) = shaper.shape_of(&value)?;
    let old_body = old.body().ok_or(DbError::DocumentNotFound)?;
    let body = match &old_body.edge {
        Some((from, to)) => DocumentBody::new_edge(
            key.to_string(),
            revision,
            sid,
            &value,
            from.clone(),
            to.clone(),
        )?,
        None => DocumentBody::new(key.to_string(), revision, sid, &value)?,
    };

    if let Some(cap) = collection.collection().cap_constraint() {
        if let Index::Cap(cap) = &*cap {
            cap.check_document_size(body.byte_size())?;
        }
    }

    transaction.note_data_marker()?;
    let vocbase = collection.vocbase();
    let marker = Marker::MvccDocumentInsert {
        vocbase_id: vocbase.id(),
        cid: collection.id(),
        tid: marker_tid(transaction),
        from: transaction.id(),
        to: TransactionId::NONE,
        key: key.to_string(),
        revision,
        shape: sid,
        body: body.data.clone(),
    };
    vocbase
        .wal()
        .append(marker, wait_for_sync || collection.wait_for_sync())?;

    // supersede the old version first so the primary index classifies it as
    // (VISIBLE, VISIBLE) for us and ignores it
    old.set_to(transaction.id().own());

    let handle = match install_master_pointer(transaction, collection, Arc::new(body)) {
        Ok(handle) => handle,
        Err(e) => {
            old.clear_to();
            return Err(e);
        }
    };

    transaction.record_operation(Operation::UpdateDocument {
        cid: collection.id(),
        old_slot: old.index(),
        new_slot: handle.index(),
    });
    transaction.inc_num_inserted(collection.id(), revision, wait_for_sync);
    transaction.inc_num_removed(collection.id(), revision, wait_for_sync);

    if let Some(cap) = collection.collection().cap_constraint() {
        cap.post_insert(collection, transaction, &handle)?;
    }

    Ok(DocumentDescriptor {
        key: key.to_string(),
        revision,
    })
}

// ============================================================================
// remove
// ============================================================================

/// Tombstone the visible version of `key`. The master pointer leaves the
/// publication list when this transaction commits.
pub fn remove_document(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    key: &str,
    wait_for_sync: bool,
) -> Result<RevisionId> {
    check_write_access(collection)?;

    let old = lookup_for_write(transaction, collection, key)?;

    transaction.note_data_marker()?;
    let revision = transaction.manager().ticks().next();
    let vocbase = collection.vocbase();
    let marker = Marker::MvccDocumentRemove {
        vocbase_id: vocbase.id(),
        cid: collection.id(),
        tid: marker_tid(transaction),
        from: TransactionId::top_level(old.from()),
        to: transaction.id(),
        key: key.to_string(),
        revision,
    };
    vocbase
        .wal()
        .append(marker, wait_for_sync || collection.wait_for_sync())?;

    old.set_to(transaction.id().own());

    transaction.record_operation(Operation::RemoveDocument {
        cid: collection.id(),
        slot: old.index(),
    });
    transaction.inc_num_removed(collection.id(), revision, wait_for_sync);

    trace!("removed document '{}' from '{}'", key, collection.name());
    Ok(revision)
}

// ============================================================================
// rollback / commit plumbing, called by the transaction
// ============================================================================

/// Undo one recorded operation (reverse order is the caller's business).
pub fn undo_operation(transaction: &Arc<Transaction>, operation: &Operation) -> Result<()> {
    match operation {
        Operation::InsertDocument { cid, slot } => {
            let collection = transaction.registered_collection(*cid)?;
            forget_slot(transaction, &collection, *slot)
        }
        Operation::UpdateDocument {
            cid,
            old_slot,
            new_slot,
        } => {
            let collection = transaction.registered_collection(*cid)?;
            forget_slot(transaction, &collection, *new_slot)?;
            let manager = collection.collection().masterpointer_manager();
            manager.handle(*old_slot).clear_to();
            Ok(())
        }
        Operation::RemoveDocument { cid, slot } => {
            let collection = transaction.registered_collection(*cid)?;
            let manager = collection.collection().masterpointer_manager();
            manager.handle(*slot).clear_to();
            Ok(())
        }
    }
}

fn forget_slot(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    slot: usize,
) -> Result<()> {
    let document_collection = collection.collection();
    let manager = document_collection.masterpointer_manager();
    let handle = manager.handle(slot);

    document_collection.with_indexes(|indexes| {
        for index in indexes {
            index.forget(collection, transaction, &handle)?;
        }
        Ok(())
    })?;
    manager.unlink(slot);
    Ok(())
}

/// Apply the deferred effects of a committing top-level transaction:
/// removed versions leave the indexes and the publication list, and the
/// collection counters absorb the net change.
pub fn apply_commit_effects(transaction: &Arc<Transaction>) -> Result<()> {
    let operations = transaction.operations_snapshot();
    for operation in &operations {
        match operation {
            Operation::InsertDocument { cid, slot } => {
                let collection = transaction.registered_collection(*cid)?;
                let manager = collection.collection().masterpointer_manager();
                let handle = manager.handle(*slot);
                let size = handle.byte_size() as i64;
                collection.collection().update_document_stats(1, size);
                collection.collection().update_revision_id(handle.revision());
            }
            Operation::UpdateDocument {
                cid,
                old_slot,
                new_slot,
            } => {
                let collection = transaction.registered_collection(*cid)?;
                let manager = collection.collection().masterpointer_manager();
                let old_size = manager.handle(*old_slot).byte_size() as i64;
                let new = manager.handle(*new_slot);
                collection
                    .collection()
                    .update_document_stats(0, new.byte_size() as i64 - old_size);
                collection.collection().update_revision_id(new.revision());
            }
            Operation::RemoveDocument { cid, slot } => {
                let collection = transaction.registered_collection(*cid)?;
                let document_collection = collection.collection();
                let manager = document_collection.masterpointer_manager();
                let handle = manager.handle(*slot);
                let key = handle.key().unwrap_or_default();
                let size = handle.byte_size() as i64;

                document_collection.with_indexes(|indexes| {
                    for index in indexes {
                        index.remove(&collection, transaction, &key, &handle)?;
                    }
                    Ok(())
                })?;
                manager.unlink(*slot);
                document_collection.update_document_stats(-1, -size);
            }
        }
    }
    Ok(())
}

// ============================================================================
// helpers
// ============================================================================

fn check_write_access(collection: &TransactionCollection) -> Result<()> {
    if collection.access() != AccessType::Write {
        return Err(DbError::TransactionUnregisteredCollection(collection.name()));
    }
    Ok(())
}

fn marker_tid(transaction: &Transaction) -> TransactionId {
    if transaction.hints().has(Hint::SingleOperation) {
        TransactionId::NONE
    } else {
        transaction.id()
    }
}

fn prepare_key(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    value: &mut Value,
) -> Result<String> {
    let generator = collection.collection().key_generator();
    match value.get("_key") {
        Some(Value::String(key)) => {
            let key = key.clone();
            generator.validate(&key)?;
            Ok(key)
        }
        Some(_) => Err(DbError::IllegalName("_key must be a string".into())),
        None => {
            let key = generator.generate(transaction.manager().ticks().next());
            value["_key"] = Value::String(key.clone());
            Ok(key)
        }
    }
}

/// Register shapes and top-level attributes, emitting markers for new ones.
fn register_shapes(collection: &TransactionCollection, value: &Value) -> Result<()> {
    let shaper = collection.shaper();
    let vocbase = collection.vocbase();

    if let Some(object) = value.as_object() {
        for attribute in object.keys() {
            let (_, is_new) = shaper.attribute_path(attribute)?;
            if is_new {
                vocbase.wal().append(
                    Marker::AttributeRegister {
                        vocbase_id: vocbase.id(),
                        cid: collection.id(),
                        path: attribute.clone(),
                    },
                    false,
                )?;
            }
        }
    }

    let (sid, is_new) = shaper.shape_of(value)?;
    if is_new {
        vocbase.wal().append(
            Marker::ShapeRegister {
                vocbase_id: vocbase.id(),
                cid: collection.id(),
                sid,
                signature: signature_of(value),
            },
            false,
        )?;
    }
    Ok(())
}

/// Locate the visible version of `key` and ensure no concurrent writer
/// already superseded it.
fn lookup_for_write(
    transaction: &Arc<Transaction>,
    collection: &TransactionCollection,
    key: &str,
) -> Result<MptrHandle> {
    let primary = collection.collection().primary_index();
    let Index::Primary(primary) = &*primary else {
        return Err(DbError::Internal("no primary index found".into()));
    };

    let handle = primary
        .lookup(collection, transaction, key)?
        .ok_or(DbError::DocumentNotFound)?;

    let to = handle.to();
    if to != 0 && transaction.visibility(to) == Visibility::Concurrent {
        return Err(DbError::WriteConflict(format!(
            "document '{}' is being modified by a concurrent transaction",
            key
        )));
    }
    Ok(handle)
}
