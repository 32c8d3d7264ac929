// ============================================================================
// Cap Constraint
// ============================================================================

use log::debug;
use std::sync::Arc;

use crate::collection::operations;
use crate::core::{DbError, IndexId, Result};
use crate::mptr::MptrHandle;
use crate::txn::{Transaction, TransactionCollection};

use super::IndexMeta;

/// Pseudo-index enforcing upper bounds on a collection: at most `max_count`
/// documents and `max_byte_size` aggregate bytes. Always the last entry of
/// the index list. When a bound is exceeded after an insert, the oldest
/// documents are removed through the standard remove path of the same
/// transaction.
pub struct CapConstraint {
    meta: IndexMeta,
    max_count: usize,
    max_byte_size: u64,
}

impl CapConstraint {
    pub fn new(id: IndexId, max_count: usize, max_byte_size: u64) -> Self {
        Self {
            meta: IndexMeta::new(id, Vec::new(), false, false),
            max_count,
            max_byte_size,
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_byte_size(&self) -> u64 {
        self.max_byte_size
    }

    /// Reject a single document that can never fit.
    pub fn check_document_size(&self, byte_size: usize) -> Result<()> {
        if self.max_byte_size > 0 && byte_size as u64 > self.max_byte_size {
            return Err(DbError::DocumentTooLarge(format!(
                "document of {} bytes exceeds cap of {} bytes",
                byte_size, self.max_byte_size
            )));
        }
        Ok(())
    }

    pub fn insert(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.check_document_size(mp.byte_size())
    }

    /// Evict the oldest documents until both bounds hold again.
    pub fn post_insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Arc<Transaction>,
        _mp: &MptrHandle,
    ) -> Result<()> {
        debug_assert!(self.max_count > 0 || self.max_byte_size > 0);
        self.apply(collection, transaction)
    }

    fn apply(&self, collection: &TransactionCollection, transaction: &Arc<Transaction>) -> Result<()> {
        loop {
            let (count, bytes) = self.current_totals(collection, transaction);
            let count_exceeded = self.max_count > 0 && count > self.max_count;
            let size_exceeded = self.max_byte_size > 0 && bytes > self.max_byte_size;
            if !count_exceeded && !size_exceeded {
                return Ok(());
            }

            let Some(oldest_key) = self.oldest_visible_key(collection, transaction) else {
                // we should not get here
                return Ok(());
            };

            debug!(
                "cap constraint evicting '{}' from collection '{}'",
                oldest_key,
                collection.name()
            );
            operations::remove_document(transaction, collection, &oldest_key, false)?;
        }
    }

    /// Count and byte size of the documents this transaction can read.
    fn current_totals(
        &self,
        collection: &TransactionCollection,
        transaction: &Arc<Transaction>,
    ) -> (usize, u64) {
        let manager = collection.collection().masterpointer_manager();
        let mut count = 0usize;
        let mut bytes = 0u64;
        let mut iter = {
            let transaction = Arc::clone(transaction);
            manager.iterate(move |from, to| transaction.is_visible_for_read(from, to), false)
        };
        while let Some(handle) = iter.next() {
            count += 1;
            bytes += handle.byte_size() as u64;
        }
        (count, bytes)
    }

    fn oldest_visible_key(
        &self,
        collection: &TransactionCollection,
        transaction: &Arc<Transaction>,
    ) -> Option<String> {
        let manager = collection.collection().masterpointer_manager();
        let mut iter = {
            let transaction = Arc::clone(transaction);
            manager.iterate(move |from, to| transaction.is_visible_for_read(from, to), false)
        };
        iter.next().and_then(|handle| handle.key())
    }

    pub fn remove(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        _key: &str,
        _mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        Ok(None)
    }

    pub fn forget(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        _mp: &MptrHandle,
    ) -> Result<()> {
        Ok(())
    }

    pub fn pre_commit(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
    ) -> Result<()> {
        Ok(())
    }

    pub fn memory(&self) -> usize {
        0
    }

    pub fn click_lock(&self) {}
}
