// ============================================================================
// Primary Index
// ============================================================================

use im::HashMap as ImHashMap;
use std::sync::RwLock;

use crate::core::{IndexId, Result};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::Shaper;
use crate::txn::{Transaction, TransactionCollection};

use super::{IndexMeta, check_unique_conflict};

/// Document key → master pointers, the source of truth for a collection.
/// A key owns one slot per live version; reads pick the version visible to
/// the transaction.
pub struct PrimaryIndex {
    meta: IndexMeta,
    buckets: RwLock<ImHashMap<String, Vec<SlotIndex>>>,
}

impl PrimaryIndex {
    pub fn new(id: IndexId) -> Self {
        Self {
            meta: IndexMeta::new(id, vec!["_key".to_string()], true, false),
            buckets: RwLock::new(ImHashMap::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        let key = mp.key().unwrap_or_default();
        let manager = collection.collection().masterpointer_manager();

        let mut buckets = self.buckets.write()?;
        if let Some(slots) = buckets.get(&key) {
            for slot in slots {
                let existing = manager.handle(*slot);
                check_unique_conflict(
                    transaction,
                    existing.from(),
                    existing.to(),
                    &format!("document key '{}'", key),
                )?;
            }
        }

        let mut slots = buckets.get(&key).cloned().unwrap_or_default();
        slots.push(mp.index());
        buckets.insert(key, slots);
        Ok(())
    }

    /// The version of `key` visible to `transaction`, newest first.
    pub fn lookup(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        key: &str,
    ) -> Result<Option<MptrHandle>> {
        let slots = {
            let buckets = self.buckets.read()?;
            buckets.get(key).cloned()
        };
        let Some(slots) = slots else {
            return Ok(None);
        };

        let manager = collection.collection().masterpointer_manager();
        for slot in slots.iter().rev() {
            let handle = manager.handle(*slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    pub fn remove(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        key: &str,
        mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        if self.erase(key, mp.index())? {
            Ok(Some(mp.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn forget(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        let key = mp.key().unwrap_or_default();
        self.erase(&key, mp.index())?;
        Ok(())
    }

    pub fn pre_commit(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
    ) -> Result<()> {
        Ok(())
    }

    fn erase(&self, key: &str, slot: SlotIndex) -> Result<bool> {
        let mut buckets = self.buckets.write()?;
        let Some(slots) = buckets.get(key) else {
            return Ok(false);
        };
        let mut slots = slots.clone();
        let before = slots.len();
        slots.retain(|s| *s != slot);
        let found = slots.len() != before;
        if slots.is_empty() {
            buckets.remove(key);
        } else {
            buckets.insert(key.to_string(), slots);
        }
        Ok(found)
    }

    // ------------------------------------------------------------------------
    // replay-time access (single-threaded, no visibility involved)
    // ------------------------------------------------------------------------

    pub fn fill_slot(&self, _shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        let key = mp.key().unwrap_or_default();
        self.insert_replay(&key, mp.index())
    }

    pub fn insert_replay(&self, key: &str, slot: SlotIndex) -> Result<()> {
        let mut buckets = self.buckets.write()?;
        let mut slots = buckets.get(key).cloned().unwrap_or_default();
        slots.push(slot);
        buckets.insert(key.to_string(), slots);
        Ok(())
    }

    pub fn lookup_replay(&self, key: &str) -> Result<Option<SlotIndex>> {
        let buckets = self.buckets.read()?;
        Ok(buckets.get(key).and_then(|slots| slots.last().copied()))
    }

    pub fn remove_replay(&self, key: &str) -> Result<Option<SlotIndex>> {
        let mut buckets = self.buckets.write()?;
        let Some(slots) = buckets.get(key) else {
            return Ok(None);
        };
        let mut slots = slots.clone();
        let removed = slots.pop();
        if slots.is_empty() {
            buckets.remove(key);
        } else {
            buckets.insert(key.to_string(), slots);
        }
        Ok(removed)
    }

    /// Every key currently present (for index refills).
    pub fn all_slots(&self) -> Vec<SlotIndex> {
        let buckets = self.buckets.read().expect("primary index poisoned");
        buckets.values().flatten().copied().collect()
    }

    pub fn key_count(&self) -> usize {
        let buckets = self.buckets.read().expect("primary index poisoned");
        buckets.len()
    }

    pub fn memory(&self) -> usize {
        let buckets = self.buckets.read().expect("primary index poisoned");
        buckets
            .iter()
            .map(|(key, slots)| key.len() + slots.len() * std::mem::size_of::<SlotIndex>())
            .sum()
    }

    pub fn click_lock(&self) {
        let _guard = self.buckets.write().expect("primary index poisoned");
    }
}
