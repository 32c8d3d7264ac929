// ============================================================================
// Hash Index
// ============================================================================

use im::HashMap as ImHashMap;
use serde_json::Value;
use std::hash::Hasher;
use std::sync::RwLock;

use crate::core::{IndexId, Result};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::{ShapedValue, Shaper};
use crate::txn::{Transaction, TransactionCollection};

use super::{IndexMeta, check_unique_conflict, extract_fields};

#[derive(Clone)]
struct HashEntry {
    slot: SlotIndex,
    values: Vec<ShapedValue>,
}

/// Hash index over one or more attribute paths.
///
/// Hashing uses only the canonical payload bytes of each path, never the
/// shape id, so equal value bytes collide across shapes; equality then
/// compares each path by (shape id, byte length, bytes). Sparse indexes
/// exclude records missing any path or carrying the null shape in one.
pub struct HashIndex {
    meta: IndexMeta,
    buckets: RwLock<ImHashMap<u64, Vec<HashEntry>>>,
}

const HASH_SEED: u64 = 0x0123456789abcdef;

fn hash_values(values: &[ShapedValue]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write_u64(HASH_SEED);
    for value in values {
        // only the payload bytes, not the shape id
        hasher.write(value.payload_bytes());
    }
    hasher.finish()
}

fn values_equal(left: &[ShapedValue], right: &[ShapedValue]) -> bool {
    left.len() == right.len() && left.iter().zip(right.iter()).all(|(l, r)| l == r)
}

impl HashIndex {
    pub fn new(id: IndexId, fields: Vec<String>, unique: bool, sparse: bool) -> Self {
        Self {
            meta: IndexMeta::new(id, fields, unique, sparse),
            buckets: RwLock::new(ImHashMap::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    fn entry_for(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<Option<HashEntry>> {
        let Some(body) = mp.body() else {
            return Ok(None);
        };
        let decoded = body.decode()?;
        let (values, all_set) = extract_fields(shaper, &decoded, &self.meta.fields)?;
        if self.meta.sparse && !all_set {
            return Ok(None);
        }
        Ok(Some(HashEntry {
            slot: mp.index(),
            values,
        }))
    }

    pub fn insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        let Some(entry) = self.entry_for(collection.shaper(), mp)? else {
            return Ok(());
        };
        let hash = hash_values(&entry.values);
        let manager = collection.collection().masterpointer_manager();

        let mut buckets = self.buckets.write()?;

        if self.meta.unique {
            // any same-key revision we are not allowed to supersede aborts
            // the insert
            if let Some(entries) = buckets.get(&hash) {
                for existing in entries {
                    if existing.slot == entry.slot
                        || !values_equal(&existing.values, &entry.values)
                    {
                        continue;
                    }
                    let handle = manager.handle(existing.slot);
                    check_unique_conflict(
                        transaction,
                        handle.from(),
                        handle.to(),
                        &format!("unique hash index on [{}]", self.meta.fields.join(", ")),
                    )?;
                }
            }
        }

        let mut entries = buckets.get(&hash).cloned().unwrap_or_default();
        entries.push(entry);
        buckets.insert(hash, entries);
        Ok(())
    }

    /// All visible documents whose indexed paths equal `search`.
    pub fn lookup(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        search: &[Value],
    ) -> Result<Vec<MptrHandle>> {
        if search.len() != self.meta.fields.len() {
            return Ok(Vec::new());
        }
        let shaper = collection.shaper();
        let mut values = Vec::with_capacity(search.len());
        for value in search {
            let (sid, _) = shaper.shape_of(value)?;
            values.push(ShapedValue::new(sid, value.clone()));
        }
        let hash = hash_values(&values);

        let entries = {
            let buckets = self.buckets.read()?;
            buckets.get(&hash).cloned().unwrap_or_default()
        };

        let manager = collection.collection().masterpointer_manager();
        let mut result = Vec::new();
        for entry in entries {
            if !values_equal(&entry.values, &values) {
                continue;
            }
            let handle = manager.handle(entry.slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                result.push(handle);
            }
        }
        Ok(result)
    }

    pub fn remove(
        &self,
        collection: &TransactionCollection,
        _transaction: &Transaction,
        _key: &str,
        mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        if self.erase(collection.shaper(), mp)? {
            Ok(Some(mp.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn forget(
        &self,
        collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.erase(collection.shaper(), mp)?;
        Ok(())
    }

    pub fn pre_commit(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
    ) -> Result<()> {
        Ok(())
    }

    fn erase(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<bool> {
        let Some(entry) = self.entry_for(shaper, mp)? else {
            return Ok(false);
        };
        let hash = hash_values(&entry.values);

        let mut buckets = self.buckets.write()?;
        let Some(entries) = buckets.get(&hash) else {
            return Ok(false);
        };
        let mut entries = entries.clone();
        let before = entries.len();
        entries.retain(|e| e.slot != mp.index());
        let found = entries.len() != before;
        if entries.is_empty() {
            buckets.remove(&hash);
        } else {
            buckets.insert(hash, entries);
        }
        Ok(found)
    }

    pub fn fill_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        let Some(entry) = self.entry_for(shaper, mp)? else {
            return Ok(());
        };
        let hash = hash_values(&entry.values);
        let mut buckets = self.buckets.write()?;
        let mut entries = buckets.get(&hash).cloned().unwrap_or_default();
        entries.push(entry);
        buckets.insert(hash, entries);
        Ok(())
    }

    pub fn memory(&self) -> usize {
        let buckets = self.buckets.read().expect("hash index poisoned");
        buckets
            .values()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| {
                        std::mem::size_of::<SlotIndex>()
                            + e.values.iter().map(|v| v.payload_bytes().len()).sum::<usize>()
                    })
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn click_lock(&self) {
        let _guard = self.buckets.write().expect("hash index poisoned");
    }
}
