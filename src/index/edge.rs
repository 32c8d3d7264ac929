// ============================================================================
// Edge Index
// ============================================================================

use im::HashMap as ImHashMap;
use std::sync::RwLock;

use crate::core::{CollectionId, IndexId, Result};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::Shaper;
use crate::txn::{Transaction, TransactionCollection};

use super::IndexMeta;

/// Lookup direction for edges of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Out,
    In,
    Any,
}

type VertexKey = (CollectionId, String);

/// Connects vertices: one hash structure for OUT edges (keyed by `_from`),
/// one for IN edges (keyed by `_to`). Exists at position 1 of every edge
/// collection.
pub struct EdgeIndex {
    meta: IndexMeta,
    out_edges: RwLock<ImHashMap<VertexKey, Vec<SlotIndex>>>,
    in_edges: RwLock<ImHashMap<VertexKey, Vec<SlotIndex>>>,
}

impl EdgeIndex {
    pub fn new(id: IndexId) -> Self {
        Self {
            meta: IndexMeta::new(
                id,
                vec!["_from".to_string(), "_to".to_string()],
                false,
                false,
            ),
            out_edges: RwLock::new(ImHashMap::new()),
            in_edges: RwLock::new(ImHashMap::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn insert(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.insert_slot(mp)
    }

    fn insert_slot(&self, mp: &MptrHandle) -> Result<()> {
        let Some(body) = mp.body() else {
            return Ok(());
        };
        let Some((from, to)) = body.edge.clone() else {
            return Ok(());
        };

        {
            let mut out_edges = self.out_edges.write()?;
            let vertex = (from.cid, from.key);
            let mut slots = out_edges.get(&vertex).cloned().unwrap_or_default();
            slots.push(mp.index());
            out_edges.insert(vertex, slots);
        }
        {
            let mut in_edges = self.in_edges.write()?;
            let vertex = (to.cid, to.key);
            let mut slots = in_edges.get(&vertex).cloned().unwrap_or_default();
            slots.push(mp.index());
            in_edges.insert(vertex, slots);
        }
        Ok(())
    }

    /// Edges connected to a vertex, filtered by the transaction's read
    /// visibility.
    pub fn lookup(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        direction: EdgeDirection,
        vertex_cid: CollectionId,
        vertex_key: &str,
    ) -> Result<Vec<MptrHandle>> {
        let vertex = (vertex_cid, vertex_key.to_string());
        let mut slots: Vec<SlotIndex> = Vec::new();

        if matches!(direction, EdgeDirection::Out | EdgeDirection::Any) {
            let out_edges = self.out_edges.read()?;
            if let Some(found) = out_edges.get(&vertex) {
                slots.extend(found.iter().copied());
            }
        }
        if matches!(direction, EdgeDirection::In | EdgeDirection::Any) {
            let in_edges = self.in_edges.read()?;
            if let Some(found) = in_edges.get(&vertex) {
                slots.extend(found.iter().copied());
            }
        }
        // self-loops show up in both structures
        slots.sort_unstable();
        slots.dedup();

        let manager = collection.collection().masterpointer_manager();
        let mut result = Vec::new();
        for slot in slots {
            let handle = manager.handle(slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                result.push(handle);
            }
        }
        Ok(result)
    }

    pub fn remove(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
        _key: &str,
        mp: &MptrHandle,
    ) -> Result<Option<MptrHandle>> {
        if self.erase(mp)? {
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
        self.erase(mp)?;
        Ok(())
    }

    pub fn pre_commit(
        &self,
        _collection: &TransactionCollection,
        _transaction: &Transaction,
    ) -> Result<()> {
        Ok(())
    }

    fn erase(&self, mp: &MptrHandle) -> Result<bool> {
        let Some(body) = mp.body() else {
            return Ok(false);
        };
        let Some((from, to)) = body.edge.clone() else {
            return Ok(false);
        };
        let slot = mp.index();
        let mut found = false;

        {
            let mut out_edges = self.out_edges.write()?;
            let vertex = (from.cid, from.key);
            if let Some(slots) = out_edges.get(&vertex) {
                let mut slots = slots.clone();
                let before = slots.len();
                slots.retain(|s| *s != slot);
                found |= slots.len() != before;
                if slots.is_empty() {
                    out_edges.remove(&vertex);
                } else {
                    out_edges.insert(vertex, slots);
                }
            }
        }
        {
            let mut in_edges = self.in_edges.write()?;
            let vertex = (to.cid, to.key);
            if let Some(slots) = in_edges.get(&vertex) {
                let mut slots = slots.clone();
                let before = slots.len();
                slots.retain(|s| *s != slot);
                found |= slots.len() != before;
                if slots.is_empty() {
                    in_edges.remove(&vertex);
                } else {
                    in_edges.insert(vertex, slots);
                }
            }
        }
        Ok(found)
    }

    pub fn fill_slot(&self, _shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        self.insert_slot(mp)
    }

    pub fn memory(&self) -> usize {
        let out_edges = self.out_edges.read().expect("edge index poisoned");
        let in_edges = self.in_edges.read().expect("edge index poisoned");
        let count: usize = out_edges.values().map(Vec::len).sum::<usize>()
            + in_edges.values().map(Vec::len).sum::<usize>();
        count * std::mem::size_of::<SlotIndex>()
    }

    pub fn click_lock(&self) {
        let _out = self.out_edges.write().expect("edge index poisoned");
        let _in = self.in_edges.write().expect("edge index poisoned");
    }
}
