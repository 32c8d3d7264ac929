// ============================================================================
// Skiplist Index
// ============================================================================

use im::OrdMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::RwLock;

use crate::core::{IndexId, Result, RevisionId};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::{ShapedValue, Shaper, compare_shaped};
use crate::txn::{Transaction, TransactionCollection};

use super::{IndexMeta, check_unique_conflict, extract_fields};

// ============================================================================
// Composite key
// ============================================================================

/// Entry keys carry (document key, revision) after the attribute values so
/// every record has a unique position even in non-unique indexes. Query
/// bounds use the Min/Max sentinels instead, which also encode bound
/// exclusivity for shorter (prefix) bounds.
#[derive(Clone, Debug)]
enum Tiebreak {
    Min,
    Doc { key: String, revision: RevisionId },
    Max,
}

impl Tiebreak {
    fn rank(&self) -> u8 {
        match self {
            Tiebreak::Min => 0,
            Tiebreak::Doc { .. } => 1,
            Tiebreak::Max => 2,
        }
    }
}

#[derive(Clone, Debug)]
struct SkiplistKey {
    values: Vec<ShapedValue>,
    tiebreak: Tiebreak,
}

impl SkiplistKey {
    fn entry(values: Vec<ShapedValue>, key: String, revision: RevisionId) -> Self {
        Self {
            values,
            tiebreak: Tiebreak::Doc { key, revision },
        }
    }

    fn bound(values: Vec<ShapedValue>, upper: bool) -> Self {
        Self {
            values,
            tiebreak: if upper { Tiebreak::Max } else { Tiebreak::Min },
        }
    }
}

impl PartialEq for SkiplistKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SkiplistKey {}

impl PartialOrd for SkiplistKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SkiplistKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let common = self.values.len().min(other.values.len());
        for i in 0..common {
            let ord = compare_shaped(&self.values[i], &other.values[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        // a shorter key is a prefix bound: its sentinel places it before or
        // after every full entry sharing the prefix
        if self.values.len() != other.values.len() {
            return if self.values.len() < other.values.len() {
                match self.tiebreak {
                    Tiebreak::Max => Ordering::Greater,
                    _ => Ordering::Less,
                }
            } else {
                match other.tiebreak {
                    Tiebreak::Max => Ordering::Less,
                    _ => Ordering::Greater,
                }
            };
        }

        let rank = self.tiebreak.rank().cmp(&other.tiebreak.rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (&self.tiebreak, &other.tiebreak) {
            (
                Tiebreak::Doc { key, revision },
                Tiebreak::Doc {
                    key: other_key,
                    revision: other_revision,
                },
            ) => key.cmp(other_key).then(revision.cmp(other_revision)),
            _ => Ordering::Equal,
        }
    }
}

// ============================================================================
// Operator tree
// ============================================================================

/// Composite lookup condition over the indexed paths. Values shorter than
/// the field list act as prefix conditions.
#[derive(Debug, Clone)]
pub enum SkiplistOperator {
    Eq(Vec<Value>),
    Lt(Vec<Value>),
    Le(Vec<Value>),
    Gt(Vec<Value>),
    Ge(Vec<Value>),
    And(Box<SkiplistOperator>, Box<SkiplistOperator>),
}

#[derive(Default)]
struct Interval {
    lower: Option<(Vec<ShapedValue>, bool)>, // (values, inclusive)
    upper: Option<(Vec<ShapedValue>, bool)>,
}

fn compare_bound_values(left: &[ShapedValue], right: &[ShapedValue]) -> Ordering {
    let common = left.len().min(right.len());
    for i in 0..common {
        let ord = compare_shaped(&left[i], &right[i]);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

impl Interval {
    fn intersect(self, other: Interval) -> Interval {
        let lower = match (self.lower, other.lower) {
            (Some(a), Some(b)) => Some(match compare_bound_values(&a.0, &b.0) {
                Ordering::Less => b,
                Ordering::Greater => a,
                // equal bounds: exclusive wins
                Ordering::Equal => (a.0, a.1 && b.1),
            }),
            (a, b) => a.or(b),
        };
        let upper = match (self.upper, other.upper) {
            (Some(a), Some(b)) => Some(match compare_bound_values(&a.0, &b.0) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => (a.0, a.1 && b.1),
            }),
            (a, b) => a.or(b),
        };
        Interval { lower, upper }
    }
}

// ============================================================================
// The index
// ============================================================================

/// Ordered index over the composite shape-typed comparator
/// (null < boolean < number < string < sequence < object).
pub struct SkiplistIndex {
    meta: IndexMeta,
    entries: RwLock<OrdMap<SkiplistKey, SlotIndex>>,
}

impl SkiplistIndex {
    pub fn new(id: IndexId, fields: Vec<String>, unique: bool, sparse: bool) -> Self {
        Self {
            meta: IndexMeta::new(id, fields, unique, sparse),
            entries: RwLock::new(OrdMap::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    fn key_for(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<Option<SkiplistKey>> {
        let Some(body) = mp.body() else {
            return Ok(None);
        };
        let decoded = body.decode()?;
        let (values, all_set) = extract_fields(shaper, &decoded, &self.meta.fields)?;
        if self.meta.sparse && !all_set {
            return Ok(None);
        }
        Ok(Some(SkiplistKey::entry(values, body.key.clone(), body.revision)))
    }

    pub fn insert(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        let Some(key) = self.key_for(collection.shaper(), mp)? else {
            return Ok(());
        };

        let mut entries = self.entries.write()?;

        if self.meta.unique {
            let manager = collection.collection().masterpointer_manager();
            let lower = SkiplistKey::bound(key.values.clone(), false);
            let upper = SkiplistKey::bound(key.values.clone(), true);
            for (_, slot) in entries.range((Bound::Included(lower), Bound::Included(upper))) {
                if *slot == mp.index() {
                    continue;
                }
                let handle = manager.handle(*slot);
                check_unique_conflict(
                    transaction,
                    handle.from(),
                    handle.to(),
                    &format!("unique skiplist index on [{}]", self.meta.fields.join(", ")),
                )?;
            }
        }

        entries.insert(key, mp.index());
        Ok(())
    }

    /// Evaluate an operator tree. The result iterator is reversible via the
    /// `reverse` flag.
    pub fn lookup(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        operator: &SkiplistOperator,
        reverse: bool,
    ) -> Result<SkiplistIterator> {
        let shaper = collection.shaper();
        let interval = self.interval_of(shaper, operator)?;

        let lower = match interval.lower {
            Some((values, inclusive)) => {
                Bound::Included(SkiplistKey::bound(values, !inclusive))
            }
            None => Bound::Unbounded,
        };
        let upper = match interval.upper {
            Some((values, inclusive)) => {
                Bound::Included(SkiplistKey::bound(values, inclusive))
            }
            None => Bound::Unbounded,
        };

        let snapshot = {
            let entries = self.entries.read()?;
            entries.clone()
        };

        let manager = collection.collection().masterpointer_manager();
        let mut results = Vec::new();
        for (_, slot) in snapshot.range((lower, upper)) {
            let handle = manager.handle(*slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                results.push(handle);
            }
        }
        if reverse {
            results.reverse();
        }
        Ok(SkiplistIterator {
            results,
            position: 0,
        })
    }

    fn interval_of(&self, shaper: &Shaper, operator: &SkiplistOperator) -> Result<Interval> {
        let shape = |values: &[Value]| -> Result<Vec<ShapedValue>> {
            let mut shaped = Vec::with_capacity(values.len());
            for value in values {
                let (sid, _) = shaper.shape_of(value)?;
                shaped.push(ShapedValue::new(sid, value.clone()));
            }
            Ok(shaped)
        };

        Ok(match operator {
            SkiplistOperator::Eq(values) => {
                let shaped = shape(values)?;
                Interval {
                    lower: Some((shaped.clone(), true)),
                    upper: Some((shaped, true)),
                }
            }
            SkiplistOperator::Lt(values) => Interval {
                lower: None,
                upper: Some((shape(values)?, false)),
            },
            SkiplistOperator::Le(values) => Interval {
                lower: None,
                upper: Some((shape(values)?, true)),
            },
            SkiplistOperator::Gt(values) => Interval {
                lower: Some((shape(values)?, false)),
                upper: None,
            },
            SkiplistOperator::Ge(values) => Interval {
                lower: Some((shape(values)?, true)),
                upper: None,
            },
            SkiplistOperator::And(left, right) => {
                let left = self.interval_of(shaper, left)?;
                let right = self.interval_of(shaper, right)?;
                left.intersect(right)
            }
        })
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
        let Some(key) = self.key_for(shaper, mp)? else {
            return Ok(false);
        };
        let mut entries = self.entries.write()?;
        Ok(entries.remove(&key).is_some())
    }

    pub fn fill_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        let Some(key) = self.key_for(shaper, mp)? else {
            return Ok(());
        };
        let mut entries = self.entries.write()?;
        entries.insert(key, mp.index());
        Ok(())
    }

    pub fn memory(&self) -> usize {
        let entries = self.entries.read().expect("skiplist index poisoned");
        entries
            .keys()
            .map(|key| {
                key.values
                    .iter()
                    .map(|v| v.payload_bytes().len())
                    .sum::<usize>()
                    + std::mem::size_of::<SlotIndex>()
            })
            .sum()
    }

    pub fn click_lock(&self) {
        let _guard = self.entries.write().expect("skiplist index poisoned");
    }
}

/// Materialized, direction-aware result cursor of a skiplist lookup.
pub struct SkiplistIterator {
    results: Vec<MptrHandle>,
    position: usize,
}

impl SkiplistIterator {
    pub fn next(&mut self) -> Option<MptrHandle> {
        let handle = self.results.get(self.position)?.clone();
        self.position += 1;
        Some(handle)
    }

    pub fn has_more(&self) -> bool {
        self.position < self.results.len()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
