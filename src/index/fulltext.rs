// ============================================================================
// Fulltext Index
// ============================================================================

use im::{HashMap as ImHashMap, OrdSet};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::RwLock;

use crate::core::{IndexId, Result};
use crate::mptr::{MptrHandle, SlotIndex};
use crate::shape::Shaper;
use crate::txn::{Transaction, TransactionCollection};

use super::IndexMeta;

lazy_static! {
    static ref WORD_PATTERN: Regex = Regex::new(r"[\p{Alphabetic}\p{N}]+").expect("valid pattern");
}

/// How a query term combines with the rest of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermOperation {
    /// the word must be present
    And,
    /// at least one Or word must be present
    Or,
    /// the word must be absent
    Not,
}

#[derive(Debug, Clone)]
pub struct FulltextTerm {
    pub word: String,
    pub operation: TermOperation,
}

impl FulltextTerm {
    pub fn new(word: impl Into<String>, operation: TermOperation) -> Self {
        Self {
            word: word.into(),
            operation,
        }
    }
}

pub type FulltextQuery = Vec<FulltextTerm>;

/// Tokenizes one string attribute into lowercased words of a configurable
/// minimum length and keeps a word → postings map.
pub struct FulltextIndex {
    meta: IndexMeta,
    min_length: usize,
    postings: RwLock<ImHashMap<String, OrdSet<SlotIndex>>>,
}

impl FulltextIndex {
    pub fn new(id: IndexId, field: String, min_length: usize) -> Self {
        Self {
            meta: IndexMeta::new(id, vec![field], false, true),
            min_length: min_length.max(1),
            postings: RwLock::new(ImHashMap::new()),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    fn words_of(&self, text: &str) -> Vec<String> {
        let mut words: Vec<String> = WORD_PATTERN
            .find_iter(text)
            .map(|word| word.as_str().to_lowercase())
            .filter(|word| word.chars().count() >= self.min_length)
            .collect();
        words.sort();
        words.dedup();
        words
    }

    fn extract_words(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<Vec<String>> {
        let Some(body) = mp.body() else {
            return Ok(Vec::new());
        };
        let decoded = body.decode()?;
        let Some(value) = shaper.extract(&decoded, &self.meta.fields[0])? else {
            return Ok(Vec::new());
        };
        let Some(text) = value.value().as_str() else {
            return Ok(Vec::new());
        };
        Ok(self.words_of(text))
    }

    pub fn insert(
        &self,
        collection: &TransactionCollection,
        _transaction: &Transaction,
        mp: &MptrHandle,
    ) -> Result<()> {
        self.insert_slot(collection.shaper(), mp)
    }

    fn insert_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        let words = self.extract_words(shaper, mp)?;
        if words.is_empty() {
            return Ok(());
        }
        let mut postings = self.postings.write()?;
        for word in words {
            let set = postings.get(&word).cloned().unwrap_or_default();
            postings.insert(word, set.update(mp.index()));
        }
        Ok(())
    }

    /// Evaluate a query of And/Or/Not terms against the postings,
    /// visibility-filtered.
    pub fn query(
        &self,
        collection: &TransactionCollection,
        transaction: &Transaction,
        query: &FulltextQuery,
    ) -> Result<Vec<MptrHandle>> {
        let postings = {
            let guard = self.postings.read()?;
            guard.clone()
        };

        let set_for = |word: &str| -> OrdSet<SlotIndex> {
            postings.get(&word.to_lowercase()).cloned().unwrap_or_default()
        };

        let mut base: Option<OrdSet<SlotIndex>> = None;
        let mut or_union: Option<OrdSet<SlotIndex>> = None;

        for term in query {
            match term.operation {
                TermOperation::And => {
                    let set = set_for(&term.word);
                    base = Some(match base {
                        Some(current) => current.intersection(set),
                        None => set,
                    });
                }
                TermOperation::Or => {
                    let set = set_for(&term.word);
                    or_union = Some(match or_union {
                        Some(current) => current.union(set),
                        None => set,
                    });
                }
                TermOperation::Not => {}
            }
        }

        let mut result = match (base, or_union) {
            (Some(base), Some(or_union)) => base.intersection(or_union),
            (Some(base), None) => base,
            (None, Some(or_union)) => or_union,
            (None, None) => return Ok(Vec::new()),
        };

        for term in query {
            if term.operation == TermOperation::Not {
                result = result.relative_complement(set_for(&term.word));
            }
        }

        let manager = collection.collection().masterpointer_manager();
        let mut handles = Vec::new();
        for slot in result {
            let handle = manager.handle(slot);
            if transaction.is_visible_for_read(handle.from(), handle.to()) {
                handles.push(handle);
            }
        }
        Ok(handles)
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
        let words = self.extract_words(shaper, mp)?;
        if words.is_empty() {
            return Ok(false);
        }
        let mut postings = self.postings.write()?;
        let mut found = false;
        for word in words {
            if let Some(set) = postings.get(&word) {
                let set = set.without(&mp.index());
                found = true;
                if set.is_empty() {
                    postings.remove(&word);
                } else {
                    postings.insert(word, set);
                }
            }
        }
        Ok(found)
    }

    pub fn fill_slot(&self, shaper: &Shaper, mp: &MptrHandle) -> Result<()> {
        self.insert_slot(shaper, mp)
    }

    pub fn memory(&self) -> usize {
        let postings = self.postings.read().expect("fulltext index poisoned");
        postings
            .iter()
            .map(|(word, set)| word.len() + set.len() * std::mem::size_of::<SlotIndex>())
            .sum()
    }

    pub fn click_lock(&self) {
        let _guard = self.postings.write().expect("fulltext index poisoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IndexId;

    #[test]
    fn test_tokenizer_lowercases_and_filters() {
        let index = FulltextIndex::new(IndexId(1), "text".into(), 3);
        let words = index.words_of("The quick brown Fox, a fox!");
        assert_eq!(words, vec!["brown", "fox", "quick", "the"]);
    }
}
