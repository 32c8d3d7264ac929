// ============================================================================
// Transaction Collection
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collection::DocumentCollection;
use crate::core::{CollectionId, DbError, Result, RevisionId};
use crate::shape::Shaper;
use crate::vocbase::Vocbase;

/// How a transaction uses a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionLockState {
    Unlocked,
    Read,
    Write,
}

/// Per-(transaction, collection) handle. At most one exists for any such
/// pair; it guards the underlying collection's lifecycle for the duration of
/// the transaction and remembers which locks the transaction holds on it.
pub struct TransactionCollection {
    vocbase: Arc<Vocbase>,
    collection: Arc<DocumentCollection>,
    access: Mutex<AccessType>,
    nesting_level: usize,
    lock_state: Mutex<CollectionLockState>,
    compaction_lock_held: AtomicBool,
    original_revision: RevisionId,
    wait_for_sync: AtomicBool,
}

impl TransactionCollection {
    pub fn new(
        vocbase: Arc<Vocbase>,
        collection: Arc<DocumentCollection>,
        access: AccessType,
        nesting_level: usize,
    ) -> Self {
        let original_revision = collection.revision_id();
        let wait_for_sync = collection.wait_for_sync();
        Self {
            vocbase,
            collection,
            access: Mutex::new(access),
            nesting_level,
            lock_state: Mutex::new(CollectionLockState::Unlocked),
            compaction_lock_held: AtomicBool::new(false),
            original_revision,
            wait_for_sync: AtomicBool::new(wait_for_sync),
        }
    }

    pub fn id(&self) -> CollectionId {
        self.collection.id()
    }

    pub fn name(&self) -> String {
        self.collection.name()
    }

    pub fn vocbase(&self) -> &Arc<Vocbase> {
        &self.vocbase
    }

    pub fn collection(&self) -> &Arc<DocumentCollection> {
        &self.collection
    }

    pub fn shaper(&self) -> &Shaper {
        self.collection.shaper()
    }

    pub fn access(&self) -> AccessType {
        *self.access.lock().expect("access poisoned")
    }

    pub fn nesting_level(&self) -> usize {
        self.nesting_level
    }

    pub fn original_revision(&self) -> RevisionId {
        self.original_revision
    }

    pub fn wait_for_sync(&self) -> bool {
        self.wait_for_sync.load(Ordering::SeqCst)
    }

    pub fn set_wait_for_sync(&self, value: bool) {
        self.wait_for_sync.store(value, Ordering::SeqCst);
    }

    pub(crate) fn upgrade_to_write(&self) -> Result<()> {
        let mut access = self.access.lock()?;
        *access = AccessType::Write;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // collection-level locks
    // ------------------------------------------------------------------------

    pub fn lock_read(&self, timeout: Duration) -> Result<()> {
        let mut state = self.lock_state.lock()?;
        if *state != CollectionLockState::Unlocked {
            return Ok(());
        }
        self.collection.collection_lock().lock_read(timeout)?;
        *state = CollectionLockState::Read;
        Ok(())
    }

    pub fn lock_write(&self, timeout: Duration) -> Result<()> {
        let mut state = self.lock_state.lock()?;
        match *state {
            CollectionLockState::Write => return Ok(()),
            CollectionLockState::Read => {
                return Err(DbError::TransactionInternal(format!(
                    "collection '{}' is already read-locked",
                    self.name()
                )));
            }
            CollectionLockState::Unlocked => {}
        }
        self.collection.collection_lock().lock_write(timeout)?;
        *state = CollectionLockState::Write;
        Ok(())
    }

    /// Readers and writers take the compaction lock shared; the compactor
    /// takes it exclusive. Always acquired after index locks.
    pub fn lock_compaction(&self, timeout: Duration) -> Result<()> {
        if self.compaction_lock_held.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.collection.compaction_lock().lock_read(timeout)?;
        self.compaction_lock_held.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop everything this handle still holds, in reverse order.
    pub fn release_locks(&self) {
        if self.compaction_lock_held.swap(false, Ordering::SeqCst) {
            self.collection.compaction_lock().unlock_read();
        }
        let mut state = self.lock_state.lock().expect("lock state poisoned");
        match *state {
            CollectionLockState::Read => self.collection.collection_lock().unlock_read(),
            CollectionLockState::Write => self.collection.collection_lock().unlock_write(),
            CollectionLockState::Unlocked => {}
        }
        *state = CollectionLockState::Unlocked;
    }
}

impl std::fmt::Debug for TransactionCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCollection")
            .field("collection", &self.name())
            .field("access", &self.access())
            .field("nesting_level", &self.nesting_level)
            .finish()
    }
}
