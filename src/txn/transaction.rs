// ============================================================================
// MVCC Transaction
// ============================================================================

use log::{debug, trace};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::collection::operations;
use crate::core::{CollectionId, DbError, Result, RevisionId, Tick};
use crate::mptr::SlotIndex;
use crate::vocbase::Vocbase;
use crate::wal::Marker;

use super::collection::{AccessType, TransactionCollection};
use super::id::TransactionId;
use super::manager::{LocalTransactionManager, ResolvedStatus};

// ============================================================================
// Status / visibility
// ============================================================================

/// Lifecycle states. Once a transaction leaves ONGOING its status is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Created,
    Ongoing,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Created => write!(f, "CREATED"),
            TransactionStatus::Ongoing => write!(f, "ONGOING"),
            TransactionStatus::Committed => write!(f, "COMMITTED"),
            TransactionStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Classification of another transaction relative to this one. The ordering
/// is guaranteed (INVISIBLE < CONCURRENT < VISIBLE) so comparisons like
/// `visibility(x) < Visibility::Visible` are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    Invisible = 1,
    Concurrent = 2,
    Visible = 3,
}

// ============================================================================
// Flags and hints
// ============================================================================

const FLAG_INITIALIZED: u32 = 0x01;
const FLAG_BEGIN_MARKER_WRITTEN: u32 = 0x02;
const FLAG_DATA_MARKER_WRITTEN: u32 = 0x04;
const FLAG_END_MARKER_WRITTEN: u32 = 0x08;
const FLAG_PUSHED_ON_THREAD_STACK: u32 = 0x10;

#[derive(Debug, Default)]
pub struct TransactionFlags(AtomicU32);

impl TransactionFlags {
    fn has(&self, flag: u32) -> bool {
        self.0.load(Ordering::SeqCst) & flag != 0
    }

    fn set(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::SeqCst);
    }

    fn clear(&self, flag: u32) {
        self.0.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn initialized(&self) -> bool {
        self.has(FLAG_INITIALIZED)
    }

    pub fn begin_marker_written(&self) -> bool {
        self.has(FLAG_BEGIN_MARKER_WRITTEN)
    }

    pub fn data_marker_written(&self) -> bool {
        self.has(FLAG_DATA_MARKER_WRITTEN)
    }

    pub fn end_marker_written(&self) -> bool {
        self.has(FLAG_END_MARKER_WRITTEN)
    }

    pub fn pushed_on_thread_stack(&self) -> bool {
        self.has(FLAG_PUSHED_ON_THREAD_STACK)
    }

    pub fn set_initialized(&self) {
        debug_assert!(!self.initialized());
        self.set(FLAG_INITIALIZED);
    }

    pub fn set_begin_marker_written(&self) {
        debug_assert!(!self.begin_marker_written());
        debug_assert!(!self.data_marker_written());
        debug_assert!(!self.end_marker_written());
        self.set(FLAG_BEGIN_MARKER_WRITTEN);
    }

    pub fn set_data_marker_written(&self) {
        self.set(FLAG_DATA_MARKER_WRITTEN);
    }

    pub fn set_end_marker_written(&self) {
        debug_assert!(self.begin_marker_written());
        debug_assert!(!self.end_marker_written());
        self.set(FLAG_END_MARKER_WRITTEN);
    }

    pub fn set_pushed_on_thread_stack(&self, value: bool) {
        if value {
            self.set(FLAG_PUSHED_ON_THREAD_STACK);
        } else {
            self.clear(FLAG_PUSHED_ON_THREAD_STACK);
        }
    }
}

/// Behavior hints supplied at begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    LockNever = 0x01,
    LockEntirely = 0x02,
    NoBeginMarker = 0x04,
    NoAbortMarker = 0x08,
    SingleOperation = 0x10,
    NoThrottling = 0x20,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionHints(u32);

impl TransactionHints {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, hint: Hint) -> Self {
        self.0 |= hint as u32;
        self
    }

    pub fn has(&self, hint: Hint) -> bool {
        self.0 & (hint as u32) != 0
    }
}

// ============================================================================
// Per-collection statistics
// ============================================================================

/// Modification counters a transaction accumulates per collection.
/// Merging adds the counts, maxes the revision and ORs waitForSync.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub num_inserted: usize,
    pub num_removed: usize,
    pub revision_id: RevisionId,
    pub wait_for_sync: bool,
}

impl CollectionStats {
    pub fn has_modifications(&self) -> bool {
        self.num_inserted > 0 || self.num_removed > 0
    }

    pub fn merge(&mut self, other: &CollectionStats) {
        self.num_inserted += other.num_inserted;
        self.num_removed += other.num_removed;
        self.update_revision(other.revision_id);
        self.wait_for_sync |= other.wait_for_sync;
    }

    pub fn update_revision(&mut self, other: RevisionId) {
        if other > self.revision_id {
            self.revision_id = other;
        }
    }
}

// ============================================================================
// Operation log
// ============================================================================

/// What a transaction did, recorded for rollback (and for applying the
/// deferred effects of removes at commit).
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    InsertDocument {
        cid: CollectionId,
        slot: SlotIndex,
    },
    UpdateDocument {
        cid: CollectionId,
        old_slot: SlotIndex,
        new_slot: SlotIndex,
    },
    RemoveDocument {
        cid: CollectionId,
        slot: SlotIndex,
    },
}

// ============================================================================
// Visibility snapshot
// ============================================================================

/// What was running when this transaction began. A transaction `t` is
/// "committed before our start" iff `t < watermark` and `t` was not running.
#[derive(Debug, Clone, Default)]
pub struct VisibilitySnapshot {
    pub running: HashSet<Tick>,
    pub watermark: Tick,
}

impl VisibilitySnapshot {
    pub fn committed_before_start(&self, own: Tick) -> bool {
        own < self.watermark && !self.running.contains(&own)
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// A logical unit of work against one vocbase.
///
/// Created by the transaction manager (`create_transaction`), driven through
/// `begin` / `commit` / `rollback`, usually via a `TransactionScope`. Nested
/// transactions share their ancestor's `top` id and become externally
/// visible only when the top level commits.
pub struct Transaction {
    manager: Arc<LocalTransactionManager>,
    id: TransactionId,
    vocbase: Arc<Vocbase>,
    start_time: Instant,
    status: Mutex<TransactionStatus>,
    pub flags: TransactionFlags,
    hints: Mutex<TransactionHints>,
    killed: AtomicBool,
    snapshot: Mutex<VisibilitySnapshot>,
    stats: Mutex<BTreeMap<CollectionId, CollectionStats>>,
    collections: Mutex<BTreeMap<CollectionId, Arc<TransactionCollection>>>,
    operations: Mutex<Vec<Operation>>,
    sub_transactions: Mutex<Vec<(Tick, TransactionStatus)>>,
    ongoing_child: Mutex<Weak<Transaction>>,
    parent: Option<Arc<Transaction>>,
    nesting_level: usize,
}

impl Transaction {
    pub(crate) fn new(
        manager: Arc<LocalTransactionManager>,
        id: TransactionId,
        vocbase: Arc<Vocbase>,
        parent: Option<Arc<Transaction>>,
    ) -> Self {
        let nesting_level = parent.as_ref().map(|p| p.nesting_level + 1).unwrap_or(0);
        Self {
            manager,
            id,
            vocbase,
            start_time: Instant::now(),
            status: Mutex::new(TransactionStatus::Created),
            flags: TransactionFlags::default(),
            hints: Mutex::new(TransactionHints::default()),
            killed: AtomicBool::new(false),
            snapshot: Mutex::new(VisibilitySnapshot::default()),
            stats: Mutex::new(BTreeMap::new()),
            collections: Mutex::new(BTreeMap::new()),
            operations: Mutex::new(Vec::new()),
            sub_transactions: Mutex::new(Vec::new()),
            ongoing_child: Mutex::new(Weak::new()),
            parent,
            nesting_level,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn vocbase(&self) -> &Arc<Vocbase> {
        &self.vocbase
    }

    pub fn manager(&self) -> &Arc<LocalTransactionManager> {
        &self.manager
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock().expect("transaction status poisoned")
    }

    pub fn is_ongoing(&self) -> bool {
        self.status() == TransactionStatus::Ongoing
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent(&self) -> Option<&Arc<Transaction>> {
        self.parent.as_ref()
    }

    pub fn nesting_level(&self) -> usize {
        self.nesting_level
    }

    pub fn hints(&self) -> TransactionHints {
        *self.hints.lock().expect("transaction hints poisoned")
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> VisibilitySnapshot {
        self.snapshot.lock().expect("snapshot poisoned").clone()
    }

    // ------------------------------------------------------------------------
    // begin
    // ------------------------------------------------------------------------

    /// Start the transaction: store hints, wait out throttling, capture the
    /// visibility snapshot and register the declared collections.
    pub fn begin(
        self: &Arc<Self>,
        hints: TransactionHints,
        declared: &[(&str, AccessType)],
    ) -> Result<()> {
        {
            let status = self.status.lock()?;
            if *status != TransactionStatus::Created {
                return Err(DbError::TransactionInternal(format!(
                    "cannot begin transaction in state {}",
                    status
                )));
            }
        }

        let writes = declared.iter().any(|(_, access)| *access == AccessType::Write);

        if writes && !hints.has(Hint::NoThrottling) {
            self.wait_for_throttle()?;
        }

        *self.hints.lock()? = hints;

        // capture the set of transactions concurrent at start
        {
            let mut snapshot = self.snapshot.lock()?;
            *snapshot = self.manager.visibility_snapshot();
        }

        {
            let mut status = self.status.lock()?;
            *status = TransactionStatus::Ongoing;
        }
        self.flags.set_initialized();

        trace!("beginning transaction {}", self.id);

        if let Some(parent) = &self.parent {
            parent.sub_transaction_started(self);
        }

        // register collections; this may fail, in which case the caller is
        // expected to roll back via the scope
        for (name, access) in declared {
            self.collection(name, *access)?;
        }

        // lock-entirely takes the exclusive side, declared writers take the
        // shared side so concurrent MVCC writers can proceed
        if !hints.has(Hint::LockNever) {
            let lock_timeout = self.vocbase.config().lock_timeout;
            let collections = self.collections.lock()?;
            for txn_collection in collections.values() {
                if hints.has(Hint::LockEntirely) {
                    txn_collection.lock_write(lock_timeout)?;
                } else if txn_collection.access() == AccessType::Write {
                    txn_collection.lock_read(lock_timeout)?;
                }
            }
        }

        Ok(())
    }

    fn wait_for_throttle(&self) -> Result<()> {
        let config = self.vocbase.config();
        let wal = self.vocbase.wal();
        if !wal.is_throttled() {
            return Ok(());
        }
        let deadline = Instant::now() + config.throttle_max_wait;
        while wal.is_throttled() {
            if Instant::now() >= deadline {
                return Err(DbError::WriteThrottleTimeout);
            }
            std::thread::sleep(config.throttle_poll_interval);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // collections
    // ------------------------------------------------------------------------

    /// Return the collection handle for `name`, registering it in the
    /// transaction if not yet present. Nested transactions register on the
    /// top level.
    pub fn collection(self: &Arc<Self>, name: &str, access: AccessType) -> Result<Arc<TransactionCollection>> {
        if self.parent.is_some() {
            // collections are tracked by the outermost transaction
            return self
                .top_level_transaction()
                .collection_on_top(name, access, self.nesting_level);
        }
        self.collection_on_top(name, access, 0)
    }

    fn top_level_transaction(self: &Arc<Self>) -> Arc<Transaction> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    fn collection_on_top(
        self: &Arc<Self>,
        name: &str,
        access: AccessType,
        nesting_level: usize,
    ) -> Result<Arc<TransactionCollection>> {
        let collection = self
            .vocbase
            .collection_by_name(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        let cid = collection.id();

        let mut collections = self.collections.lock()?;
        if let Some(existing) = collections.get(&cid) {
            if access == AccessType::Write && existing.access() == AccessType::Read {
                // upgrading inside a nested scope would let a subtransaction
                // widen locks its parent never declared
                if nesting_level > 0 {
                    return Err(DbError::TransactionInternal(format!(
                        "cannot upgrade collection '{}' to write access in a nested transaction",
                        name
                    )));
                }
                existing.upgrade_to_write()?;
            }
            return Ok(Arc::clone(existing));
        }

        let txn_collection = Arc::new(TransactionCollection::new(
            Arc::clone(&self.vocbase),
            collection,
            access,
            nesting_level,
        ));
        collections.insert(cid, Arc::clone(&txn_collection));
        Ok(txn_collection)
    }

    /// Register a collection from a joining (nested) scope. Upgrading an
    /// existing READ binding to WRITE is refused here.
    pub(crate) fn collection_for_scope(
        self: &Arc<Self>,
        name: &str,
        access: AccessType,
    ) -> Result<Arc<TransactionCollection>> {
        self.top_level_transaction()
            .collection_on_top(name, access, self.nesting_level.max(1))
    }

    /// Look up an already registered collection.
    pub fn registered_collection(&self, cid: CollectionId) -> Result<Arc<TransactionCollection>> {
        if let Some(parent) = &self.parent {
            return parent.registered_collection(cid);
        }
        let collections = self.collections.lock()?;
        collections
            .get(&cid)
            .cloned()
            .ok_or_else(|| DbError::TransactionUnregisteredCollection(cid.to_string()))
    }

    // ------------------------------------------------------------------------
    // statistics and operations
    // ------------------------------------------------------------------------

    pub fn inc_num_inserted(&self, cid: CollectionId, revision: RevisionId, wait_for_sync: bool) {
        let mut stats = self.stats.lock().expect("stats poisoned");
        let entry = stats.entry(cid).or_default();
        entry.num_inserted += 1;
        entry.update_revision(revision);
        entry.wait_for_sync |= wait_for_sync;
    }

    pub fn inc_num_removed(&self, cid: CollectionId, revision: RevisionId, wait_for_sync: bool) {
        let mut stats = self.stats.lock().expect("stats poisoned");
        let entry = stats.entry(cid).or_default();
        entry.num_removed += 1;
        entry.update_revision(revision);
        entry.wait_for_sync |= wait_for_sync;
    }

    /// Statistics for one collection, aggregated over this transaction and
    /// all its ancestors.
    pub fn aggregated_stats(&self, cid: CollectionId) -> CollectionStats {
        let mut aggregate = CollectionStats::default();
        let mut current = Some(self);
        while let Some(txn) = current {
            let stats = txn.stats.lock().expect("stats poisoned");
            if let Some(entry) = stats.get(&cid) {
                aggregate.merge(entry);
            }
            current = txn.parent.as_deref();
        }
        aggregate
    }

    pub fn record_operation(&self, operation: Operation) {
        let mut operations = self.operations.lock().expect("operations poisoned");
        operations.push(operation);
    }

    pub fn operations_snapshot(&self) -> Vec<Operation> {
        self.operations.lock().expect("operations poisoned").clone()
    }

    // ------------------------------------------------------------------------
    // markers
    // ------------------------------------------------------------------------

    /// Write the begin marker if this data marker is the first one of the
    /// whole transaction tree ("lazy begin"), then mark data written.
    pub fn note_data_marker(self: &Arc<Self>) -> Result<()> {
        let top = self.top_level_transaction();
        let hints = top.hints();
        if !top.flags.begin_marker_written()
            && !hints.has(Hint::NoBeginMarker)
            && !hints.has(Hint::SingleOperation)
        {
            top.vocbase.wal().append(
                Marker::BeginTransaction {
                    vocbase_id: top.vocbase.id(),
                    tid: top.id,
                },
                false,
            )?;
            top.flags.set_begin_marker_written();
        }
        top.flags.set_data_marker_written();
        if !Arc::ptr_eq(&top, self) {
            self.flags.set_data_marker_written();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // commit / rollback
    // ------------------------------------------------------------------------

    pub fn commit(self: &Arc<Self>) -> Result<()> {
        trace!("committing transaction {}", self.id);

        {
            let status = self.status.lock()?;
            if *status != TransactionStatus::Ongoing {
                return Err(DbError::TransactionInternal(
                    "cannot commit finished transaction".into(),
                ));
            }
        }

        // killed flag was set. must not commit!
        if self.killed() {
            self.rollback()?;
            return Err(DbError::TransactionInternal("transaction was killed".into()));
        }

        if let Some(child) = self.take_ongoing_child() {
            let _ = child.rollback();
        }

        // give every index of every touched collection its pre-commit hook
        {
            let collections = self.collections_of_tree()?;
            for txn_collection in collections.values() {
                for index in txn_collection.collection().indexes() {
                    index.pre_commit(txn_collection, self)?;
                }
            }
        }

        if self.is_top_level() {
            let hints = self.hints();
            if self.flags.begin_marker_written() && !hints.has(Hint::SingleOperation) {
                let wait_for_sync = self.any_wait_for_sync();
                self.vocbase.wal().append(
                    Marker::CommitTransaction {
                        vocbase_id: self.vocbase.id(),
                        tid: self.id,
                    },
                    wait_for_sync,
                )?;
                self.flags.set_end_marker_written();
            }

            // removes take effect now: tombstoned versions leave the
            // publication list (recycling stays deferred to iterators)
            operations::apply_commit_effects(self)?;
            self.flush_collection_counters()?;
        }

        {
            let mut status = self.status.lock()?;
            *status = TransactionStatus::Committed;
        }

        if let Some(parent) = &self.parent {
            self.propagate_to_parent(parent)?;
            parent.sub_transaction_finished(self.id.own(), TransactionStatus::Committed);
        }

        self.manager.unregister_transaction(self);
        self.release_locks();

        debug!("committed transaction {}", self.id);
        Ok(())
    }

    pub fn rollback(self: &Arc<Self>) -> Result<()> {
        trace!("rolling back transaction {}", self.id);

        {
            let status = self.status.lock()?;
            if status.is_terminal() {
                return Err(DbError::TransactionInternal(
                    "cannot rollback finished transaction".into(),
                ));
            }
        }

        if let Some(child) = self.take_ongoing_child() {
            let _ = child.rollback();
        }

        // undo our own writes in reverse order
        let operations: Vec<Operation> = {
            let mut guard = self.operations.lock()?;
            guard.drain(..).rev().collect()
        };
        for operation in &operations {
            operations::undo_operation(self, operation)?;
        }

        let hints = self.hints();
        if self.is_top_level()
            && self.flags.begin_marker_written()
            && !hints.has(Hint::NoAbortMarker)
        {
            // best effort; the id is tracked as aborted either way
            if let Err(e) = self.vocbase.wal().append(
                Marker::AbortTransaction {
                    vocbase_id: self.vocbase.id(),
                    tid: self.id,
                },
                false,
            ) {
                debug!("failed to write abort marker for {}: {}", self.id, e);
            } else {
                self.flags.set_end_marker_written();
            }
        }

        {
            let mut status = self.status.lock()?;
            *status = TransactionStatus::RolledBack;
        }

        if let Some(parent) = &self.parent {
            parent.sub_transaction_finished(self.id.own(), TransactionStatus::RolledBack);
        }

        self.manager.unregister_transaction(self);
        self.release_locks();

        debug!("rolled back transaction {}", self.id);
        Ok(())
    }

    /// Merge a committing subtransaction's bookkeeping into its parent.
    fn propagate_to_parent(&self, parent: &Arc<Transaction>) -> Result<()> {
        {
            let mut own_ops = self.operations.lock()?;
            let mut parent_ops = parent.operations.lock()?;
            parent_ops.extend(own_ops.drain(..));
        }
        {
            let own_stats = self.stats.lock()?;
            let mut parent_stats = parent.stats.lock()?;
            for (cid, stats) in own_stats.iter() {
                parent_stats.entry(*cid).or_default().merge(stats);
            }
        }
        Ok(())
    }

    fn collections_of_tree(&self) -> Result<BTreeMap<CollectionId, Arc<TransactionCollection>>> {
        if let Some(parent) = &self.parent {
            return parent.collections_of_tree();
        }
        Ok(self.collections.lock()?.clone())
    }

    fn any_wait_for_sync(&self) -> bool {
        let stats = self.stats.lock().expect("stats poisoned");
        stats.values().any(|s| s.wait_for_sync)
    }

    /// Push the transaction's aggregated revision into the collections.
    /// The count and size deltas flow through the commit effects of the
    /// individual operations.
    fn flush_collection_counters(&self) -> Result<()> {
        let stats = self.stats.lock()?;
        let collections = self.collections.lock()?;
        for (cid, entry) in stats.iter() {
            if let Some(txn_collection) = collections.get(cid) {
                txn_collection.collection().update_revision_id(entry.revision_id);
            }
        }
        Ok(())
    }

    fn release_locks(&self) {
        if !self.is_top_level() {
            return;
        }
        let collections = self.collections.lock().expect("collections poisoned");
        // reverse registration order
        for txn_collection in collections.values().rev() {
            txn_collection.release_locks();
        }
    }

    // ------------------------------------------------------------------------
    // subtransaction bookkeeping
    // ------------------------------------------------------------------------

    fn sub_transaction_started(&self, child: &Arc<Transaction>) {
        let mut ongoing = self.ongoing_child.lock().expect("ongoing child poisoned");
        *ongoing = Arc::downgrade(child);
        let mut subs = self.sub_transactions.lock().expect("subs poisoned");
        subs.push((child.id().own(), TransactionStatus::Ongoing));
    }

    fn sub_transaction_finished(&self, own: Tick, status: TransactionStatus) {
        {
            let mut ongoing = self.ongoing_child.lock().expect("ongoing child poisoned");
            *ongoing = Weak::new();
        }
        let mut subs = self.sub_transactions.lock().expect("subs poisoned");
        if let Some(entry) = subs.iter_mut().find(|(id, _)| *id == own) {
            entry.1 = status;
        }
    }

    fn take_ongoing_child(&self) -> Option<Arc<Transaction>> {
        let ongoing = self.ongoing_child.lock().expect("ongoing child poisoned");
        ongoing.upgrade().filter(|child| child.is_ongoing())
    }

    /// Status of a transaction in this tree, looked up across all levels.
    fn tree_status(&self, own: Tick) -> Option<TransactionStatus> {
        let subs = self.sub_transactions.lock().expect("subs poisoned");
        if let Some((_, status)) = subs.iter().find(|(id, _)| *id == own) {
            return Some(*status);
        }
        drop(subs);
        self.parent.as_ref().and_then(|p| p.tree_status(own))
    }

    fn is_ancestor(&self, own: Tick) -> bool {
        let mut current = Some(self);
        while let Some(txn) = current {
            if txn.id.own() == own {
                return true;
            }
            current = txn.parent.as_deref();
        }
        false
    }

    // ------------------------------------------------------------------------
    // visibility
    // ------------------------------------------------------------------------

    /// Classify the transaction with own-tick `other` relative to this one.
    pub fn visibility(&self, other: Tick) -> Visibility {
        if other == 0 {
            // not-yet-set
            return Visibility::Invisible;
        }
        if other == self.id.own() || self.is_ancestor(other) {
            return Visibility::Visible;
        }

        match self.manager.resolve(other) {
            ResolvedStatus::Running { top } => {
                if top == self.id.top() {
                    // a sibling in our tree that is still ongoing
                    match self.top_status_of(other) {
                        Some(TransactionStatus::Committed) => Visibility::Visible,
                        Some(TransactionStatus::RolledBack) => Visibility::Invisible,
                        _ => Visibility::Concurrent,
                    }
                } else {
                    Visibility::Concurrent
                }
            }
            ResolvedStatus::Terminated { top, status } => {
                if top == self.id.top() {
                    return match status {
                        TransactionStatus::Committed => Visibility::Visible,
                        TransactionStatus::RolledBack => Visibility::Invisible,
                        _ => Visibility::Concurrent,
                    };
                }
                match status {
                    TransactionStatus::RolledBack => Visibility::Invisible,
                    TransactionStatus::Committed => self.external_visibility(other, top),
                    _ => Visibility::Concurrent,
                }
            }
            ResolvedStatus::Unknown => {
                // ids below every running transaction must have been
                // replayed, which implies they committed
                if self.manager.below_minimum_running(other) {
                    if self.snapshot().committed_before_start(other) {
                        Visibility::Visible
                    } else {
                        Visibility::Concurrent
                    }
                } else {
                    Visibility::Concurrent
                }
            }
        }
    }

    /// Status of `own` as recorded inside this transaction tree.
    fn top_status_of(&self, own: Tick) -> Option<TransactionStatus> {
        self.tree_status(own)
    }

    /// Visibility of a committed transaction from a different tree: its top
    /// level must also have committed, before we started.
    fn external_visibility(&self, other: Tick, top: Tick) -> Visibility {
        let gate = if top == other {
            top
        } else {
            // a subtransaction: its writes surface with its top level
            match self.manager.resolve(top) {
                ResolvedStatus::Running { .. } => return Visibility::Concurrent,
                ResolvedStatus::Terminated { status, .. } => match status {
                    TransactionStatus::Committed => top,
                    TransactionStatus::RolledBack => return Visibility::Invisible,
                    _ => return Visibility::Concurrent,
                },
                ResolvedStatus::Unknown => top,
            }
        };

        if self.snapshot().committed_before_start(gate) {
            Visibility::Visible
        } else {
            Visibility::Concurrent
        }
    }

    /// The predicate master-pointer iterators use: a version is readable iff
    /// its creator is visible and its superseder is not.
    pub fn is_visible_for_read(&self, from: Tick, to: Tick) -> bool {
        self.visibility(from) == Visibility::Visible
            && self.visibility(to) != Visibility::Visible
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("top_level", &self.is_top_level())
            .finish()
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_top_level() {
            write!(f, "TopLevelTransaction {}", self.id)
        } else {
            write!(f, "SubTransaction {}", self.id)
        }
    }
}

/// Diagnostic record returned by `running_transactions`.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub start_time: Instant,
}
