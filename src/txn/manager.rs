// ============================================================================
// Transaction Manager
// ============================================================================

use lazy_static::lazy_static;
use log::{debug, trace, warn};
use lru::LruCache;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use crate::core::{DbError, Result, Tick, TickService, VocbaseId};
use crate::vocbase::Vocbase;

use super::id::TransactionId;
use super::transaction::{
    Transaction, TransactionInfo, TransactionStatus, VisibilitySnapshot,
};

thread_local! {
    static THREAD_TRANSACTIONS: RefCell<Vec<Arc<Transaction>>> = const { RefCell::new(Vec::new()) };
}

/// Answer of the status oracle for one own-tick.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedStatus {
    Running { top: Tick },
    Terminated { top: Tick, status: TransactionStatus },
    Unknown,
}

struct RunningEntry {
    top: Tick,
    vocbase_id: VocbaseId,
    start_time: Instant,
    handle: Weak<Transaction>,
}

/// The process-local transaction manager: issues ids, tracks running
/// transactions, and answers the status queries visibility is built on.
///
/// Terminal statuses go into a bounded recent-status cache; ids that fall
/// out of it are classified by the minimum-running-id rule (anything below
/// every running transaction must have been replayed, hence committed).
pub struct LocalTransactionManager {
    ticks: Arc<TickService>,
    running: Mutex<BTreeMap<Tick, RunningEntry>>,
    recent: Mutex<LruCache<Tick, (Tick, TransactionStatus)>>,
}

impl LocalTransactionManager {
    pub fn new(ticks: Arc<TickService>, status_cache_capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(status_cache_capacity.max(1)).expect("capacity is non-zero");
        Self {
            ticks,
            running: Mutex::new(BTreeMap::new()),
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn ticks(&self) -> &Arc<TickService> {
        &self.ticks
    }

    // ------------------------------------------------------------------------
    // creation / registration
    // ------------------------------------------------------------------------

    /// Create a new transaction bound to `vocbase`. If the current thread
    /// already has an ongoing transaction on its stack, the new transaction
    /// becomes a child of it (the vocbase must match).
    pub fn create_transaction(
        self: &Arc<Self>,
        vocbase: &Arc<Vocbase>,
    ) -> Result<Arc<Transaction>> {
        let parent = Self::thread_stack_top();

        let parent = match parent {
            Some(existing) if existing.is_ongoing() => {
                if !Arc::ptr_eq(existing.vocbase(), vocbase) {
                    return Err(DbError::Internal(
                        "cannot change database for sub transaction".into(),
                    ));
                }
                Some(existing)
            }
            _ => None,
        };

        let own = self.ticks.next();
        let id = match &parent {
            Some(parent) => TransactionId::new(own, parent.id().top()),
            None => TransactionId::top_level(own),
        };

        let transaction = Arc::new(Transaction::new(
            Arc::clone(self),
            id,
            Arc::clone(vocbase),
            parent,
        ));

        {
            let mut running = self.running.lock()?;
            running.insert(
                own,
                RunningEntry {
                    top: id.top(),
                    vocbase_id: vocbase.id(),
                    start_time: transaction.start_time(),
                    handle: Arc::downgrade(&transaction),
                },
            );
        }

        trace!("created transaction {}", id);
        Ok(transaction)
    }

    /// Create a standalone top-level transaction, ignoring the thread stack.
    pub fn create_top_level_transaction(
        self: &Arc<Self>,
        vocbase: &Arc<Vocbase>,
    ) -> Result<Arc<Transaction>> {
        let own = self.ticks.next();
        let id = TransactionId::top_level(own);
        let transaction = Arc::new(Transaction::new(
            Arc::clone(self),
            id,
            Arc::clone(vocbase),
            None,
        ));

        {
            let mut running = self.running.lock()?;
            running.insert(
                own,
                RunningEntry {
                    top: own,
                    vocbase_id: vocbase.id(),
                    start_time: transaction.start_time(),
                    handle: Arc::downgrade(&transaction),
                },
            );
        }

        trace!("created transaction {}", id);
        Ok(transaction)
    }

    /// Remove a finished transaction from the running set and record its
    /// terminal status for later visibility queries.
    pub fn unregister_transaction(&self, transaction: &Arc<Transaction>) {
        let status = transaction.status();
        debug_assert!(status.is_terminal());

        let own = transaction.id().own();
        {
            let mut running = self.running.lock().expect("running table poisoned");
            running.remove(&own);
        }
        {
            let mut recent = self.recent.lock().expect("status cache poisoned");
            recent.put(own, (transaction.id().top(), status));
        }
    }

    // ------------------------------------------------------------------------
    // status oracle
    // ------------------------------------------------------------------------

    /// Resolve an own-tick to its top id and status.
    pub fn resolve(&self, own: Tick) -> ResolvedStatus {
        {
            let running = self.running.lock().expect("running table poisoned");
            if let Some(entry) = running.get(&own) {
                return ResolvedStatus::Running { top: entry.top };
            }
        }
        {
            let mut recent = self.recent.lock().expect("status cache poisoned");
            if let Some((top, status)) = recent.get(&own) {
                return ResolvedStatus::Terminated {
                    top: *top,
                    status: *status,
                };
            }
        }
        ResolvedStatus::Unknown
    }

    /// The status of a transaction. Unknown ids below the minimum running id
    /// are reported committed (their markers must have been replayed);
    /// everything else unknown is treated as still in flight.
    pub fn status_transaction(&self, tid: TransactionId) -> TransactionStatus {
        match self.resolve(tid.own()) {
            ResolvedStatus::Running { .. } => TransactionStatus::Ongoing,
            ResolvedStatus::Terminated { status, .. } => status,
            ResolvedStatus::Unknown => {
                if self.below_minimum_running(tid.own()) {
                    TransactionStatus::Committed
                } else {
                    TransactionStatus::Ongoing
                }
            }
        }
    }

    /// Whether `own` is smaller than every running transaction's id.
    pub fn below_minimum_running(&self, own: Tick) -> bool {
        let running = self.running.lock().expect("running table poisoned");
        match running.keys().next() {
            Some(min) => own < *min,
            None => own <= self.ticks.current(),
        }
    }

    /// Capture the ids running right now plus the tick watermark. Taken by
    /// every transaction at begin.
    pub fn visibility_snapshot(&self) -> VisibilitySnapshot {
        let running = self.running.lock().expect("running table poisoned");
        VisibilitySnapshot {
            running: running.keys().copied().collect(),
            watermark: self.ticks.current() + 1,
        }
    }

    // ------------------------------------------------------------------------
    // administration
    // ------------------------------------------------------------------------

    /// Snapshot of running transactions for diagnostics.
    pub fn running_transactions(&self, vocbase_id: VocbaseId) -> Vec<TransactionInfo> {
        let running = self.running.lock().expect("running table poisoned");
        running
            .iter()
            .filter(|(_, entry)| entry.vocbase_id == vocbase_id)
            .map(|(own, entry)| TransactionInfo {
                id: TransactionId::new(*own, entry.top),
                start_time: entry.start_time,
            })
            .collect()
    }

    /// Flag a running transaction as killed; it will roll back at its next
    /// commit attempt.
    pub fn kill_transaction(&self, own: Tick) -> Result<()> {
        let running = self.running.lock()?;
        let entry = running
            .get(&own)
            .ok_or_else(|| DbError::TransactionInternal(format!("transaction {} not found", own)))?;
        if let Some(transaction) = entry.handle.upgrade() {
            transaction.set_killed();
            debug!("killed transaction {}", transaction.id());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // thread-local stack
    // ------------------------------------------------------------------------

    pub fn thread_stack_top() -> Option<Arc<Transaction>> {
        THREAD_TRANSACTIONS.with(|stack| stack.borrow().last().cloned())
    }

    pub fn push_on_thread_stack(transaction: &Arc<Transaction>) {
        THREAD_TRANSACTIONS.with(|stack| stack.borrow_mut().push(Arc::clone(transaction)));
        transaction.flags.set_pushed_on_thread_stack(true);
    }

    pub fn pop_from_thread_stack(transaction: &Arc<Transaction>) {
        THREAD_TRANSACTIONS.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, transaction) => {
                    stack.pop();
                }
                _ => {
                    warn!(
                        "popped transaction {} is not on top of the thread stack",
                        transaction.id()
                    );
                    stack.retain(|t| !Arc::ptr_eq(t, transaction));
                }
            }
        });
        transaction.flags.set_pushed_on_thread_stack(false);
    }
}

// ============================================================================
// Global instance
// ============================================================================

lazy_static! {
    static ref INSTANCE: RwLock<Option<Arc<LocalTransactionManager>>> = RwLock::new(None);
}

/// Install the process-wide transaction manager. Called once at startup.
pub fn initialize(ticks: Arc<TickService>, status_cache_capacity: usize) {
    let mut instance = INSTANCE.write().expect("manager cell poisoned");
    if instance.is_none() {
        *instance = Some(Arc::new(LocalTransactionManager::new(
            ticks,
            status_cache_capacity,
        )));
    }
}

/// Install the manager with a fresh tick service unless one is already
/// installed.
pub fn initialize_default(status_cache_capacity: usize) {
    initialize(Arc::new(TickService::new()), status_cache_capacity);
}

/// Tear down the process-wide transaction manager, in reverse of
/// `initialize`.
pub fn shutdown() {
    let mut instance = INSTANCE.write().expect("manager cell poisoned");
    *instance = None;
}

/// The process-wide transaction manager. Fails when called before
/// `initialize` or after `shutdown`.
pub fn instance() -> Result<Arc<LocalTransactionManager>> {
    let instance = INSTANCE.read()?;
    instance
        .clone()
        .ok_or_else(|| DbError::Internal("transaction manager is not initialized".into()))
}

// ============================================================================
// Distributed manager (placeholder)
// ============================================================================

/// Cluster-coordinated transactions are not part of this engine yet; the
/// type exists so callers can wire a manager kind without feature flags.
pub struct DistributedTransactionManager;

impl DistributedTransactionManager {
    pub fn new() -> Self {
        Self
    }

    pub fn create_transaction(&self, _vocbase: &Arc<Vocbase>) -> Result<Arc<Transaction>> {
        Err(DbError::Internal(
            "distributed transaction manager is not implemented".into(),
        ))
    }
}

impl Default for DistributedTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_unknown_old_id_is_committed() {
        let ticks = Arc::new(TickService::new());
        ticks.track(100);
        let manager = Arc::new(LocalTransactionManager::new(Arc::clone(&ticks), 16));

        // nothing is running, so a replayed id counts as committed
        assert_eq!(
            manager.status_transaction(TransactionId::top_level(50)),
            TransactionStatus::Committed
        );
        // an id that was never allocated stays in flight
        assert_eq!(
            manager.status_transaction(TransactionId::top_level(500)),
            TransactionStatus::Ongoing
        );
    }

    #[test]
    fn test_snapshot_watermark() {
        let ticks = Arc::new(TickService::new());
        ticks.track(7);
        let manager = Arc::new(LocalTransactionManager::new(ticks, 16));
        let snapshot = manager.visibility_snapshot();
        assert!(snapshot.committed_before_start(5));
        assert!(!snapshot.committed_before_start(8));
    }
}
