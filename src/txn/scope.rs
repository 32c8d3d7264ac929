// ============================================================================
// Transaction Scope
// ============================================================================

use log::warn;
use std::sync::Arc;

use crate::core::{DbError, Result};
use crate::vocbase::Vocbase;

use super::collection::AccessType;
use super::manager::{self, LocalTransactionManager};
use super::transaction::{Transaction, TransactionHints};

/// Scoped transaction acquisition: starts a transaction (or joins the one on
/// the thread stack), rolls it back on drop unless it was committed through
/// `commit()`, and pops it off the stack again.
pub struct TransactionScope {
    transaction: Arc<Transaction>,
    is_our: bool,
    pushed: bool,
}

impl TransactionScope {
    /// Start or join a transaction on `vocbase`.
    ///
    /// * `force_new` always creates a fresh transaction (a child when the
    ///   thread stack is non-empty) instead of joining.
    /// * `allow_sub` controls participation in the thread stack: without it,
    ///   the scope runs a standalone transaction invisible to nested scopes.
    pub fn new(
        vocbase: &Arc<Vocbase>,
        collections: &[(&str, AccessType)],
        hints: TransactionHints,
        force_new: bool,
        allow_sub: bool,
    ) -> Result<Self> {
        let manager = manager::instance()?;

        if allow_sub && !force_new {
            if let Some(existing) = LocalTransactionManager::thread_stack_top() {
                if existing.is_ongoing() {
                    // reuse the transaction from the outer scope
                    if !Arc::ptr_eq(existing.vocbase(), vocbase) {
                        return Err(DbError::TransactionInternal(
                            "cannot change database for nested transaction".into(),
                        ));
                    }
                    for (name, access) in collections {
                        existing.collection_for_scope(name, *access)?;
                    }
                    return Ok(Self {
                        transaction: existing,
                        is_our: false,
                        pushed: false,
                    });
                }
            }
        }

        let transaction = if allow_sub {
            manager.create_transaction(vocbase)?
        } else {
            manager.create_top_level_transaction(vocbase)?
        };

        let pushed = allow_sub;
        if pushed {
            LocalTransactionManager::push_on_thread_stack(&transaction);
        }

        if let Err(e) = transaction.begin(hints, collections) {
            if pushed {
                LocalTransactionManager::pop_from_thread_stack(&transaction);
            }
            if let Err(inner) = transaction.rollback() {
                warn!(
                    "rollback after failed begin of {} failed too: {}",
                    transaction.id(),
                    inner
                );
            }
            return Err(e);
        }

        Ok(Self {
            transaction,
            is_our: true,
            pushed,
        })
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Whether this scope owns its transaction (as opposed to having joined
    /// an outer scope's).
    pub fn is_our(&self) -> bool {
        self.is_our
    }

    /// Commit the scoped transaction. A no-op when the transaction belongs
    /// to an outer scope; the outermost owner decides then.
    pub fn commit(&mut self) -> Result<()> {
        if self.is_our {
            self.transaction.commit()?;
        }
        Ok(())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.is_our {
            if self.pushed {
                LocalTransactionManager::pop_from_thread_stack(&self.transaction);
            }
            if self.transaction.is_ongoing() || !self.transaction.status().is_terminal() {
                if let Err(e) = self.transaction.rollback() {
                    warn!(
                        "automatic rollback of {} failed: {}",
                        self.transaction.id(),
                        e
                    );
                }
            }
        }
    }
}
