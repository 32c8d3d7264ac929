pub mod collection;
pub mod id;
pub mod manager;
pub mod scope;
pub mod transaction;

pub use collection::{AccessType, TransactionCollection};
pub use id::TransactionId;
pub use manager::{
    DistributedTransactionManager, LocalTransactionManager, ResolvedStatus, initialize,
    initialize_default, instance, shutdown,
};
pub use scope::TransactionScope;
pub use transaction::{
    CollectionStats, Hint, Operation, Transaction, TransactionHints, TransactionInfo,
    TransactionStatus, Visibility, VisibilitySnapshot,
};
