// ============================================================================
// RustDocDB Library
// ============================================================================
//
// An embeddable document-store storage engine: schema-flexible JSON
// documents in collections, MVCC transactions with snapshot-style read
// visibility, secondary indexes (hash, skiplist, geo, fulltext, edge, cap
// constraint) and a write-ahead log.

pub mod collection;
pub mod core;
pub mod index;
pub mod mptr;
pub mod shape;
pub mod txn;
pub mod vocbase;
pub mod wal;

// Re-export main types for convenience
pub use collection::{
    CollectionType, DocumentCollection, DocumentDescriptor, KeyGenerator, OpenIterator,
    all_documents, insert_document, insert_edge, read_document, remove_document, update_document,
};
pub use core::{DbError, DurabilityMode, EngineConfig, Result, Tick, TickService};
pub use index::{
    EdgeDirection, FulltextQuery, FulltextTerm, Index, SkiplistOperator, TermOperation,
};
pub use txn::{
    AccessType, Hint, Transaction, TransactionHints, TransactionId, TransactionScope,
    TransactionStatus, Visibility,
};
pub use vocbase::Vocbase;
pub use wal::{EdgeRef, LogEntry, Marker, WalManager};
