// ============================================================================
// WAL Marker Types
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::core::{CollectionId, DatafileId, IndexId, RevisionId, Tick, VocbaseId};
use crate::shape::ShapeId;
use crate::txn::TransactionId;

/// Reference to a vertex document, used by edge markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub cid: CollectionId,
    pub key: String,
}

/// Everything the engine appends to or replays from the log.
///
/// The transactional and data kinds are what the transaction subsystem
/// emits; the structural kinds (datafile header/footer, collection header)
/// only occur in datafiles and are discriminated by the open iterator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Marker {
    BeginTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
    },
    BeginRemoteTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
        external_tid: TransactionId,
    },
    CommitTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
    },
    CommitRemoteTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
        external_tid: TransactionId,
    },
    AbortTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
    },
    AbortRemoteTransaction {
        vocbase_id: VocbaseId,
        tid: TransactionId,
        external_tid: TransactionId,
    },

    DocumentInsert {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        body: Vec<u8>,
    },
    EdgeInsert {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        from: EdgeRef,
        to: EdgeRef,
        body: Vec<u8>,
    },
    DocumentRemove {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        key: String,
        revision: RevisionId,
    },

    // variants with explicit version interval, written by the MVCC paths
    MvccDocumentInsert {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        from: TransactionId,
        to: TransactionId,
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        body: Vec<u8>,
    },
    MvccEdgeInsert {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        from: TransactionId,
        to: TransactionId,
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        edge_from: EdgeRef,
        edge_to: EdgeRef,
        body: Vec<u8>,
    },
    MvccDocumentRemove {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        tid: TransactionId,
        from: TransactionId,
        to: TransactionId,
        key: String,
        revision: RevisionId,
    },

    ShapeRegister {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        sid: ShapeId,
        signature: String,
    },
    AttributeRegister {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        path: String,
    },

    CreateIndex {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        iid: IndexId,
        description: serde_json::Value,
    },
    DropIndex {
        vocbase_id: VocbaseId,
        cid: CollectionId,
        iid: IndexId,
    },

    DatafileHeader {
        fid: DatafileId,
    },
    DatafileFooter {
        fid: DatafileId,
    },
    CollectionHeader {
        cid: CollectionId,
    },
}

impl Marker {
    pub fn type_name(&self) -> &'static str {
        match self {
            Marker::BeginTransaction { .. } => "begin-transaction",
            Marker::BeginRemoteTransaction { .. } => "begin-remote-transaction",
            Marker::CommitTransaction { .. } => "commit-transaction",
            Marker::CommitRemoteTransaction { .. } => "commit-remote-transaction",
            Marker::AbortTransaction { .. } => "abort-transaction",
            Marker::AbortRemoteTransaction { .. } => "abort-remote-transaction",
            Marker::DocumentInsert { .. } => "document-insert",
            Marker::EdgeInsert { .. } => "edge-insert",
            Marker::DocumentRemove { .. } => "document-remove",
            Marker::MvccDocumentInsert { .. } => "mvcc-document-insert",
            Marker::MvccEdgeInsert { .. } => "mvcc-edge-insert",
            Marker::MvccDocumentRemove { .. } => "mvcc-document-remove",
            Marker::ShapeRegister { .. } => "shape-register",
            Marker::AttributeRegister { .. } => "attribute-register",
            Marker::CreateIndex { .. } => "create-index",
            Marker::DropIndex { .. } => "drop-index",
            Marker::DatafileHeader { .. } => "datafile-header",
            Marker::DatafileFooter { .. } => "datafile-footer",
            Marker::CollectionHeader { .. } => "collection-header",
        }
    }

    /// Document/edge/remove markers, the ones that move data ticks.
    pub fn is_data_marker(&self) -> bool {
        matches!(
            self,
            Marker::DocumentInsert { .. }
                | Marker::EdgeInsert { .. }
                | Marker::DocumentRemove { .. }
                | Marker::MvccDocumentInsert { .. }
                | Marker::MvccEdgeInsert { .. }
                | Marker::MvccDocumentRemove { .. }
        )
    }

    /// Structural markers are skipped for the collection's tick accounting.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Marker::DatafileHeader { .. }
                | Marker::DatafileFooter { .. }
                | Marker::CollectionHeader { .. }
        )
    }

    /// The transaction a data or transaction marker belongs to.
    pub fn tid(&self) -> Option<TransactionId> {
        match self {
            Marker::BeginTransaction { tid, .. }
            | Marker::BeginRemoteTransaction { tid, .. }
            | Marker::CommitTransaction { tid, .. }
            | Marker::CommitRemoteTransaction { tid, .. }
            | Marker::AbortTransaction { tid, .. }
            | Marker::AbortRemoteTransaction { tid, .. }
            | Marker::DocumentInsert { tid, .. }
            | Marker::EdgeInsert { tid, .. }
            | Marker::DocumentRemove { tid, .. }
            | Marker::MvccDocumentInsert { tid, .. }
            | Marker::MvccEdgeInsert { tid, .. }
            | Marker::MvccDocumentRemove { tid, .. } => Some(*tid),
            _ => None,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(
            self,
            Marker::CommitTransaction { .. } | Marker::CommitRemoteTransaction { .. }
        )
    }
}

/// A marker together with the tick the log assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub tick: Tick,
    pub marker: Marker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_classification() {
        let tid = TransactionId::top_level(5);
        let begin = Marker::BeginTransaction {
            vocbase_id: VocbaseId(1),
            tid,
        };
        assert!(!begin.is_data_marker());
        assert!(!begin.is_structural());
        assert_eq!(begin.tid(), Some(tid));

        let remove = Marker::DocumentRemove {
            vocbase_id: VocbaseId(1),
            cid: CollectionId(2),
            tid,
            key: "k".into(),
            revision: 9,
        };
        assert!(remove.is_data_marker());

        let header = Marker::DatafileHeader { fid: DatafileId(3) };
        assert!(header.is_structural());
        assert_eq!(header.tid(), None);
    }
}
