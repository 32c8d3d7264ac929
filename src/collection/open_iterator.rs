// ============================================================================
// Open Iterator
// ============================================================================
//
// Replays datafile markers when a collection is opened, reconstructing the
// primary index, the publication list and the per-datafile statistics. Data
// markers are buffered per transaction and applied when the commit marker
// arrives; an abort (or a missing end marker) drops them, which is what
// makes replay agree with the visibility rules of the live engine.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{DatafileId, DbError, Result, RevisionId, Tick, TickService};
use crate::index::Index;
use crate::wal::{EdgeRef, LogEntry, Marker};

use super::DocumentCollection;
use super::document::DocumentBody;

enum PendingOp {
    Insert {
        fid: DatafileId,
        tid_own: Tick,
        key: String,
        revision: RevisionId,
        shape: crate::shape::ShapeId,
        data: Vec<u8>,
        edge: Option<(EdgeRef, EdgeRef)>,
    },
    Remove {
        key: String,
    },
}

/// Summary handed back when replay finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenIteratorSummary {
    pub document_count: i64,
    pub document_size: i64,
    pub revision_id: RevisionId,
}

pub struct OpenIterator {
    collection: Arc<DocumentCollection>,
    ticks: Arc<TickService>,
    datafile_id: Option<DatafileId>,
    revision_id: RevisionId,
    document_count: i64,
    document_size: i64,
    pending: HashMap<Tick, Vec<PendingOp>>,
}

impl OpenIterator {
    pub fn new(collection: Arc<DocumentCollection>, ticks: Arc<TickService>) -> Self {
        Self {
            collection,
            ticks,
            datafile_id: None,
            revision_id: 0,
            document_count: 0,
            document_size: 0,
            pending: HashMap::new(),
        }
    }

    /// Process one marker from datafile `fid`, in file order.
    pub fn execute(&mut self, fid: DatafileId, entry: &LogEntry) -> Result<()> {
        self.ensure_datafile(fid);

        match &entry.marker {
            Marker::DocumentInsert {
                tid,
                key,
                revision,
                shape,
                body,
                ..
            }
            | Marker::MvccDocumentInsert {
                tid,
                key,
                revision,
                shape,
                body,
                ..
            } => {
                self.handle_insert(
                    fid,
                    entry.tick,
                    tid.own(),
                    key,
                    *revision,
                    *shape,
                    body.clone(),
                    None,
                )?;
            }
            Marker::EdgeInsert {
                tid,
                key,
                revision,
                shape,
                from,
                to,
                body,
                ..
            } => {
                self.handle_insert(
                    fid,
                    entry.tick,
                    tid.own(),
                    key,
                    *revision,
                    *shape,
                    body.clone(),
                    Some((from.clone(), to.clone())),
                )?;
            }
            Marker::MvccEdgeInsert {
                tid,
                key,
                revision,
                shape,
                edge_from,
                edge_to,
                body,
                ..
            } => {
                self.handle_insert(
                    fid,
                    entry.tick,
                    tid.own(),
                    key,
                    *revision,
                    *shape,
                    body.clone(),
                    Some((edge_from.clone(), edge_to.clone())),
                )?;
            }
            Marker::DocumentRemove {
                tid, key, revision, ..
            }
            | Marker::MvccDocumentRemove {
                tid, key, revision, ..
            } => {
                self.handle_remove(fid, tid.own(), key, *revision)?;
            }
            Marker::CommitTransaction { tid, .. }
            | Marker::CommitRemoteTransaction { tid, .. } => {
                self.apply_pending(tid.own())?;
            }
            Marker::AbortTransaction { tid, .. }
            | Marker::AbortRemoteTransaction { tid, .. } => {
                if self.pending.remove(&tid.own()).is_some() {
                    trace!("dropped pending markers of aborted transaction {}", tid);
                }
            }
            Marker::BeginTransaction { .. } | Marker::BeginRemoteTransaction { .. } => {}
            Marker::ShapeRegister { sid, signature, .. } => {
                self.collection.shaper().register_shape(signature, *sid)?;
                self.collection
                    .with_datafile_stats(fid, |stats| stats.add_shape(signature.len()));
            }
            Marker::AttributeRegister { path, .. } => {
                self.collection.shaper().register_attribute(path)?;
                self.collection
                    .with_datafile_stats(fid, |stats| stats.add_attribute(path.len()));
            }
            Marker::CreateIndex { .. } | Marker::DropIndex { .. } => {
                // index reconstruction runs from the persisted descriptors
            }
            Marker::DatafileHeader { .. }
            | Marker::DatafileFooter { .. }
            | Marker::CollectionHeader { .. } => {}
        }

        // tick accounting: every marker moves the datafile ticks, data
        // markers additionally move the data ticks, and everything except
        // structural markers moves the collection's global maximum
        let tick = entry.tick;
        self.ticks.track(tick);
        self.collection
            .with_datafile_stats(fid, |stats| stats.update_ticks(tick));
        if entry.marker.is_data_marker() {
            self.collection
                .with_datafile_stats(fid, |stats| stats.update_data_ticks(tick));
        }
        if !entry.marker.is_structural() {
            self.collection.update_tick_max(tick);
        }

        Ok(())
    }

    /// Flush the totals into the collection.
    pub fn finish(self) -> Result<OpenIteratorSummary> {
        if !self.pending.is_empty() {
            debug!(
                "dropping data markers of {} unfinished transactions at open",
                self.pending.len()
            );
        }
        self.collection
            .update_document_stats(self.document_count, self.document_size);
        self.collection.update_revision_id(self.revision_id);

        Ok(OpenIteratorSummary {
            document_count: self.document_count,
            document_size: self.document_size,
            revision_id: self.revision_id,
        })
    }

    // ------------------------------------------------------------------------
    // marker handling
    // ------------------------------------------------------------------------

    fn ensure_datafile(&mut self, fid: DatafileId) {
        if self.datafile_id != Some(fid) {
            self.collection.with_datafile_stats(fid, |_| ());
            self.datafile_id = Some(fid);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_insert(
        &mut self,
        fid: DatafileId,
        tick: Tick,
        tid_own: Tick,
        key: &str,
        revision: RevisionId,
        shape: crate::shape::ShapeId,
        data: Vec<u8>,
        edge: Option<(EdgeRef, EdgeRef)>,
    ) -> Result<()> {
        self.track_revision(revision);
        self.collection.key_generator().track(key);

        if tid_own == 0 {
            // non-transactional marker, applied immediately; its creator id
            // is the marker tick, which later resolves as committed
            self.apply_insert(fid, tick, key.to_string(), revision, shape, data, edge)
        } else {
            self.pending.entry(tid_own).or_default().push(PendingOp::Insert {
                fid,
                tid_own,
                key: key.to_string(),
                revision,
                shape,
                data,
                edge,
            });
            Ok(())
        }
    }

    fn handle_remove(
        &mut self,
        fid: DatafileId,
        tid_own: Tick,
        key: &str,
        revision: RevisionId,
    ) -> Result<()> {
        self.track_revision(revision);
        self.collection.key_generator().track(key);

        // the deletion counter counts remove markers, applied or not
        self.collection
            .with_datafile_stats(fid, |stats| stats.add_deletion());

        if tid_own == 0 {
            self.apply_remove(key)
        } else {
            self.pending
                .entry(tid_own)
                .or_default()
                .push(PendingOp::Remove {
                    key: key.to_string(),
                });
            Ok(())
        }
    }

    fn apply_pending(&mut self, tid_own: Tick) -> Result<()> {
        let Some(operations) = self.pending.remove(&tid_own) else {
            return Ok(());
        };
        for operation in operations {
            match operation {
                PendingOp::Insert {
                    fid,
                    tid_own,
                    key,
                    revision,
                    shape,
                    data,
                    edge,
                } => {
                    self.apply_insert(fid, tid_own, key, revision, shape, data, edge)?;
                }
                PendingOp::Remove { key } => {
                    self.apply_remove(&key)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_insert(
        &mut self,
        fid: DatafileId,
        from: Tick,
        key: String,
        revision: RevisionId,
        shape: crate::shape::ShapeId,
        data: Vec<u8>,
        edge: Option<(EdgeRef, EdgeRef)>,
    ) -> Result<()> {
        let primary = self.collection.primary_index();
        let Index::Primary(primary) = &*primary else {
            return Err(DbError::Internal("no primary index found".into()));
        };
        let manager = self.collection.masterpointer_manager();
        let size = data.len();

        if let Some(existing_slot) = primary.lookup_replay(&key)? {
            let existing = manager.handle(existing_slot);
            let existing_body = existing
                .body()
                .ok_or_else(|| DbError::Internal("replayed master pointer without body".into()))?;

            let supersedes = existing_body.revision < revision
                || (existing_body.revision == revision && existing_body.fid <= fid);

            if !supersedes {
                // outdated marker, dead on arrival in its own datafile
                self.collection
                    .with_datafile_stats(fid, |stats| stats.add_dead(size));
                return Ok(());
            }

            // replace the older version
            primary.remove_replay(&key)?;
            manager.unlink(existing_slot);
            self.document_count -= 1;
            self.document_size -= existing_body.byte_size() as i64;
            self.collection.with_datafile_stats(existing_body.fid, |stats| {
                stats.mark_dead(existing_body.byte_size())
            });
        }

        let body = Arc::new(DocumentBody::from_parts(
            key.clone(),
            revision,
            shape,
            data,
            edge,
            fid,
        ));
        let mut container = manager.create(body, from)?;
        primary.insert_replay(&key, container.handle().index())?;
        container.link()?;

        self.document_count += 1;
        self.document_size += size as i64;
        self.collection
            .with_datafile_stats(fid, |stats| stats.add_alive(size));
        Ok(())
    }

    fn apply_remove(&mut self, key: &str) -> Result<()> {
        let primary = self.collection.primary_index();
        let Index::Primary(primary) = &*primary else {
            return Err(DbError::Internal("no primary index found".into()));
        };
        let manager = self.collection.masterpointer_manager();

        if let Some(slot) = primary.remove_replay(key)? {
            let handle = manager.handle(slot);
            if let Some(body) = handle.body() {
                self.document_count -= 1;
                self.document_size -= body.byte_size() as i64;
                self.collection
                    .with_datafile_stats(body.fid, |stats| stats.mark_dead(body.byte_size()));
            }
            manager.unlink(slot);
        }
        Ok(())
    }

    fn track_revision(&mut self, revision: RevisionId) {
        if revision > self.revision_id {
            self.revision_id = revision;
        }
    }
}
