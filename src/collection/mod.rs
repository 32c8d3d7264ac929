// ============================================================================
// Document Collection
// ============================================================================

pub mod datafile;
pub mod document;
pub mod open_iterator;
pub mod operations;

pub use datafile::DatafileStatistics;
pub use document::{DocumentBody, KeyGenerator, validate_key};
pub use open_iterator::{OpenIterator, OpenIteratorSummary};
pub use operations::{DocumentDescriptor, all_documents, insert_document, insert_edge,
    read_document, remove_document, update_document};

use log::{debug, info};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::thread;

use crate::core::{
    CollectionId, DatafileId, DbError, IndexId, Result, RevisionId, Tick, TimedRwLock, VocbaseId,
};
use crate::index::{EdgeIndex, Index, PrimaryIndex};
use crate::mptr::MasterpointerManager;
use crate::shape::Shaper;

/// Whether the collection stores plain documents or edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Documents,
    Edges,
}

#[derive(Debug, Default)]
struct CollectionCounters {
    document_count: i64,
    document_size: i64,
}

/// The aggregate owning a collection's indexes, master-pointer manager,
/// shape state, datafile statistics and counters.
pub struct DocumentCollection {
    id: CollectionId,
    vocbase_id: VocbaseId,
    name: RwLock<String>,
    collection_type: CollectionType,
    shaper: Shaper,
    mptr: Arc<MasterpointerManager>,
    key_generator: KeyGenerator,
    indexes: RwLock<Vec<Arc<Index>>>,
    collection_lock: TimedRwLock,
    compaction_lock: TimedRwLock,
    counters: RwLock<CollectionCounters>,
    revision_id: AtomicU64,
    tick_max: AtomicU64,
    datafile_stats: Mutex<BTreeMap<DatafileId, DatafileStatistics>>,
    wait_for_sync: AtomicBool,
    directory: Option<PathBuf>,
}

impl DocumentCollection {
    pub fn new(
        id: CollectionId,
        vocbase_id: VocbaseId,
        name: String,
        collection_type: CollectionType,
        key_generator: KeyGenerator,
        primary_index_id: IndexId,
        edge_index_id: Option<IndexId>,
        directory: Option<PathBuf>,
    ) -> Result<Self> {
        let mut indexes: Vec<Arc<Index>> =
            vec![Arc::new(Index::Primary(PrimaryIndex::new(primary_index_id)))];
        if collection_type == CollectionType::Edges {
            let edge_id = edge_index_id.ok_or_else(|| {
                DbError::Internal("edge collection needs an edge index id".into())
            })?;
            indexes.push(Arc::new(Index::Edge(EdgeIndex::new(edge_id))));
        }

        if let Some(directory) = &directory {
            fs::create_dir_all(directory)
                .map_err(|e| DbError::IoError(format!("cannot create collection directory: {}", e)))?;
        }

        Ok(Self {
            id,
            vocbase_id,
            name: RwLock::new(name),
            collection_type,
            shaper: Shaper::new(),
            mptr: Arc::new(MasterpointerManager::new()),
            key_generator,
            indexes: RwLock::new(indexes),
            collection_lock: TimedRwLock::new(),
            compaction_lock: TimedRwLock::new(),
            counters: RwLock::new(CollectionCounters::default()),
            revision_id: AtomicU64::new(0),
            tick_max: AtomicU64::new(0),
            datafile_stats: Mutex::new(BTreeMap::new()),
            wait_for_sync: AtomicBool::new(false),
            directory,
        })
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn vocbase_id(&self) -> VocbaseId {
        self.vocbase_id
    }

    pub fn name(&self) -> String {
        self.name.read().expect("name poisoned").clone()
    }

    pub fn rename(&self, name: String) {
        *self.name.write().expect("name poisoned") = name;
    }

    pub fn collection_type(&self) -> CollectionType {
        self.collection_type
    }

    pub fn is_edge_collection(&self) -> bool {
        self.collection_type == CollectionType::Edges
    }

    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    pub fn masterpointer_manager(&self) -> &Arc<MasterpointerManager> {
        &self.mptr
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.key_generator
    }

    pub fn collection_lock(&self) -> &TimedRwLock {
        &self.collection_lock
    }

    pub fn compaction_lock(&self) -> &TimedRwLock {
        &self.compaction_lock
    }

    pub fn wait_for_sync(&self) -> bool {
        self.wait_for_sync.load(Ordering::SeqCst)
    }

    pub fn set_wait_for_sync(&self, value: bool) {
        self.wait_for_sync.store(value, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // index management
    // ------------------------------------------------------------------------

    /// Snapshot of the index list.
    pub fn indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.read().expect("index list poisoned").clone()
    }

    /// Run `f` while holding the index list read lock.
    pub fn with_indexes<T>(&self, f: impl FnOnce(&[Arc<Index>]) -> Result<T>) -> Result<T> {
        let indexes = self.indexes.read()?;
        f(&indexes)
    }

    pub fn primary_index(&self) -> Arc<Index> {
        let indexes = self.indexes.read().expect("index list poisoned");
        // the primary index always exists at position 0
        Arc::clone(&indexes[0])
    }

    pub fn lookup_index(&self, iid: IndexId) -> Option<Arc<Index>> {
        let indexes = self.indexes.read().expect("index list poisoned");
        indexes.iter().find(|index| index.id() == iid).cloned()
    }

    pub fn cap_constraint(&self) -> Option<Arc<Index>> {
        let indexes = self.indexes.read().expect("index list poisoned");
        indexes
            .last()
            .filter(|index| matches!(***index, Index::Cap(_)))
            .cloned()
    }

    /// Add an index, preserving the ordering invariant: primary first, edge
    /// second (edge collections), cap constraint last.
    pub fn add_index(&self, index: Arc<Index>) -> Result<()> {
        let mut indexes = self.indexes.write()?;
        if matches!(*index, Index::Cap(_)) {
            if indexes.iter().any(|i| matches!(**i, Index::Cap(_))) {
                return Err(DbError::Internal(
                    "collection already has a cap constraint".into(),
                ));
            }
            indexes.push(index);
            return Ok(());
        }
        // insert before a trailing cap constraint
        let position = indexes
            .iter()
            .position(|i| matches!(**i, Index::Cap(_)))
            .unwrap_or(indexes.len());
        indexes.insert(position, index);
        Ok(())
    }

    /// Detach an index from the collection. Primary and edge indexes cannot
    /// be dropped.
    pub fn unlink_index(&self, iid: IndexId) -> Result<Arc<Index>> {
        let mut indexes = self.indexes.write()?;
        let position = indexes
            .iter()
            .position(|index| index.id() == iid)
            .ok_or_else(|| DbError::Internal(format!("index {} not found", iid)))?;
        if matches!(*indexes[position], Index::Primary(_) | Index::Edge(_)) {
            return Err(DbError::Internal(
                "cannot drop primary or edge index".into(),
            ));
        }
        Ok(indexes.remove(position))
    }

    /// Insert every record of the primary index into `index`.
    pub fn fill_index(&self, index: &Index) -> Result<()> {
        let primary = self.primary_index();
        let Index::Primary(primary) = &*primary else {
            return Err(DbError::Internal("no primary index found".into()));
        };
        for slot in primary.all_slots() {
            let handle = self.mptr.handle(slot);
            index.fill_slot(&self.shaper, &handle)?;
        }
        Ok(())
    }

    /// Fill several indexes in parallel, one worker per index, with a shared
    /// barrier so all workers start on a consistent primary snapshot. The
    /// first error wins.
    pub fn fill_indexes_parallel(&self, indexes: &[Arc<Index>]) -> Result<()> {
        if indexes.is_empty() {
            return Ok(());
        }
        if indexes.len() == 1 {
            return self.fill_index(&indexes[0]);
        }

        let primary = self.primary_index();
        let Index::Primary(primary) = &*primary else {
            return Err(DbError::Internal("no primary index found".into()));
        };
        let slots = Arc::new(primary.all_slots());

        let barrier = Arc::new(Barrier::new(indexes.len()));
        let first_error: Arc<Mutex<Option<DbError>>> = Arc::new(Mutex::new(None));

        thread::scope(|scope| {
            for index in indexes {
                let barrier = Arc::clone(&barrier);
                let first_error = Arc::clone(&first_error);
                let slots = Arc::clone(&slots);
                let index = Arc::clone(index);
                scope.spawn(move || {
                    barrier.wait();
                    for slot in slots.iter() {
                        let handle = self.mptr.handle(*slot);
                        if let Err(e) = index.fill_slot(&self.shaper, &handle) {
                            let mut first = first_error.lock().expect("fill error poisoned");
                            if first.is_none() {
                                *first = Some(e);
                            }
                            return;
                        }
                    }
                });
            }
        });

        let mut first = first_error.lock()?;
        match first.take() {
            Some(e) => Err(e),
            None => {
                info!(
                    "filled {} indexes of collection '{}'",
                    indexes.len(),
                    self.name()
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // descriptor persistence
    // ------------------------------------------------------------------------

    /// The collection's persisted parameters (its identity across restarts).
    pub fn parameters_json(&self) -> Value {
        let indexes = self.indexes.read().expect("index list poisoned");
        let edge_index_id = indexes
            .iter()
            .find(|index| matches!(***index, Index::Edge(_)))
            .map(|index| index.id().0);
        serde_json::json!({
            "id": self.id.0.to_string(),
            "name": self.name(),
            "type": match self.collection_type {
                CollectionType::Documents => "document",
                CollectionType::Edges => "edge",
            },
            "keyOptions": self.key_generator.to_json(),
            "primaryIndexId": indexes[0].id().0,
            "edgeIndexId": edge_index_id,
            "waitForSync": self.wait_for_sync(),
        })
    }

    /// Persist parameter.json beside the collection (atomic
    /// write-then-rename).
    pub fn save_parameters(&self) -> Result<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let path = directory.join("parameter.json");
        let mut file = tempfile::NamedTempFile::new_in(directory)
            .map_err(|e| DbError::IoError(format!("cannot create parameter file: {}", e)))?;
        serde_json::to_writer_pretty(&mut file, &self.parameters_json())?;
        file.flush()
            .map_err(|e| DbError::IoError(format!("cannot flush parameter file: {}", e)))?;
        file.persist(&path)
            .map_err(|e| DbError::IoError(format!("cannot persist parameter file: {}", e)))?;
        Ok(())
    }

    /// Persist the JSON descriptors of all secondary indexes beside the
    /// collection (atomic write-then-rename).
    pub fn save_index_descriptors(&self) -> Result<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let descriptors: Vec<Value> = self
            .indexes()
            .iter()
            .filter(|index| !matches!(***index, Index::Primary(_) | Index::Edge(_)))
            .map(|index| index.to_json())
            .collect();

        let path = directory.join("indexes.json");
        let mut file = tempfile::NamedTempFile::new_in(directory)
            .map_err(|e| DbError::IoError(format!("cannot create descriptor file: {}", e)))?;
        serde_json::to_writer_pretty(&mut file, &descriptors)?;
        file.flush()
            .map_err(|e| DbError::IoError(format!("cannot flush descriptor file: {}", e)))?;
        file.persist(&path)
            .map_err(|e| DbError::IoError(format!("cannot persist descriptor file: {}", e)))?;
        debug!("persisted {} index descriptors for '{}'", descriptors.len(), self.name());
        Ok(())
    }

    /// Load the persisted index descriptors, if any.
    pub fn load_index_descriptors(&self) -> Result<Vec<Value>> {
        let Some(directory) = &self.directory else {
            return Ok(Vec::new());
        };
        let path = directory.join("indexes.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)
            .map_err(|e| DbError::IoError(format!("cannot read descriptor file: {}", e)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    // ------------------------------------------------------------------------
    // statistics
    // ------------------------------------------------------------------------

    pub fn document_count(&self) -> i64 {
        self.counters.read().expect("counters poisoned").document_count
    }

    pub fn document_size(&self) -> i64 {
        self.counters.read().expect("counters poisoned").document_size
    }

    pub fn update_document_stats(&self, count_delta: i64, size_delta: i64) {
        let mut counters = self.counters.write().expect("counters poisoned");
        counters.document_count += count_delta;
        counters.document_size += size_delta;
    }

    pub fn revision_id(&self) -> RevisionId {
        self.revision_id.load(Ordering::SeqCst)
    }

    pub fn update_revision_id(&self, revision: RevisionId) {
        self.revision_id.fetch_max(revision, Ordering::SeqCst);
    }

    pub fn tick_max(&self) -> Tick {
        self.tick_max.load(Ordering::SeqCst)
    }

    pub fn update_tick_max(&self, tick: Tick) {
        self.tick_max.fetch_max(tick, Ordering::SeqCst);
    }

    /// Run `f` on the statistics record of `fid`, creating it if needed.
    pub fn with_datafile_stats<T>(
        &self,
        fid: DatafileId,
        f: impl FnOnce(&mut DatafileStatistics) -> T,
    ) -> T {
        let mut stats = self.datafile_stats.lock().expect("datafile stats poisoned");
        let entry = stats.entry(fid).or_default();
        f(entry)
    }

    pub fn datafile_statistics(&self, fid: DatafileId) -> Option<DatafileStatistics> {
        let stats = self.datafile_stats.lock().expect("datafile stats poisoned");
        stats.get(&fid).copied()
    }

    pub fn all_datafile_statistics(&self) -> BTreeMap<DatafileId, DatafileStatistics> {
        self.datafile_stats
            .lock()
            .expect("datafile stats poisoned")
            .clone()
    }

    /// Total memory used by the collection's indexes.
    pub fn index_memory(&self) -> usize {
        self.indexes().iter().map(|index| index.memory()).sum()
    }
}

impl std::fmt::Debug for DocumentCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCollection")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("type", &self.collection_type)
            .finish()
    }
}
