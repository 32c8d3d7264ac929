// ============================================================================
// Vocbase
// ============================================================================
//
// A vocbase is one logical database: it owns the collections, resolves
// names to ids, and carries the WAL and configuration the transaction
// machinery works against.

use log::{debug, info};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::collection::{CollectionType, DocumentCollection, KeyGenerator, OpenIterator,
    OpenIteratorSummary};
use crate::core::{CollectionId, DatafileId, DbError, EngineConfig, DurabilityMode, IndexId,
    Result, TickService, VocbaseId};
use crate::index::{Index, index_from_json};
use crate::txn;
use crate::wal::{Marker, WalManager};

const MAX_COLLECTION_NAME_LENGTH: usize = 64;

/// Collection names start with a letter and continue with letters, digits,
/// dashes or underscores. Leading underscores are reserved for system
/// collections.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(DbError::IllegalName(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("name is non-empty");
    if !first.is_ascii_alphabetic() {
        return Err(DbError::IllegalName(format!(
            "collection name '{}' must start with a letter",
            name
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(DbError::IllegalName(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    Ok(())
}

pub struct Vocbase {
    id: VocbaseId,
    name: String,
    config: EngineConfig,
    ticks: Arc<TickService>,
    wal: Arc<WalManager>,
    collections: RwLock<HashMap<CollectionId, Arc<DocumentCollection>>>,
    names: RwLock<HashMap<String, CollectionId>>,
    directory: Option<PathBuf>,
}

impl Vocbase {
    /// Create a vocbase. Without a directory the WAL is disabled (the
    /// durability mode is forced to None).
    pub fn new(name: &str, mut config: EngineConfig, directory: Option<PathBuf>) -> Result<Arc<Self>> {
        txn::initialize_default(config.status_cache_capacity);
        let manager = txn::instance()?;
        let ticks = Arc::clone(manager.ticks());

        let wal_path = match &directory {
            Some(directory) => directory.join("wal"),
            None => {
                if config.durability != DurabilityMode::None {
                    debug!("vocbase '{}' has no directory, disabling the WAL", name);
                    config.durability = DurabilityMode::None;
                }
                PathBuf::from(format!("{}.wal", name))
            }
        };
        let wal = Arc::new(WalManager::new(
            wal_path,
            config.durability,
            Arc::clone(&ticks),
        )?);

        let id = VocbaseId(ticks.next());
        info!("created vocbase '{}' ({})", name, id);

        let vocbase = Arc::new(Self {
            id,
            name: name.to_string(),
            config,
            ticks,
            wal,
            collections: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            directory,
        });
        vocbase.load_existing_collections()?;
        Ok(vocbase)
    }

    /// Register collections found on disk (their parameter files carry the
    /// identity markers replayed from the WAL refer to). The caller opens
    /// them afterwards via `open_collection`.
    fn load_existing_collections(&self) -> Result<()> {
        let Some(base) = &self.directory else {
            return Ok(());
        };
        if !base.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(base)
            .map_err(|e| DbError::IoError(format!("cannot scan vocbase directory: {}", e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let parameter_path = path.join("parameter.json");
            if !parameter_path.is_file() {
                continue;
            }
            let data = std::fs::read(&parameter_path)
                .map_err(|e| DbError::IoError(format!("cannot read parameter file: {}", e)))?;
            let parameters: Value = serde_json::from_slice(&data)?;

            let cid = parameters
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u64>().ok())
                .map(CollectionId)
                .ok_or_else(|| DbError::Internal("parameter file has no id".into()))?;
            let name = parameters
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::Internal("parameter file has no name".into()))?
                .to_string();
            let collection_type = match parameters.get("type").and_then(Value::as_str) {
                Some("edge") => CollectionType::Edges,
                _ => CollectionType::Documents,
            };
            let key_generator = match parameters.get("keyOptions") {
                Some(options) => KeyGenerator::from_json(options)?,
                None => KeyGenerator::traditional(),
            };
            let primary_index_id = IndexId(
                parameters
                    .get("primaryIndexId")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(|| self.ticks.next()),
            );
            let edge_index_id = parameters
                .get("edgeIndexId")
                .and_then(Value::as_u64)
                .map(IndexId);

            // ids handed out before the shutdown must stay unique
            self.ticks.track(cid.0);
            self.ticks.track(primary_index_id.0);
            if let Some(edge_id) = edge_index_id {
                self.ticks.track(edge_id.0);
            }

            let collection = Arc::new(DocumentCollection::new(
                cid,
                self.id,
                name.clone(),
                collection_type,
                key_generator,
                primary_index_id,
                edge_index_id,
                Some(path),
            )?);
            if parameters
                .get("waitForSync")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                collection.set_wait_for_sync(true);
            }

            let mut collections = self.collections.write()?;
            let mut names = self.names.write()?;
            collections.insert(cid, collection);
            names.insert(name.clone(), cid);
            debug!("registered existing collection '{}' ({})", name, cid);
        }
        Ok(())
    }

    pub fn id(&self) -> VocbaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ticks(&self) -> &Arc<TickService> {
        &self.ticks
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    // ------------------------------------------------------------------------
    // collection lifecycle
    // ------------------------------------------------------------------------

    pub fn create_collection(
        self: &Arc<Self>,
        name: &str,
        collection_type: CollectionType,
        key_generator_options: Option<&Value>,
    ) -> Result<Arc<DocumentCollection>> {
        validate_collection_name(name)?;

        {
            let names = self.names.read()?;
            if names.contains_key(name) {
                return Err(DbError::IllegalName(format!(
                    "collection '{}' already exists",
                    name
                )));
            }
        }

        let key_generator = match key_generator_options {
            Some(options) => KeyGenerator::from_json(options)?,
            None => KeyGenerator::traditional(),
        };

        let cid = CollectionId(self.ticks.next());
        let primary_index_id = IndexId(self.ticks.next());
        let edge_index_id = if collection_type == CollectionType::Edges {
            Some(IndexId(self.ticks.next()))
        } else {
            None
        };
        let collection_directory = self
            .directory
            .as_ref()
            .map(|base| base.join(format!("collection-{}", cid.0)));

        let collection = Arc::new(DocumentCollection::new(
            cid,
            self.id,
            name.to_string(),
            collection_type,
            key_generator,
            primary_index_id,
            edge_index_id,
            collection_directory,
        )?);

        collection.save_parameters()?;
        self.wal
            .append(Marker::CollectionHeader { cid }, false)?;

        {
            let mut collections = self.collections.write()?;
            let mut names = self.names.write()?;
            collections.insert(cid, Arc::clone(&collection));
            names.insert(name.to_string(), cid);
        }

        info!("created collection '{}' ({})", name, cid);
        Ok(collection)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write()?;
        let mut names = self.names.write()?;
        let cid = names
            .remove(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        collections.remove(&cid);
        info!("dropped collection '{}' ({})", name, cid);
        Ok(())
    }

    pub fn collection_by_name(&self, name: &str) -> Option<Arc<DocumentCollection>> {
        let names = self.names.read().ok()?;
        let cid = names.get(name)?;
        let collections = self.collections.read().ok()?;
        collections.get(cid).cloned()
    }

    pub fn collection_by_id(&self, cid: CollectionId) -> Option<Arc<DocumentCollection>> {
        let collections = self.collections.read().ok()?;
        collections.get(&cid).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.names
            .read()
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // index lifecycle
    // ------------------------------------------------------------------------

    /// Create a secondary index on `collection_name` from a JSON descriptor.
    /// A missing id is assigned; the descriptor is persisted beside the
    /// collection, a CreateIndex marker is written and the index is filled
    /// from the primary.
    pub fn create_index(
        self: &Arc<Self>,
        collection_name: &str,
        descriptor: &Value,
    ) -> Result<Arc<Index>> {
        let collection = self
            .collection_by_name(collection_name)
            .ok_or_else(|| DbError::CollectionNotFound(collection_name.to_string()))?;

        if !descriptor.is_object() {
            return Err(DbError::Internal("index descriptor must be an object".into()));
        }
        let mut descriptor = descriptor.clone();
        if descriptor.get("id").is_none() {
            descriptor["id"] = Value::String(self.ticks.next().to_string());
        }

        let index = Arc::new(index_from_json(&descriptor)?);
        let iid = index.id();

        collection.add_index(Arc::clone(&index))?;
        if let Err(e) = collection.fill_index(&index) {
            let _ = collection.unlink_index(iid);
            return Err(e);
        }

        collection.save_index_descriptors()?;
        self.wal.append(
            Marker::CreateIndex {
                vocbase_id: self.id,
                cid: collection.id(),
                iid,
                description: index.to_json(),
            },
            false,
        )?;

        info!(
            "created {} index {} on collection '{}'",
            index.type_name(),
            iid,
            collection_name
        );
        Ok(index)
    }

    pub fn drop_index(&self, collection_name: &str, iid: IndexId) -> Result<()> {
        let collection = self
            .collection_by_name(collection_name)
            .ok_or_else(|| DbError::CollectionNotFound(collection_name.to_string()))?;

        collection.unlink_index(iid)?;
        collection.save_index_descriptors()?;
        self.wal.append(
            Marker::DropIndex {
                vocbase_id: self.id,
                cid: collection.id(),
                iid,
            },
            false,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // open / replay
    // ------------------------------------------------------------------------

    /// Rebuild a collection's state from the WAL: replays this collection's
    /// data markers (and all transaction markers) through an OpenIterator,
    /// then reconstructs secondary indexes from the persisted descriptors
    /// and refills them in parallel.
    pub fn open_collection(self: &Arc<Self>, name: &str) -> Result<OpenIteratorSummary> {
        let collection = self
            .collection_by_name(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        let cid = collection.id();

        let entries = self.wal.read_all()?;
        let mut iterator = OpenIterator::new(Arc::clone(&collection), Arc::clone(&self.ticks));
        let fid = DatafileId(1);
        for entry in &entries {
            let relevant = match &entry.marker {
                Marker::DocumentInsert { cid: c, .. }
                | Marker::EdgeInsert { cid: c, .. }
                | Marker::DocumentRemove { cid: c, .. }
                | Marker::MvccDocumentInsert { cid: c, .. }
                | Marker::MvccEdgeInsert { cid: c, .. }
                | Marker::MvccDocumentRemove { cid: c, .. }
                | Marker::ShapeRegister { cid: c, .. }
                | Marker::AttributeRegister { cid: c, .. } => *c == cid,
                // transaction markers gate the data markers of every
                // collection
                Marker::BeginTransaction { .. }
                | Marker::BeginRemoteTransaction { .. }
                | Marker::CommitTransaction { .. }
                | Marker::CommitRemoteTransaction { .. }
                | Marker::AbortTransaction { .. }
                | Marker::AbortRemoteTransaction { .. } => true,
                _ => false,
            };
            if relevant {
                iterator.execute(fid, entry)?;
            }
        }
        let summary = iterator.finish()?;

        let descriptors = collection.load_index_descriptors()?;
        let mut rebuilt = Vec::new();
        for descriptor in &descriptors {
            let index = Arc::new(index_from_json(descriptor)?);
            collection.add_index(Arc::clone(&index))?;
            rebuilt.push(index);
        }
        collection.fill_indexes_parallel(&rebuilt)?;

        info!(
            "opened collection '{}': {} documents, {} secondary indexes",
            name,
            summary.document_count,
            rebuilt.len()
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for Vocbase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocbase")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
