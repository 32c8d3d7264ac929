pub mod config;
pub mod error;
pub mod lock;
pub mod tick;
pub mod types;

pub use config::{DurabilityMode, EngineConfig};
pub use error::{DbError, Result};
pub use lock::TimedRwLock;
pub use tick::{Tick, TickService};
pub use types::{CollectionId, DatafileId, IndexId, RevisionId, VocbaseId};
