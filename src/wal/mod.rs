pub mod manager;
pub mod marker;

pub use manager::{WalManager, WalMetricsSnapshot};
pub use marker::{EdgeRef, LogEntry, Marker};
