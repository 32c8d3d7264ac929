// ============================================================================
// WAL Manager
// ============================================================================

use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::{DbError, DurabilityMode, Result, Tick, TickService};

use super::marker::{LogEntry, Marker};

/// Appends typed markers and hands replay back to the open iterator.
///
/// Every append is assigned a tick, framed (u32 LE length + MessagePack
/// payload) and queued to a background writer thread. Commit markers trigger
/// a flush; with `DurabilityMode::Sync` they also fsync, and a caller that
/// passed `wait_for_sync` blocks until the writer acknowledged the sync.
pub struct WalManager {
    wal_path: PathBuf,
    durability: DurabilityMode,
    ticks: Arc<TickService>,
    throttled: AtomicBool,
    writer: Option<WalWriter>,
    metrics: Arc<WalMetrics>,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(
        wal_path: P,
        durability: DurabilityMode,
        ticks: Arc<TickService>,
    ) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DbError::IoError(format!("failed to create WAL directory: {}", e)))?;
        }

        let metrics = Arc::new(WalMetrics::default());
        let writer = if durability != DurabilityMode::None {
            Some(WalWriter::start(
                wal_path.clone(),
                durability,
                Arc::clone(&metrics),
            )?)
        } else {
            None
        };

        Ok(Self {
            wal_path,
            durability,
            ticks,
            throttled: AtomicBool::new(false),
            writer,
            metrics,
        })
    }

    /// Append a marker. Returns the tick assigned to it.
    pub fn append(&self, marker: Marker, wait_for_sync: bool) -> Result<Tick> {
        let tick = self.ticks.next();

        if self.durability == DurabilityMode::None {
            return Ok(tick);
        }

        let entry = LogEntry { tick, marker };
        let serialized = rmp_serde::to_vec(&entry)?;
        let len = serialized.len() as u32;
        let mut payload = Vec::with_capacity(4 + serialized.len());
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(&serialized);

        if let Some(writer) = &self.writer {
            let is_commit = entry.marker.is_commit();
            let sync = wait_for_sync && self.durability == DurabilityMode::Sync;
            writer.append(payload, is_commit, sync)?;
            self.metrics.on_append(serialized.len() as u64, is_commit);
        }

        Ok(tick)
    }

    /// Decode the whole log for replay, in file order.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| DbError::IoError(format!("failed to open WAL for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(DbError::IoError(format!(
                        "failed to read WAL entry length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .map_err(|e| DbError::IoError(format!("failed to read WAL entry data: {}", e)))?;
            let entry: LogEntry = rmp_serde::from_slice(&data)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The throttling signal. Write transactions poll this at begin.
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Producer side of the throttle; flipped by whoever owns slot pressure.
    pub fn set_throttled(&self, value: bool) {
        if value != self.throttled.swap(value, Ordering::Relaxed) {
            debug!("WAL throttle {}", if value { "engaged" } else { "released" });
        }
    }

    pub fn metrics(&self) -> WalMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn path(&self) -> &Path {
        &self.wal_path
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Default)]
pub struct WalMetrics {
    bytes_written: AtomicU64,
    entries_written: AtomicU64,
    commit_entries: AtomicU64,
    flush_count: AtomicU64,
    sync_count: AtomicU64,
}

impl WalMetrics {
    fn on_append(&self, bytes: u64, is_commit: bool) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        if is_commit {
            self.commit_entries.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    fn on_sync(&self) {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WalMetricsSnapshot {
        WalMetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            commit_entries: self.commit_entries.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalMetricsSnapshot {
    pub bytes_written: u64,
    pub entries_written: u64,
    pub commit_entries: u64,
    pub flush_count: u64,
    pub sync_count: u64,
}

// ============================================================================
// Background writer
// ============================================================================

enum WalCommand {
    Append {
        bytes: Vec<u8>,
        is_commit: bool,
        ack: Option<Sender<()>>,
    },
    Shutdown,
}

struct WalWriter {
    sender: Sender<WalCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl WalWriter {
    fn start(path: PathBuf, durability: DurabilityMode, metrics: Arc<WalMetrics>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let join = thread::Builder::new()
            .name("wal-writer".to_string())
            .spawn(move || wal_writer_loop(path, durability, rx, metrics))
            .map_err(|e| DbError::Internal(format!("failed to start WAL writer: {}", e)))?;

        Ok(Self {
            sender: tx,
            join: Some(join),
        })
    }

    fn append(&self, bytes: Vec<u8>, is_commit: bool, wait_for_sync: bool) -> Result<()> {
        if wait_for_sync {
            let (tx, rx) = mpsc::channel();
            self.sender
                .send(WalCommand::Append {
                    bytes,
                    is_commit,
                    ack: Some(tx),
                })
                .map_err(|e| DbError::IoError(format!("failed to send WAL entry: {}", e)))?;
            rx.recv()
                .map_err(|e| DbError::IoError(format!("failed to wait for WAL sync: {}", e)))?;
            return Ok(());
        }

        self.sender
            .send(WalCommand::Append {
                bytes,
                is_commit,
                ack: None,
            })
            .map_err(|e| DbError::IoError(format!("failed to send WAL entry: {}", e)))
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(WalCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn wal_writer_loop(
    path: PathBuf,
    durability: DurabilityMode,
    rx: Receiver<WalCommand>,
    metrics: Arc<WalMetrics>,
) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => BufWriter::new(f),
        Err(e) => {
            warn!("WAL writer could not open {:?}: {}", path, e);
            return;
        }
    };

    let mut pending_acks: Vec<Sender<()>> = Vec::new();
    let mut last_flush = Instant::now();
    let flush_interval = Duration::from_millis(50);

    loop {
        let cmd = match rx.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };

        let mut commit_pending = false;
        let mut process = |cmd: WalCommand,
                           file: &mut BufWriter<File>,
                           pending_acks: &mut Vec<Sender<()>>,
                           commit_pending: &mut bool|
         -> bool {
            match cmd {
                WalCommand::Append {
                    bytes,
                    is_commit,
                    ack,
                } => {
                    let _ = file.write_all(&bytes);
                    if is_commit {
                        *commit_pending = true;
                    }
                    if let Some(ack) = ack {
                        pending_acks.push(ack);
                    }
                    false
                }
                WalCommand::Shutdown => true,
            }
        };

        if process(cmd, &mut file, &mut pending_acks, &mut commit_pending) {
            break;
        }

        // drain whatever queued up while we were writing, so one flush
        // covers a burst of appends
        loop {
            match rx.try_recv() {
                Ok(cmd) => {
                    if process(cmd, &mut file, &mut pending_acks, &mut commit_pending) {
                        let _ = file.flush();
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let _ = file.flush();
                    return;
                }
            }
        }

        let now = Instant::now();
        let ack_pending = !pending_acks.is_empty();
        if commit_pending || ack_pending || now.duration_since(last_flush) >= flush_interval {
            let _ = file.flush();
            metrics.on_flush();
            if (commit_pending || ack_pending) && durability == DurabilityMode::Sync {
                let _ = file.get_mut().sync_all();
                metrics.on_sync();
            }
            last_flush = now;
        }

        // acknowledge only after the data is down
        for ack in pending_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    let _ = file.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VocbaseId;
    use crate::txn::TransactionId;

    fn temp_wal(durability: DurabilityMode) -> (tempfile::TempDir, WalManager) {
        let dir = tempfile::tempdir().unwrap();
        let ticks = Arc::new(TickService::new());
        let wal = WalManager::new(dir.path().join("test.wal"), durability, ticks).unwrap();
        (dir, wal)
    }

    #[test]
    fn test_append_assigns_monotonic_ticks() {
        let (_dir, wal) = temp_wal(DurabilityMode::Async);
        let tid = TransactionId::top_level(1);
        let t1 = wal
            .append(
                Marker::BeginTransaction {
                    vocbase_id: VocbaseId(1),
                    tid,
                },
                false,
            )
            .unwrap();
        let t2 = wal
            .append(
                Marker::CommitTransaction {
                    vocbase_id: VocbaseId(1),
                    tid,
                },
                false,
            )
            .unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn test_read_all_round_trips_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let ticks = Arc::new(TickService::new());
        let tid = TransactionId::top_level(1);
        {
            let wal = WalManager::new(&path, DurabilityMode::Sync, Arc::clone(&ticks)).unwrap();
            wal.append(
                Marker::BeginTransaction {
                    vocbase_id: VocbaseId(7),
                    tid,
                },
                false,
            )
            .unwrap();
            wal.append(
                Marker::CommitTransaction {
                    vocbase_id: VocbaseId(7),
                    tid,
                },
                true,
            )
            .unwrap();
            // writer thread shuts down and flushes on drop
        }

        let wal = WalManager::new(&path, DurabilityMode::Sync, ticks).unwrap();
        let entries = wal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].marker,
            Marker::BeginTransaction { vocbase_id: VocbaseId(7), .. }
        ));
        assert!(entries[1].marker.is_commit());
        assert!(entries[0].tick < entries[1].tick);
    }

    #[test]
    fn test_throttle_flag() {
        let (_dir, wal) = temp_wal(DurabilityMode::Async);
        assert!(!wal.is_throttled());
        wal.set_throttled(true);
        assert!(wal.is_throttled());
        wal.set_throttled(false);
        assert!(!wal.is_throttled());
    }
}
