// ============================================================================
// Tick Service
// ============================================================================
//
// A tick is the engine's universal 64-bit identifier: transaction ids,
// revision ids and index ids are all drawn from the same monotonic counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Universal 64-bit monotonic identifier.
pub type Tick = u64;

/// Issues monotonically increasing ticks.
///
/// The counter is seeded at startup from the maximum tick observed during
/// datafile replay, so that identifiers allocated after a restart never
/// collide with replayed ones.
#[derive(Debug)]
pub struct TickService {
    current: AtomicU64,
}

impl TickService {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// Return the next tick.
    pub fn next(&self) -> Tick {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last tick handed out (or seeded).
    pub fn current(&self) -> Tick {
        self.current.load(Ordering::SeqCst)
    }

    /// Raise the counter to at least `tick`. Used while replaying markers.
    pub fn track(&self, tick: Tick) {
        self.current.fetch_max(tick, Ordering::SeqCst);
    }
}

impl Default for TickService {
    fn default() -> Self {
        Self::new()
    }
}
