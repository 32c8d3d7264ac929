// ============================================================================
// Timed Read/Write Lock
// ============================================================================
//
// Collection-level and compaction locks are acquired in one call frame and
// released in another (a transaction may hold them across many operations),
// so the guard-based std locks do not fit. This lock exposes an explicit
// lock/unlock API with a deadline; the holder is responsible for pairing
// calls, which the transaction machinery does via its recorded lock state.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{DbError, Result};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

#[derive(Debug, Default)]
pub struct TimedRwLock {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl TimedRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock shared. Fails with LockTimeout after `timeout`.
    pub fn lock_read(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock()?;

        // writers take precedence, otherwise a steady stream of readers
        // starves every writer
        while state.writer || state.writers_waiting > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DbError::LockTimeout("read lock".into()));
            }
            let (guard, result) = self.readers_cv.wait_timeout(state, remaining)?;
            state = guard;
            if result.timed_out() && (state.writer || state.writers_waiting > 0) {
                return Err(DbError::LockTimeout("read lock".into()));
            }
        }

        state.readers += 1;
        Ok(())
    }

    /// Acquire the lock exclusive. Fails with LockTimeout after `timeout`.
    pub fn lock_write(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock()?;

        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.writers_waiting -= 1;
                self.readers_cv.notify_all();
                return Err(DbError::LockTimeout("write lock".into()));
            }
            let (guard, result) = self.writers_cv.wait_timeout(state, remaining)?;
            state = guard;
            if result.timed_out() && (state.writer || state.readers > 0) {
                state.writers_waiting -= 1;
                self.readers_cv.notify_all();
                return Err(DbError::LockTimeout("write lock".into()));
            }
        }
        state.writers_waiting -= 1;
        state.writer = true;
        Ok(())
    }

    /// Release a shared hold.
    pub fn unlock_read(&self) {
        let mut state = self.state.lock().expect("lock state poisoned");
        debug_assert!(state.readers > 0);
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.writers_cv.notify_one();
        }
    }

    /// Release an exclusive hold.
    pub fn unlock_write(&self) {
        let mut state = self.state.lock().expect("lock state poisoned");
        debug_assert!(state.writer);
        state.writer = false;
        self.writers_cv.notify_one();
        self.readers_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_lock_is_shared() {
        let lock = TimedRwLock::new();
        lock.lock_read(Duration::from_millis(100)).unwrap();
        lock.lock_read(Duration::from_millis(100)).unwrap();
        lock.unlock_read();
        lock.unlock_read();
    }

    #[test]
    fn test_write_lock_times_out_against_reader() {
        let lock = TimedRwLock::new();
        lock.lock_read(Duration::from_millis(100)).unwrap();
        let err = lock.lock_write(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DbError::LockTimeout(_)));
        lock.unlock_read();
    }

    #[test]
    fn test_writer_blocks_new_readers() {
        let lock = Arc::new(TimedRwLock::new());
        lock.lock_write(Duration::from_millis(100)).unwrap();

        let l2 = Arc::clone(&lock);
        let handle = thread::spawn(move || l2.lock_read(Duration::from_millis(20)));
        assert!(handle.join().unwrap().is_err());

        lock.unlock_write();
        lock.lock_read(Duration::from_millis(100)).unwrap();
        lock.unlock_read();
    }
}
