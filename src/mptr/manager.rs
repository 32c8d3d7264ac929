// ============================================================================
// Masterpointer Manager
// ============================================================================
//
// Pool-allocates master pointers for one collection and links committed
// versions into the publication list. The pointer-rich original is
// re-expressed as an arena: a growing vector of fixed-size blocks, slots
// addressed by a global index, the free list threaded through unused slots
// and the doubly linked publication list stored as atomic slot indexes.
//
// List mutation happens under the manager's mutex; iterators traverse the
// links lock-free from a head/tail snapshot. Unlinked slots keep their own
// links intact and are only recycled once no iterator is live, so a reader
// standing on an unlinked slot can still step off it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::collection::document::DocumentBody;
use crate::core::{DbError, Result, RevisionId, Tick};

/// Global slot index into the arena. `NIL` terminates lists.
pub type SlotIndex = usize;

pub const NIL: SlotIndex = usize::MAX;

const BLOCK_SIZE_UNIT: usize = 128;

/// Block `n` holds `min(128 << n, 32768)` slots: small collections stay
/// small, big collections allocate in 32k chunks.
fn block_size(block_number: usize) -> usize {
    if block_number < 8 {
        BLOCK_SIZE_UNIT << block_number
    } else {
        BLOCK_SIZE_UNIT << 8
    }
}

// ============================================================================
// Master pointer slot
// ============================================================================

/// One version of a document. `from` is the own-tick of the transaction that
/// made the version visible; `to` is 0 while the version is current, or the
/// own-tick of the transaction that superseded it.
pub struct MasterPointer {
    body: RwLock<Option<Arc<DocumentBody>>>,
    from: AtomicU64,
    to: AtomicU64,
    prev: AtomicUsize,
    next: AtomicUsize,
    next_free: AtomicUsize,
    linked: AtomicBool,
}

impl MasterPointer {
    fn empty() -> Self {
        Self {
            body: RwLock::new(None),
            from: AtomicU64::new(0),
            to: AtomicU64::new(0),
            prev: AtomicUsize::new(NIL),
            next: AtomicUsize::new(NIL),
            next_free: AtomicUsize::new(NIL),
            linked: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> Option<Arc<DocumentBody>> {
        self.body.read().ok()?.clone()
    }

    pub fn revision(&self) -> RevisionId {
        self.body().map(|b| b.revision).unwrap_or(0)
    }

    pub fn key(&self) -> Option<String> {
        self.body().map(|b| b.key.clone())
    }

    pub fn byte_size(&self) -> usize {
        self.body().map(|b| b.byte_size()).unwrap_or(0)
    }

    pub fn from(&self) -> Tick {
        self.from.load(Ordering::SeqCst)
    }

    pub fn to(&self) -> Tick {
        self.to.load(Ordering::SeqCst)
    }

    pub fn set_from(&self, tid: Tick) {
        self.from.store(tid, Ordering::SeqCst);
    }

    /// Mark the version superseded by `tid`.
    pub fn set_to(&self, tid: Tick) {
        self.to.store(tid, Ordering::SeqCst);
    }

    /// Make the version current again (rollback of a remove/update).
    pub fn clear_to(&self) {
        self.to.store(0, Ordering::SeqCst);
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    fn prev_index(&self) -> SlotIndex {
        self.prev.load(Ordering::SeqCst)
    }

    fn next_index(&self) -> SlotIndex {
        self.next.load(Ordering::SeqCst)
    }
}

/// Cheap cloneable handle to a slot: the block plus the offset inside it.
#[derive(Clone)]
pub struct MptrHandle {
    block: Arc<Vec<MasterPointer>>,
    offset: usize,
    index: SlotIndex,
}

impl MptrHandle {
    pub fn index(&self) -> SlotIndex {
        self.index
    }
}

impl std::ops::Deref for MptrHandle {
    type Target = MasterPointer;

    fn deref(&self) -> &MasterPointer {
        &self.block[self.offset]
    }
}

impl std::fmt::Debug for MptrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MptrHandle")
            .field("index", &self.index)
            .field("from", &self.from())
            .field("to", &self.to())
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

struct BlockRef {
    start: SlotIndex,
    slots: Arc<Vec<MasterPointer>>,
}

#[derive(Default)]
struct ListState {
    free_head: SlotIndex,
    head: SlotIndex,
    tail: SlotIndex,
    to_recycle: Vec<SlotIndex>,
    linked_count: usize,
    linked_bytes: u64,
    allocated: usize,
}

pub struct MasterpointerManager {
    state: Mutex<ListState>,
    blocks: RwLock<Vec<BlockRef>>,
    active_iterators: AtomicI64,
}

impl MasterpointerManager {
    pub fn new() -> Self {
        let state = ListState {
            free_head: NIL,
            head: NIL,
            tail: NIL,
            ..ListState::default()
        };
        Self {
            state: Mutex::new(state),
            blocks: RwLock::new(Vec::new()),
            active_iterators: AtomicI64::new(0),
        }
    }

    /// Resolve a slot index to a handle.
    pub fn handle(&self, index: SlotIndex) -> MptrHandle {
        let blocks = self.blocks.read().expect("mptr blocks poisoned");
        for block in blocks.iter().rev() {
            if index >= block.start {
                return MptrHandle {
                    block: Arc::clone(&block.slots),
                    offset: index - block.start,
                    index,
                };
            }
        }
        panic!("master pointer index {} out of range", index);
    }

    /// Reserve a master pointer for `body`, created by transaction `tid`.
    /// The record is initialized but not linked; dropping the returned
    /// container without calling `link()` recycles it.
    pub fn create(
        self: &Arc<Self>,
        body: Arc<DocumentBody>,
        tid: Tick,
    ) -> Result<MasterpointerContainer> {
        let index = {
            let mut state = self.state.lock()?;

            if state.free_head == NIL {
                self.grow(&mut state)?;
            }

            let index = state.free_head;
            let handle = self.handle(index);
            state.free_head = handle.next_free.load(Ordering::SeqCst);
            handle.next_free.store(NIL, Ordering::SeqCst);
            index
        };

        let handle = self.handle(index);
        {
            let mut slot_body = handle.body.write()?;
            *slot_body = Some(body);
        }
        handle.set_from(tid);
        handle.clear_to();
        handle.prev.store(NIL, Ordering::SeqCst);
        handle.next.store(NIL, Ordering::SeqCst);
        handle.linked.store(false, Ordering::SeqCst);

        Ok(MasterpointerContainer {
            manager: Arc::clone(self),
            handle,
            owns: true,
        })
    }

    fn grow(&self, state: &mut ListState) -> Result<()> {
        let mut blocks = self.blocks.write()?;
        let number = blocks.len();
        let size = block_size(number);
        let start = state.allocated;

        let mut slots = Vec::new();
        if slots.try_reserve_exact(size).is_err() {
            return Err(DbError::OutOfMemory(format!(
                "cannot allocate master pointer block of {} slots",
                size
            )));
        }
        for _ in 0..size {
            slots.push(MasterPointer::empty());
        }

        // thread the new block onto the free list, last slot first
        for offset in (0..size).rev() {
            slots[offset]
                .next_free
                .store(state.free_head, Ordering::SeqCst);
            state.free_head = start + offset;
        }

        blocks.push(BlockRef {
            start,
            slots: Arc::new(slots),
        });
        state.allocated += size;
        Ok(())
    }

    /// Insert the slot at the tail of the publication list. Must be called
    /// under the collection's index read lock, after the primary index
    /// accepted the record. Calling it twice for one slot is a contract
    /// violation.
    pub fn link(&self, index: SlotIndex) {
        let mut state = self.state.lock().expect("mptr state poisoned");
        let handle = self.handle(index);
        assert!(!handle.is_linked(), "master pointer linked twice");

        handle.prev.store(state.tail, Ordering::SeqCst);
        handle.next.store(NIL, Ordering::SeqCst);
        if state.tail != NIL {
            self.handle(state.tail).next.store(index, Ordering::SeqCst);
        } else {
            state.head = index;
        }
        state.tail = index;
        handle.linked.store(true, Ordering::SeqCst);

        state.linked_count += 1;
        state.linked_bytes += handle.byte_size() as u64;
    }

    /// Remove the slot from the publication list. Recycling is deferred
    /// while any iterator that may have observed the slot is still live.
    pub fn unlink(&self, index: SlotIndex) {
        let mut state = self.state.lock().expect("mptr state poisoned");
        let handle = self.handle(index);
        if !handle.is_linked() {
            return;
        }

        let prev = handle.prev_index();
        let next = handle.next_index();
        if prev != NIL {
            self.handle(prev).next.store(next, Ordering::SeqCst);
        } else {
            state.head = next;
        }
        if next != NIL {
            self.handle(next).prev.store(prev, Ordering::SeqCst);
        } else {
            state.tail = prev;
        }
        // the slot's own links stay intact so an iterator standing on it
        // can still step off
        handle.linked.store(false, Ordering::SeqCst);

        state.linked_count -= 1;
        state.linked_bytes = state.linked_bytes.saturating_sub(handle.byte_size() as u64);

        if self.active_iterators.load(Ordering::SeqCst) > 0 {
            state.to_recycle.push(index);
        } else {
            self.recycle_locked(&mut state, index);
        }
    }

    /// Return an unlinked, unobservable slot to the free list.
    pub fn recycle(&self, index: SlotIndex) {
        let mut state = self.state.lock().expect("mptr state poisoned");
        self.recycle_locked(&mut state, index);
    }

    fn recycle_locked(&self, state: &mut ListState, index: SlotIndex) {
        let handle = self.handle(index);
        debug_assert!(!handle.is_linked());

        {
            let mut body = handle.body.write().expect("mptr body poisoned");
            *body = None;
        }
        handle.set_from(0);
        handle.clear_to();
        handle.prev.store(NIL, Ordering::SeqCst);
        handle.next.store(NIL, Ordering::SeqCst);

        handle.next_free.store(state.free_head, Ordering::SeqCst);
        state.free_head = index;
    }

    /// (number of linked records, their aggregate byte size)
    pub fn linked_totals(&self) -> (usize, u64) {
        let state = self.state.lock().expect("mptr state poisoned");
        (state.linked_count, state.linked_bytes)
    }

    /// Total slots ever allocated (pool size).
    pub fn pool_size(&self) -> usize {
        let state = self.state.lock().expect("mptr state poisoned");
        state.allocated
    }

    /// Head of the publication list (oldest linked record).
    pub fn front(&self) -> Option<MptrHandle> {
        let state = self.state.lock().expect("mptr state poisoned");
        if state.head == NIL {
            None
        } else {
            Some(self.handle(state.head))
        }
    }

    /// Successor of `handle` in publication order.
    pub fn next_of(&self, handle: &MptrHandle) -> Option<MptrHandle> {
        let next = handle.next_index();
        if next == NIL {
            None
        } else {
            Some(self.handle(next))
        }
    }

    fn initialize_iterator(&self) -> (SlotIndex, SlotIndex) {
        let state = self.state.lock().expect("mptr state poisoned");
        self.active_iterators.fetch_add(1, Ordering::SeqCst);
        (state.head, state.tail)
    }

    fn shutdown_iterator(&self) {
        let remaining = self.active_iterators.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut state = self.state.lock().expect("mptr state poisoned");
            let deferred = std::mem::take(&mut state.to_recycle);
            for index in deferred {
                self.recycle_locked(&mut state, index);
            }
        }
    }

    /// Iterate the publication list, yielding records accepted by
    /// `predicate(from, to)`.
    pub fn iterate(
        self: &Arc<Self>,
        predicate: impl Fn(Tick, Tick) -> bool,
        reverse: bool,
    ) -> MasterpointerIterator<impl Fn(Tick, Tick) -> bool> {
        let (head, tail) = self.initialize_iterator();
        let current = if reverse { tail } else { head };
        MasterpointerIterator {
            manager: Arc::clone(self),
            predicate,
            current,
            head,
            tail,
            reverse,
        }
    }
}

impl Default for MasterpointerManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Owning container
// ============================================================================

/// Owns a freshly created master pointer until `link()` hands it over to the
/// publication list; dropped unlinked, the record goes back to the pool.
pub struct MasterpointerContainer {
    manager: Arc<MasterpointerManager>,
    handle: MptrHandle,
    owns: bool,
}

impl MasterpointerContainer {
    pub fn link(&mut self) -> Result<()> {
        if !self.owns {
            return Err(DbError::Internal(
                "should not link a non-owned master pointer".into(),
            ));
        }
        self.owns = false;
        self.manager.link(self.handle.index());
        Ok(())
    }

    pub fn handle(&self) -> MptrHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for MasterpointerContainer {
    type Target = MasterPointer;

    fn deref(&self) -> &MasterPointer {
        &self.handle
    }
}

impl Drop for MasterpointerContainer {
    fn drop(&mut self) {
        if self.owns {
            self.manager.recycle(self.handle.index());
            self.owns = false;
        }
    }
}

// ============================================================================
// Iterator
// ============================================================================

pub struct MasterpointerIterator<F: Fn(Tick, Tick) -> bool> {
    manager: Arc<MasterpointerManager>,
    predicate: F,
    current: SlotIndex,
    head: SlotIndex,
    tail: SlotIndex,
    reverse: bool,
}

impl<F: Fn(Tick, Tick) -> bool> MasterpointerIterator<F> {
    /// Advance to the next record accepted by the predicate, or None.
    pub fn next(&mut self) -> Option<MptrHandle> {
        while self.current != NIL {
            let handle = self.manager.handle(self.current);
            let accepted = (self.predicate)(handle.from(), handle.to());

            let at_end = if self.reverse {
                self.current == self.head
            } else {
                self.current == self.tail
            };
            self.current = if at_end {
                NIL
            } else if self.reverse {
                handle.prev_index()
            } else {
                handle.next_index()
            };

            if accepted {
                return Some(handle);
            }
        }
        None
    }

    pub fn has_more(&self) -> bool {
        self.current != NIL
    }
}

impl<F: Fn(Tick, Tick) -> bool> Drop for MasterpointerIterator<F> {
    fn drop(&mut self) {
        self.manager.shutdown_iterator();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(key: &str, revision: RevisionId) -> Arc<DocumentBody> {
        Arc::new(DocumentBody::new(key.to_string(), revision, 2, &json!({"k": key})).unwrap())
    }

    #[test]
    fn test_block_sizes_grow_to_cap() {
        assert_eq!(block_size(0), 128);
        assert_eq!(block_size(1), 256);
        assert_eq!(block_size(7), 16384);
        assert_eq!(block_size(8), 32768);
        assert_eq!(block_size(20), 32768);
    }

    #[test]
    fn test_create_without_link_recycles() {
        let manager = Arc::new(MasterpointerManager::new());
        {
            let container = manager.create(body("a", 1), 10).unwrap();
            assert!(!container.is_linked());
        }
        let pool = manager.pool_size();
        // the recycled slot is reused
        let container = manager.create(body("b", 2), 11).unwrap();
        assert_eq!(manager.pool_size(), pool);
        drop(container);
    }

    #[test]
    fn test_publication_order() {
        let manager = Arc::new(MasterpointerManager::new());
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let mut container = manager.create(body(key, i as u64 + 1), 10).unwrap();
            container.link().unwrap();
        }

        let mut iter = manager.iterate(|_, _| true, false);
        let keys: Vec<String> = std::iter::from_fn(|| iter.next().and_then(|h| h.key())).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let mut rev = manager.iterate(|_, _| true, true);
        let keys: Vec<String> = std::iter::from_fn(|| rev.next().and_then(|h| h.key())).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_unlink_splices_list() {
        let manager = Arc::new(MasterpointerManager::new());
        let mut handles = Vec::new();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let mut container = manager.create(body(key, i as u64 + 1), 10).unwrap();
            container.link().unwrap();
            handles.push(container.handle());
        }

        manager.unlink(handles[1].index());

        let mut iter = manager.iterate(|_, _| true, false);
        let keys: Vec<String> = std::iter::from_fn(|| iter.next().and_then(|h| h.key())).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(manager.linked_totals().0, 2);
    }

    #[test]
    fn test_unlink_during_iteration_defers_recycling() {
        let manager = Arc::new(MasterpointerManager::new());
        let mut handles = Vec::new();
        for (i, key) in ["a", "b"].iter().enumerate() {
            let mut container = manager.create(body(key, i as u64 + 1), 10).unwrap();
            container.link().unwrap();
            handles.push(container.handle());
        }

        let mut iter = manager.iterate(|_, _| true, false);
        manager.unlink(handles[0].index());

        // the unlinked slot still carries its body until the iterator ends
        assert!(handles[0].body().is_some());
        while iter.next().is_some() {}
        drop(iter);

        assert!(handles[0].body().is_none());
    }

    #[test]
    fn test_iterator_filters_by_predicate() {
        let manager = Arc::new(MasterpointerManager::new());
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let mut container = manager
                .create(body(key, i as u64 + 1), (i as u64 + 1) * 10)
                .unwrap();
            container.link().unwrap();
        }

        let mut iter = manager.iterate(|from, _| from >= 20, false);
        let keys: Vec<String> = std::iter::from_fn(|| iter.next().and_then(|h| h.key())).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
