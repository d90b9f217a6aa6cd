//! Transaction Tracking
//!
//! Each calling thread owns one tracker slot per registry, holding the id of
//! its open transaction (`current`) and the id it is finishing (`previous`).
//! Slots live in an arena with an index free list; a thread's slot goes back
//! on the free list when the thread exits.
//!
//! `oldest_active` is the minimum non-zero id over every slot. Fields are
//! read one atomic at a time: a stale read can only make the result smaller,
//! which delays reclamation but never reclaims a live record.

use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct TrackerSlot {
    current: AtomicU64,
    previous: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    id: u64,
    next_trx: AtomicU64,
    slots: RwLock<Vec<Arc<TrackerSlot>>>,
    free: Mutex<Vec<usize>>,
}

impl Inner {
    fn lease_slot(&self) -> (usize, Arc<TrackerSlot>) {
        if let Some(index) = self.free.lock().pop() {
            return (index, Arc::clone(&self.slots.read()[index]));
        }
        let mut slots = self.slots.write();
        let slot = Arc::new(TrackerSlot::default());
        slots.push(Arc::clone(&slot));
        (slots.len() - 1, slot)
    }
}

/// A thread's claim on one slot; returns it to the free list on thread exit
struct SlotLease {
    registry_id: u64,
    registry: Weak<Inner>,
    index: usize,
    slot: Arc<TrackerSlot>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            self.slot.current.store(0, Ordering::Release);
            self.slot.previous.store(0, Ordering::Release);
            inner.free.lock().push(self.index);
        }
    }
}

thread_local! {
    static THREAD_SLOTS: RefCell<Vec<SlotLease>> = const { RefCell::new(Vec::new()) };
}

/// Registry of per-thread transaction trackers
#[derive(Debug, Clone)]
pub struct TransactionRegistry {
    inner: Arc<Inner>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        TransactionRegistry {
            inner: Arc::new(Inner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                next_trx: AtomicU64::new(1),
                slots: RwLock::new(Vec::new()),
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    fn thread_slot(&self) -> Arc<TrackerSlot> {
        THREAD_SLOTS.with(|cell| {
            let mut leases = cell.borrow_mut();
            leases.retain(|lease| lease.registry.strong_count() > 0);
            if let Some(lease) = leases.iter().find(|l| l.registry_id == self.inner.id) {
                return Arc::clone(&lease.slot);
            }
            let (index, slot) = self.inner.lease_slot();
            leases.push(SlotLease {
                registry_id: self.inner.id,
                registry: Arc::downgrade(&self.inner),
                index,
                slot: Arc::clone(&slot),
            });
            slot
        })
    }

    /// Open a transaction on the calling thread and return its id
    pub fn begin(&self) -> u64 {
        let slot = self.thread_slot();
        assert_eq!(
            slot.current.load(Ordering::Acquire),
            0,
            "transaction already open on this thread"
        );
        let id = self.inner.next_trx.fetch_add(1, Ordering::SeqCst);
        slot.current.store(id, Ordering::Release);
        id
    }

    /// Id of the calling thread's open transaction
    pub fn current(&self) -> Option<u64> {
        match self.thread_slot().current.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Close the calling thread's open transaction
    pub fn finish(&self) {
        let slot = self.thread_slot();
        let id = slot.current.load(Ordering::Acquire);
        debug_assert!(id != 0, "Precondition: a transaction is open");
        slot.previous.store(id, Ordering::Release);
        slot.current.store(0, Ordering::Release);
        slot.previous.store(0, Ordering::Release);
    }

    /// Run `f` inside the calling thread's open transaction, or inside an
    /// implicit single-operation one
    pub fn with_transaction<T>(&self, f: impl FnOnce(u64) -> T) -> T {
        if let Some(id) = self.current() {
            return f(id);
        }
        let id = self.begin();
        let result = f(id);
        self.finish();
        result
    }

    /// Minimum id still possibly active; `u64::MAX` when none are
    pub fn oldest_active(&self) -> u64 {
        self.inner
            .slots
            .read()
            .iter()
            .flat_map(|slot| {
                [
                    slot.current.load(Ordering::Acquire),
                    slot.previous.load(Ordering::Acquire),
                ]
            })
            .filter(|&id| id != 0)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Ensure ids already on media are never handed out again
    pub fn observe(&self, trx_id: u64) {
        self.inner
            .next_trx
            .fetch_max(trx_id.saturating_add(1), Ordering::SeqCst);
    }

    /// Id the next `begin` will return
    pub fn peek_next(&self) -> u64 {
        self.inner.next_trx.load(Ordering::SeqCst)
    }

    /// Slots ever created
    pub fn slot_count(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Slots returned by exited threads and not yet reused
    pub fn free_slot_count(&self) -> usize {
        self.inner.free.lock().len()
    }
}
