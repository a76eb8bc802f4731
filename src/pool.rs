use parking_lot::Mutex;

use crate::error::{Result, TapError};
use crate::frame::Frame;

/// Default number of work items per device.
pub const DEFAULT_CAPACITY: usize = 16;

/// A reusable descriptor carrying one captured frame from the capture hook
/// to the device worker. Whoever holds the `Box` owns the item; the pool
/// gets it back through [`WorkPool::release`].
#[derive(Debug)]
pub struct WorkItem {
    slot: usize,
    pub frame: Frame,
    /// Per-device packet id, assigned at capture.
    pub sequence: u32,
    /// Device byte count including this frame, assigned at capture.
    pub bytes: u64,
}

impl WorkItem {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Fixed set of preallocated work items with a stack of free ones.
///
/// `allocate` and `release` are O(1) under one short lock and never touch
/// the heap: the free list is reserved at full capacity up front and the
/// items themselves are moved in and out.
#[derive(Debug)]
pub struct WorkPool {
    free: Mutex<Vec<Box<WorkItem>>>,
    capacity: usize,
}

impl WorkPool {
    pub fn new(capacity: usize, snaplen: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TapError::invalid("work-item pool capacity must be at least 1"));
        }
        let mut free = Vec::with_capacity(capacity);
        for slot in (0..capacity).rev() {
            free.push(Box::new(WorkItem {
                slot,
                frame: Frame::with_capacity(snaplen),
                sequence: 0,
                bytes: 0,
            }));
        }
        Ok(WorkPool {
            free: Mutex::new(free),
            capacity,
        })
    }

    /// Takes a free item, or `None` when every item is in flight.
    pub fn allocate(&self) -> Option<Box<WorkItem>> {
        self.free.lock().pop()
    }

    /// Returns an item to the free list.
    pub fn release(&self, item: Box<WorkItem>) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "work item {} released into a full pool", item.slot);
        debug_assert!(
            free.iter().all(|f| f.slot != item.slot),
            "work item {} released twice",
            item.slot
        );
        free.push(item);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
