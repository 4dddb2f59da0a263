//! The shared slot arena.
//!
//! A [Pool] is a single allocation divided into [LINE_SIZE] slots. Slots are never allocated or
//! freed individually: ownership of a slot is tracked by the [crate::Policy], and access to its
//! bytes is serialized by the [crate::Residency] status of the line that owns it.

use crate::{identifier::SlotId, LINE_SIZE};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    num::NonZeroUsize,
    ptr::NonNull,
    slice,
};

/// Alignment of the arena (and therefore of every slot, since [LINE_SIZE] is a multiple of it).
const ALIGNMENT: usize = 4096;

/// Fixed-size memory shared by every open file.
pub struct Pool {
    ptr: NonNull<u8>,
    layout: Layout,
    slots: usize,
}

// SAFETY: Pool owns its memory. Concurrent access to a slot is only performed through the unsafe
// accessors, whose callers guarantee exclusivity.
unsafe impl Send for Pool {}
// SAFETY: See above.
unsafe impl Sync for Pool {}

impl Pool {
    /// Allocate a zeroed arena of `slots` slots.
    ///
    /// # Panics
    ///
    /// Panics if the arena size overflows or the allocation fails.
    pub fn new(slots: NonZeroUsize) -> Self {
        let slots = slots.get();
        let size = slots.checked_mul(LINE_SIZE).expect("pool size overflows");
        let layout = Layout::from_size_align(size, ALIGNMENT).expect("invalid layout");

        // SAFETY: Layout is valid and has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout, slots }
    }

    /// Number of slots in the arena.
    pub const fn slots(&self) -> usize {
        self.slots
    }

    fn start(&self, slot: SlotId) -> usize {
        let index = slot.as_usize();
        assert!(index < self.slots, "{slot} out of range");
        index * LINE_SIZE
    }

    /// The bytes of `slot`.
    ///
    /// # Safety
    ///
    /// No one may write to `slot` while the returned slice is alive. Callers guarantee this by
    /// holding the lock of the line the slot is mapped to.
    pub(crate) unsafe fn slot(&self, slot: SlotId) -> &[u8] {
        let start = self.start(slot);
        // SAFETY: `start + LINE_SIZE` is within the allocation; aliasing is upheld by the caller.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(start), LINE_SIZE) }
    }

    /// The bytes of `slot`, writable.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `slot`: either it holds the lock of the line the
    /// slot is mapped to, or it claimed the slot from the [crate::Policy] and has not mapped it yet.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, slot: SlotId) -> &mut [u8] {
        let start = self.start(slot);
        // SAFETY: `start + LINE_SIZE` is within the allocation; exclusivity is upheld by the caller.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), LINE_SIZE) }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_slots_are_disjoint() {
        let pool = Pool::new(NonZeroUsize::new(3).unwrap());
        assert_eq!(pool.slots(), 3);

        for index in 0..3u64 {
            // SAFETY: The test is the only user of the pool.
            let bytes = unsafe { pool.slot_mut(SlotId::new(index)) };
            assert_eq!(bytes.len(), LINE_SIZE);
            assert!(bytes.iter().all(|b| *b == 0));
            bytes.fill(index as u8 + 1);
        }
        for index in 0..3u64 {
            // SAFETY: The test is the only user of the pool.
            let bytes = unsafe { pool.slot(SlotId::new(index)) };
            assert!(bytes.iter().all(|b| *b == index as u8 + 1));
            assert_eq!(bytes.as_ptr() as usize % ALIGNMENT, 0);
        }
    }

    #[test_traced]
    #[should_panic(expected = "out of range")]
    fn test_slot_out_of_range() {
        let pool = Pool::new(NonZeroUsize::new(1).unwrap());
        // SAFETY: The test is the only user of the pool.
        let _ = unsafe { pool.slot(SlotId::new(1)) };
    }
}
