//! Kernel heap: a fixed bump arena behind the global allocator.
//!
//! Backs the small amount of heap the memory core needs (VMA vectors,
//! shared address-space handles). Nothing is ever returned to the arena;
//! the kernel's long-lived allocations do not churn.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;

use spin::Mutex;

const HEAP_SIZE: usize = 1 << 20;

#[repr(align(16))]
struct Arena(UnsafeCell<[u8; HEAP_SIZE]>);

// SAFETY: The arena is only handed out through the lock-guarded allocator.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; HEAP_SIZE]));

struct BumpHeap {
    used: Mutex<usize>,
}

#[global_allocator]
static HEAP: BumpHeap = BumpHeap {
    used: Mutex::new(0),
};

unsafe impl GlobalAlloc for BumpHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut used = self.used.lock();
        let start = ARENA.0.get() as usize;
        let base = (start + *used + layout.align() - 1) & !(layout.align() - 1);
        let end = base + layout.size();
        if end > start + HEAP_SIZE {
            return core::ptr::null_mut();
        }
        *used = end - start;
        base as *mut u8
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        // Bump arena: individual frees are dropped.
    }
}

/// Returns how many bytes of the arena are in use.
pub fn used() -> usize {
    *HEAP.used.lock()
}
