//! # Global Allocator Adapter
//!
//! Routes Rust's `alloc` collections to [`kmalloc`](crate::heap::KernelHeap::kmalloc)
//! once a heap is installed:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: GlobalHeap = GlobalHeap::new();
//!
//! HEAP.install(&MEMORY);
//! ```
//!
//! Every block `kmalloc` returns is aligned to its size class (or a page),
//! so requests are rounded up to their alignment. Alignments beyond a page
//! are refused.

use crate::heap::KernelHeap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_info::memory::PAGE_SIZE;
use kernel_sync::SyncOnceCell;
use log::error;

type Heap = &'static (dyn KernelHeap + Sync);

pub struct GlobalHeap {
    heap: SyncOnceCell<Heap>,
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: SyncOnceCell::new(),
        }
    }

    /// Start serving allocations from `heap`. Only the first call has an
    /// effect; returns whether it was this one.
    pub fn install(&self, heap: Heap) -> bool {
        let installed = self.heap.get_or_init(|| heap);
        ptr::addr_eq(ptr::from_ref(*installed), ptr::from_ref(heap))
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.heap.get().is_some()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(heap) = self.heap.get() else {
            error!("allocation of {} bytes before the heap is installed", layout.size());
            return ptr::null_mut();
        };
        if layout.align() as u64 > PAGE_SIZE {
            error!("alignment {} is not supported by the kernel heap", layout.align());
            return ptr::null_mut();
        }
        heap.kmalloc(layout.size().max(layout.align()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (Some(heap), Some(ptr)) = (self.heap.get(), NonNull::new(ptr)) else {
            return;
        };
        heap.kfree(ptr);
    }
}
