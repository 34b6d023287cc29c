//! # Kernel Heap
//!
//! `kmalloc` serves three kinds of blocks:
//!
//! | era | size | source |
//! |-----|------|--------|
//! | bootstrap | any up to 128 KiB | [`EarlyHeap`](crate::early_heap::EarlyHeap) |
//! | steady | `<= SLAB_CEILING` | power-of-two size-class cache |
//! | steady | larger | whole linear frames tagged [`FrameUsage::Heap`] |
//!
//! `kfree` tells them apart without any header: the bootstrap arena is a
//! fixed address range, everything else is classified by the role recorded
//! in the frame descriptor when the block was handed out.

use crate::frame::{FrameRole, FrameUsage};
use crate::frame_alloc::ZoneHint;
use crate::manager::{MemoryManager, pages_order};
use core::ptr::NonNull;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::LockPolicy;
use kernel_vmem::Tlb;
use log::error;

/// Byte-granular allocation, as needed by [`GlobalHeap`](crate::global::GlobalHeap).
pub trait KernelHeap {
    fn kmalloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Panics
    /// If `ptr` was not returned by [`kmalloc`](Self::kmalloc) or was freed already.
    fn kfree(&self, ptr: NonNull<u8>);
}

impl<T: Tlb, R: LockPolicy> MemoryManager<'_, T, R> {
    /// Allocate at least `size` bytes.
    ///
    /// Before [`enable_slab`](Self::enable_slab) every request comes from the
    /// bootstrap heap. Afterwards small requests use the size classes and
    /// large ones whole frames; the result is then aligned to its size class
    /// or to a page respectively.
    ///
    /// # Panics
    /// If `size` is zero.
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "kmalloc of zero bytes");
        if !self.slab_ready() {
            return self.kmalloc_early(size);
        }
        if let Some(class) = self.size_class(size) {
            return self.cache_alloc(class);
        }

        let Some(order) = pages_order(size) else {
            error!("kmalloc: {size} bytes cannot be served");
            return None;
        };
        let pfn = self
            .frames
            .lock()
            .alloc_for(ZoneHint::Linear, order, FrameUsage::Heap)?;
        let Some(va) = self.linear.pfn_to_virt(pfn) else {
            panic!("linear frame {pfn} has no linear-map address");
        };
        NonNull::new(va.as_mut_ptr())
    }

    /// Allocate from the bootstrap heap regardless of the era.
    pub fn kmalloc_early(&self, size: usize) -> Option<NonNull<u8>> {
        self.early.lock().alloc(size)
    }

    /// Release a block from [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// If `ptr` is neither in the bootstrap arena, nor a size-class object,
    /// nor the start of a multi-page heap block.
    pub fn kfree(&self, ptr: NonNull<u8>) {
        {
            let mut early = self.early.lock();
            if early.contains(ptr) {
                early.free(ptr);
                return;
            }
        }

        let va = VirtualAddress::from_nonnull(ptr);
        let Some(pfn) = self.linear.virt_to_pfn(va) else {
            panic!("kfree({va}): not a heap address");
        };
        let mut frames = self.frames.lock();
        match frames.frame(pfn).role() {
            FrameRole::Slab(slab) => {
                let Some(class) = self.size_class_by_id(slab.cache) else {
                    panic!("kfree({va}): object of cache {:?}, not a kmalloc class", slab.cache);
                };
                class.free(&mut frames, &self.linear, va);
            }
            FrameRole::Allocated {
                usage: FrameUsage::Heap,
                ..
            } => {
                assert!(va.is_aligned::<Size4K>(), "kfree({va}): inside a heap block");
                frames.free(pfn);
            }
            role => panic!("kfree({va}): {pfn} is {role:?}"),
        }
    }
}

impl<T: Tlb, R: LockPolicy> KernelHeap for MemoryManager<'_, T, R> {
    fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        Self::kmalloc(self, size)
    }

    fn kfree(&self, ptr: NonNull<u8>) {
        Self::kfree(self, ptr);
    }
}
