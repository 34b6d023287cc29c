//! # Memory Manager
//!
//! Owns every allocator of the subsystem and the locks around them. One
//! value is created at boot; tests build as many independent instances as
//! they like over simulated RAM.
//!
//! ## Lock order
//!
//! ```text
//! vma ─► kernel page tables ─► frames ─► slab cache
//!                                early heap (leaf)
//! ```
//!
//! A lock is only ever taken while holding locks to its left. Nothing grows a
//! `Vec` while the frame lock is held: the global allocator may route back
//! into [`kmalloc`](MemoryManager::kmalloc), which takes that lock itself.

use crate::early_heap::{EarlyArena, EarlyHeap};
use crate::frame::{Frame, FrameRole};
use crate::frame_alloc::{FrameAllocator, ZoneHint, ZoneId};
use crate::phys_mapper::LinearMap;
use crate::slab::{CacheId, CacheStats, SlabCache, SlabError};
use crate::vma::VmaAllocator;
use crate::vmm::VmallocError;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{
    HIGHMEM_START, KERNEL_VIRTUAL_BASE, PAGE_SIZE, SLAB_CEILING, SLAB_MIN_OBJECT, VMALLOC_END,
    VMALLOC_START,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Pfn, Size4K, VirtualAddress};
use kernel_sync::{LockPolicy, Mutex, MutexGuard, RawSpin};
use kernel_vmem::{AddressSpace, PageEntryBits, Tlb};
use log::{error, info};

/// Number of `kmalloc` size classes: 32, 64, … [`SLAB_CEILING`] bytes.
pub const SIZE_CLASSES: usize =
    (SLAB_CEILING.trailing_zeros() - SLAB_MIN_OBJECT.trailing_zeros() + 1) as usize;

/// Where things live; defaults to the kernel's fixed layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryConfig {
    /// First physical address of the highmem zone; also the size of the
    /// linear map.
    pub highmem_start: PhysicalAddress,
    /// Where physical address zero appears in the kernel's address space.
    pub kernel_virtual_base: VirtualAddress,
    /// The `vmalloc` window `[vmalloc_start, vmalloc_end)`.
    pub vmalloc_start: VirtualAddress,
    pub vmalloc_end: VirtualAddress,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            highmem_start: PhysicalAddress::new(HIGHMEM_START),
            kernel_virtual_base: VirtualAddress::new(KERNEL_VIRTUAL_BASE),
            vmalloc_start: VirtualAddress::new(VMALLOC_START),
            vmalloc_end: VirtualAddress::new(VMALLOC_END),
        }
    }
}

/// Snapshot of the allocators' occupancy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryStats {
    pub free_frames: [usize; 2],
    pub managed_frames: [usize; 2],
    pub early_free_bytes: usize,
    pub busy_vmas: usize,
    pub free_vma_pages: u64,
}

/// The kernel's memory-management state.
///
/// `T` invalidates translations on the calling CPU; `R` is the raw lock
/// guarding the allocators.
pub struct MemoryManager<'m, T: Tlb, R: LockPolicy = RawSpin> {
    pub(crate) config: MemoryConfig,
    pub(crate) linear: LinearMap,
    pub(crate) tlb: T,
    pub(crate) frames: Mutex<FrameAllocator<'m>, R>,
    pub(crate) early: Mutex<EarlyHeap<'m>, R>,
    pub(crate) vma: Mutex<VmaAllocator, R>,
    pub(crate) kernel_root: Mutex<Option<PhysicalPage<Size4K>>, R>,
    pub(crate) size_classes: [SlabCache; SIZE_CLASSES],
    next_cache_id: AtomicU16,
    pub(crate) slab_ready: AtomicBool,
}

impl<'m, T: Tlb, R: LockPolicy> MemoryManager<'m, T, R> {
    /// Set up empty allocators over `frames` (one descriptor per PFN) and
    /// the bootstrap `arena`. No frame is free until seeded.
    ///
    /// # Panics
    /// If `config.highmem_start` is not aligned to the largest frame block.
    pub fn new(config: MemoryConfig, frames: &'m mut [Frame], arena: &'m mut EarlyArena, tlb: T) -> Self {
        let highmem = Pfn::containing(config.highmem_start);
        #[allow(clippy::cast_possible_truncation)]
        let size_classes =
            core::array::from_fn(|i| SlabCache::with_valid_size(CacheId(i as u16), SLAB_MIN_OBJECT << i));
        #[allow(clippy::cast_possible_truncation)]
        let next_cache_id = AtomicU16::new(SIZE_CLASSES as u16);
        Self {
            linear: LinearMap::new(config.kernel_virtual_base.as_u64(), config.highmem_start.as_u64()),
            config,
            tlb,
            frames: Mutex::new(FrameAllocator::new(frames, highmem)),
            early: Mutex::new(EarlyHeap::new(arena)),
            vma: Mutex::new(VmaAllocator::new()),
            kernel_root: Mutex::new(None),
            size_classes,
            next_cache_id,
            slab_ready: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// TLB maintenance of the calling CPU.
    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Translation between physical memory and the linear map.
    #[inline]
    #[must_use]
    pub const fn linear(&self) -> &LinearMap {
        &self.linear
    }

    /// Seed the frame allocator from the firmware memory map. Everything
    /// below `reserved_end` (kernel image, frame table) stays reserved.
    /// Returns the number of frames handed over.
    pub fn seed_from_memory_map(&self, map: &[MemoryRegion], reserved_end: PhysicalAddress) -> usize {
        let mut frames = self.frames.lock();
        let seeded = map
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| {
                let start = region.start().max(reserved_end);
                if start < region.end() {
                    frames.add_free_range(start, region.end())
                } else {
                    0
                }
            })
            .sum();
        info!(
            "frame allocator seeded: {} linear, {} highmem frames",
            frames.managed_frames(ZoneId::Linear),
            frames.managed_frames(ZoneId::HighMem)
        );
        seeded
    }

    /// Hand `[start, end)` to the frame allocator.
    pub fn add_free_range(&self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        self.frames.lock().add_free_range(start, end)
    }

    /// Exclusive access to the frame allocator.
    ///
    /// Holding the guard blocks every other allocator path; keep it short and
    /// do not allocate from the heap meanwhile.
    pub fn frames(&self) -> MutexGuard<'_, FrameAllocator<'m>, R> {
        self.frames.lock()
    }

    /// Allocate `2^order` contiguous frames.
    pub fn alloc_pages(&self, hint: ZoneHint, order: u8) -> Option<Pfn> {
        self.frames.lock().alloc(hint, order)
    }

    /// Release a block from [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Panics
    /// See [`FrameAllocator::free`].
    pub fn free_pages(&self, pfn: Pfn) {
        self.frames.lock().free(pfn);
    }

    /// Current role of `pfn`.
    #[must_use]
    pub fn frame_role(&self, pfn: Pfn) -> FrameRole {
        self.frames.lock().frame(pfn).role()
    }

    /// Build the kernel page directory and open the `vmalloc` window.
    ///
    /// # Errors
    /// [`VmallocError::OutOfFrames`] if no frame is left for the directory,
    /// [`VmallocError::OutOfMemory`] if the window cannot be registered.
    ///
    /// # Panics
    /// If called twice.
    pub fn init_kernel_space(&self) -> Result<(), VmallocError> {
        let mut vma = self.vma.lock();
        let mut root = self.kernel_root.lock();
        assert!(root.is_none(), "kernel address space initialized twice");
        {
            let mut frames = self.frames.lock();
            let Some(space) = AddressSpace::new(&self.linear, &mut *frames) else {
                error!("no frame for the kernel page directory");
                return Err(VmallocError::OutOfFrames);
            };
            *root = Some(space.root_page());
        }
        vma.add_range(self.config.vmalloc_start, self.config.vmalloc_end)?;
        info!(
            "kernel address space ready, vmalloc window {}..{}",
            self.config.vmalloc_start, self.config.vmalloc_end
        );
        Ok(())
    }

    /// Page directory of the kernel, once built.
    #[must_use]
    pub fn kernel_root(&self) -> Option<PhysicalPage<Size4K>> {
        *self.kernel_root.lock()
    }

    /// Run `f` on the kernel address space with the frame allocator at hand.
    pub(crate) fn with_kernel_space<U>(
        &self,
        f: impl FnOnce(&AddressSpace<'_, LinearMap>, &mut FrameAllocator<'m>) -> U,
    ) -> U {
        let root = self.kernel_root.lock();
        let Some(root) = *root else {
            panic!("kernel address space is not initialized");
        };
        let mut frames = self.frames.lock();
        f(&AddressSpace::from_root(&self.linear, root), &mut *frames)
    }

    /// Map the whole linear zone at the kernel virtual base.
    pub fn map_kernel_linear(&self) -> usize {
        let size = self.config.highmem_start.as_u64();
        let mapped = self.kernel_map(
            self.config.kernel_virtual_base,
            PhysicalAddress::zero(),
            size,
            PageEntryBits::kernel_rw(),
        );
        info!("linear map: {} MiB at {}", size >> 20, self.config.kernel_virtual_base);
        mapped
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` in the kernel space.
    ///
    /// # Panics
    /// If a page table cannot be allocated.
    pub fn kernel_map(&self, va: VirtualAddress, pa: PhysicalAddress, size: u64, flags: PageEntryBits) -> usize {
        self.with_kernel_space(|space, frames| space.map(frames, &self.tlb, va, pa, size, flags))
    }

    /// Remove kernel mappings in `[va, va + size)`.
    pub fn kernel_unmap(&self, va: VirtualAddress, size: u64) -> usize {
        self.with_kernel_space(|space, _| space.unmap(&self.tlb, va, size))
    }

    /// Physical address behind a kernel virtual address.
    #[must_use]
    pub fn kernel_query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.with_kernel_space(|space, _| space.query(va))
    }

    /// Switch `kmalloc` from the bootstrap heap to the size classes.
    pub fn enable_slab(&self) {
        self.slab_ready.store(true, Ordering::Release);
        info!("slab allocator ready, {SIZE_CLASSES} size classes");
    }

    #[must_use]
    pub fn slab_ready(&self) -> bool {
        self.slab_ready.load(Ordering::Acquire)
    }

    /// A new cache for objects of `size` bytes.
    ///
    /// Each slab is one frame holding at most
    /// [`SLAB_MAX_OBJECTS`](kernel_info::memory::SLAB_MAX_OBJECTS) objects,
    /// so caches of objects smaller than 32 bytes leave part of every slab
    /// unused.
    ///
    /// # Errors
    /// See [`SlabCache::check_size`]; [`SlabError::TooManyCaches`] once the
    /// identifiers run out. A rejected size consumes no identifier.
    pub fn create_cache(&self, size: usize) -> Result<SlabCache, SlabError> {
        SlabCache::check_size(size)?;
        let id = self
            .next_cache_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| SlabError::TooManyCaches)?;
        Ok(SlabCache::with_valid_size(CacheId(id), size))
    }

    /// One object of `cache`.
    pub fn cache_alloc(&self, cache: &SlabCache) -> Option<NonNull<u8>> {
        let mut frames = self.frames.lock();
        let va = cache.alloc(&mut frames, &self.linear)?;
        NonNull::new(va.as_mut_ptr())
    }

    /// Return an object to `cache`.
    ///
    /// # Panics
    /// If `object` is not a live object of `cache`.
    pub fn cache_free(&self, cache: &SlabCache, object: NonNull<u8>) {
        let mut frames = self.frames.lock();
        cache.free(&mut frames, &self.linear, VirtualAddress::from_nonnull(object));
    }

    /// Retire an empty cache.
    ///
    /// # Panics
    /// If objects of the cache are still allocated.
    pub fn destroy_cache(&self, cache: SlabCache) {
        let stats = cache.stats();
        assert_eq!(
            stats.active_objects, 0,
            "cache {:?} destroyed with live objects",
            cache.id()
        );
        cache.check(&self.frames.lock());
    }

    /// Occupancy of the `kmalloc` size classes.
    pub fn size_class_stats(&self) -> impl Iterator<Item = CacheStats> + '_ {
        self.size_classes.iter().map(SlabCache::stats)
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let (free_frames, managed_frames) = {
            let frames = self.frames.lock();
            (
                ZoneId::ALL.map(|z| frames.free_frames(z)),
                ZoneId::ALL.map(|z| frames.managed_frames(z)),
            )
        };
        let (busy_vmas, free_vma_pages) = {
            let vma = self.vma.lock();
            (vma.busy_count(), vma.free_pages())
        };
        MemoryStats {
            free_frames,
            managed_frames,
            early_free_bytes: self.early.lock().free_bytes(),
            busy_vmas,
            free_vma_pages,
        }
    }

    /// Free blocks per zone and order.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_frames<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.frames.lock().dump(w)
    }

    /// One line per size class.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_caches<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.size_classes.iter().try_for_each(|c| c.dump(w))
    }

    /// All virtual areas in address order.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_vmas<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.vma.lock().dump(w)
    }

    /// The interval tree indexing busy areas.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_vma_tree<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.vma.lock().dump_tree(w)
    }

    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_early_heap<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.early.lock().dump(w)
    }

    /// Kernel page-table entries covering `[va, va + size)`.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_page_tables<W: fmt::Write>(&self, w: &mut W, va: VirtualAddress, size: u64) -> fmt::Result {
        self.with_kernel_space(|space, _| space.dump(w, va, size))
    }

    /// Cross-check every allocator.
    ///
    /// # Panics
    /// On the first inconsistency, after logging a dump of the broken part.
    pub fn check_consistency(&self) {
        self.vma.lock().validate();
        let frames = self.frames.lock();
        frames.check_consistency();
        for cache in &self.size_classes {
            cache.check(&frames);
        }
    }

    /// Size class serving `size` bytes, if any.
    pub(crate) fn size_class(&self, size: usize) -> Option<&SlabCache> {
        if size > SLAB_CEILING {
            return None;
        }
        let class = size.max(SLAB_MIN_OBJECT).next_power_of_two().trailing_zeros()
            - SLAB_MIN_OBJECT.trailing_zeros();
        self.size_classes.get(class as usize)
    }

    /// Size class with identifier `id`, if it is one.
    pub(crate) fn size_class_by_id(&self, id: CacheId) -> Option<&SlabCache> {
        self.size_classes.get(usize::from(id.0))
    }
}

/// Frames needed for `size` bytes, as a buddy order.
pub(crate) fn pages_order(size: usize) -> Option<u8> {
    let pages = (size as u64).div_ceil(PAGE_SIZE);
    #[allow(clippy::cast_possible_truncation)]
    pages.checked_next_power_of_two().map(|p| p.trailing_zeros() as u8)
}
