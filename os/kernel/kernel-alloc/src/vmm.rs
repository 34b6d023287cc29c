//! # `vmalloc` and `vmap`
//!
//! Virtually contiguous kernel memory in the `vmalloc` window.
//!
//! * [`vmalloc`](MemoryManager::vmalloc) reserves an area, backs every page
//!   with a frame of its own (highmem preferred) and maps it.
//! * [`vmap`](MemoryManager::vmap) maps frames the caller already owns.
//!
//! Both are all-or-nothing: when a frame or page table runs out midway,
//! every page mapped so far is unmapped, every frame taken is returned and
//! the area is released before the error is reported.

use crate::frame::FrameUsage;
use crate::frame_alloc::{FrameAllocator, ZoneHint};
use crate::manager::MemoryManager;
use crate::phys_mapper::LinearMap;
use crate::vma::{Backing, VmaAllocator, VmaId};
use alloc::vec::Vec;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{Pfn, VirtualAddress};
use kernel_sync::LockPolicy;
use kernel_vmem::{AddressSpace, PageEntryBits, Tlb};
use log::{debug, error, warn};

/// Why a virtual allocation failed. Nothing was left allocated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmallocError {
    /// No free area in the window is large enough.
    #[error("virtual address space exhausted")]
    AddressSpaceExhausted,
    /// No frame for a page or a page table.
    #[error("out of physical frames")]
    OutOfFrames,
    /// Bookkeeping storage could not grow.
    #[error("out of memory for bookkeeping")]
    OutOfMemory,
}

impl<T: Tlb, R: LockPolicy> MemoryManager<'_, T, R> {
    /// Allocate `size` bytes of virtually contiguous, page-aligned memory.
    ///
    /// # Errors
    /// See [`VmallocError`].
    ///
    /// # Panics
    /// If `size` is zero or the kernel address space is not initialized.
    pub fn vmalloc(&self, size: usize) -> Result<VirtualAddress, VmallocError> {
        assert!(size > 0, "vmalloc of zero bytes");
        if (size as u64) < PAGE_SIZE {
            warn!("vmalloc of {size} bytes occupies a whole page; use kmalloc");
        }

        let mut vmas = self.vma.lock();
        let (id, start, pages) = reserve(&mut vmas, size as u64)?;
        let mut owned = Vec::new();
        if owned.try_reserve_exact(pages).is_err() {
            error!("vmalloc: no memory to track {pages} frames");
            vmas.free(id);
            return Err(VmallocError::OutOfMemory);
        }

        let mapped = self.with_kernel_space(|space, frames| {
            for i in 0..pages {
                let Some(pfn) = frames.alloc_for(ZoneHint::HighMem, 0, FrameUsage::Vmalloc) else {
                    rollback(space, frames, &self.tlb, start, &owned);
                    return Err(VmallocError::OutOfFrames);
                };
                owned.push(pfn);
                let va = page(start, i);
                let flags = PageEntryBits::kernel_rw();
                if let Err(e) = space.try_map(frames, &self.tlb, va, pfn.base(), PAGE_SIZE, flags) {
                    error!("vmalloc: {e}");
                    rollback(space, frames, &self.tlb, start, &owned);
                    return Err(VmallocError::OutOfFrames);
                }
            }
            Ok(())
        });
        if let Err(e) = mapped {
            vmas.free(id);
            return Err(e);
        }

        vmas.attach(id, Backing::Owned(owned));
        debug!("vmalloc({size}) = {start}, {pages} pages");
        Ok(start)
    }

    /// Release memory from [`vmalloc`](Self::vmalloc).
    ///
    /// # Panics
    /// If `addr` is not the start of a `vmalloc` area.
    pub fn vfree(&self, addr: VirtualAddress) {
        let mut vmas = self.vma.lock();
        let id = area_at(&vmas, addr, "vfree");
        let Some(Backing::Owned(_)) = vmas.get(id).map(|v| v.backing()) else {
            panic!("vfree({addr}): area was not created by vmalloc");
        };
        let backing = vmas.free(id);
        if let Backing::Owned(pages) = &backing {
            self.with_kernel_space(|space, frames| {
                space.unmap(&self.tlb, addr, pages.len() as u64 * PAGE_SIZE);
                for &pfn in pages {
                    frames.free(pfn);
                }
            });
        }
        // Dropping the page list may re-enter the heap; no frame lock here.
        drop(backing);
    }

    /// Map `frames` back to back into a fresh area.
    ///
    /// The frames stay owned by the caller and are not freed by
    /// [`vunmap`](Self::vunmap).
    ///
    /// # Errors
    /// See [`VmallocError`].
    ///
    /// # Panics
    /// If `frames` is empty or the kernel address space is not initialized.
    pub fn vmap(&self, frames: &[Pfn]) -> Result<VirtualAddress, VmallocError> {
        assert!(!frames.is_empty(), "vmap of no frames");
        let mut vmas = self.vma.lock();
        let (id, start, _) = reserve(&mut vmas, frames.len() as u64 * PAGE_SIZE)?;

        let mapped = self.with_kernel_space(|space, alloc| {
            for (i, pfn) in frames.iter().enumerate() {
                let va = page(start, i);
                let flags = PageEntryBits::kernel_rw();
                if let Err(e) = space.try_map(alloc, &self.tlb, va, pfn.base(), PAGE_SIZE, flags) {
                    error!("vmap: {e}");
                    space.unmap(&self.tlb, start, i as u64 * PAGE_SIZE);
                    return Err(VmallocError::OutOfFrames);
                }
            }
            Ok(())
        });
        if let Err(e) = mapped {
            vmas.free(id);
            return Err(e);
        }

        vmas.attach(id, Backing::Borrowed);
        debug!("vmap of {} frames at {start}", frames.len());
        Ok(start)
    }

    /// Undo a [`vmap`](Self::vmap).
    ///
    /// # Panics
    /// If `addr` is not the start of a `vmap` area.
    pub fn vunmap(&self, addr: VirtualAddress) {
        let mut vmas = self.vma.lock();
        let id = area_at(&vmas, addr, "vunmap");
        let Some(vma) = vmas.get(id).filter(|v| *v.backing() == Backing::Borrowed) else {
            panic!("vunmap({addr}): area was not created by vmap");
        };
        let size = vma.size();
        self.with_kernel_space(|space, _| space.unmap(&self.tlb, addr, size));
        vmas.free(id);
    }
}

/// Reserve an area; returns its id, start and page count.
#[allow(clippy::cast_possible_truncation)]
fn reserve(vmas: &mut VmaAllocator, size: u64) -> Result<(VmaId, VirtualAddress, usize), VmallocError> {
    let id = vmas.alloc(size)?;
    let Some(vma) = vmas.get(id) else {
        panic!("fresh {id:?} is not busy");
    };
    Ok((id, vma.start(), vma.pages() as usize))
}

fn area_at(vmas: &VmaAllocator, addr: VirtualAddress, what: &str) -> VmaId {
    match vmas.find(addr) {
        Some(id) if vmas.get(id).is_some_and(|v| v.start() == addr) => id,
        Some(_) => panic!("{what}({addr}): not the start of an area"),
        None => panic!("{what}({addr}): no such area"),
    }
}

#[inline]
fn page(start: VirtualAddress, index: usize) -> VirtualAddress {
    start + index as u64 * PAGE_SIZE
}

/// Undo a partial `vmalloc`: unmap the first `taken.len()` pages and free
/// their frames. Page tables allocated on demand by `try_map` stay in the
/// kernel page directory; kernel page tables are never freed.
fn rollback<T: Tlb>(
    space: &AddressSpace<'_, LinearMap>,
    frames: &mut FrameAllocator<'_>,
    tlb: &T,
    start: VirtualAddress,
    taken: &[Pfn],
) {
    space.unmap(tlb, start, taken.len() as u64 * PAGE_SIZE);
    for &pfn in taken {
        frames.free(pfn);
    }
    debug!("vmalloc at {start} rolled back, {} frames returned", taken.len());
}
