//! # Address Space (i386, page-directory rooted)
//!
//! Strongly typed helpers to build and manipulate a single two-level address
//! space.
//!
//! ## Highlights
//!
//! - [`AddressSpace::try_map`] / [`AddressSpace::map`] install a range of
//!   4 KiB mappings, creating missing page tables on the way.
//! - [`AddressSpace::unmap`] clears a range; holes are skipped.
//! - [`AddressSpace::query`] translates a VA to a PA (handles 4 MiB leaves).
//! - [`AddressSpace::dump`] lists the present entries of a range.
//!
//! ## Design
//!
//! - Directory entries are created with [`PageEntryBits::table_link`]; the
//!   leaf flags passed by the caller decide the effective rights.
//! - Page tables are never freed once created.
//! - Changes to the active address space are followed by an `invlpg` of the
//!   affected page on the calling CPU.

use crate::page_table::pd::{PageDirectory, PdEntry, PdEntryKind, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::page_table::{ENTRIES, split_indices};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, Tlb};
use core::fmt;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};
use log::debug;

/// Why a mapping could not be installed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for the page table covering this address.
    #[error("out of memory allocating the page table for {0}")]
    OutOfMemory(VirtualAddress),
    /// A 4 MiB mapping already covers this address.
    #[error("{0} is covered by a 4 MiB page")]
    LargePageInTheWay(VirtualAddress),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and clear a fresh page directory.
    ///
    /// Returns `None` if `alloc` has no frame left.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Option<Self> {
        let root = alloc.alloc_4k()?;
        let space = Self { root, mapper };
        space.pd_mut().zero();
        debug!("new page directory at {root}");
        Some(space)
    }

    /// Wrap an existing page directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the page directory.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Whether this space is the one loaded on the calling CPU.
    #[inline]
    pub fn is_active<T: Tlb + ?Sized>(&self, tlb: &T) -> bool {
        tlb.active_root() == Some(self.root)
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The code and data currently executing must stay mapped in the target
    /// space, and paging must be set up for 32-bit non-PAE operation.
    #[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
    #[inline]
    pub unsafe fn activate(&self) {
        use kernel_registers::{Cr3, StoreRegisterUnsafe};
        unsafe { Cr3::from_page_directory(self.root).store_unsafe() }
    }

    #[inline]
    fn pd_mut(&self) -> &mut PageDirectory {
        self.mapper.pd_mut(self.root)
    }

    #[inline]
    fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        self.mapper.pt_mut(page)
    }

    /// Return the page table covering `va`, linking a fresh one if needed.
    fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        pdi: PdIndex,
        va: VirtualAddress,
    ) -> Result<&mut PageTable, MapError> {
        let pd = self.pd_mut();
        match pd.get(pdi).kind() {
            Some(PdEntryKind::NextPageTable(page, _)) => Ok(self.pt_mut(page)),
            Some(PdEntryKind::Leaf4MiB(..)) => Err(MapError::LargePageInTheWay(va)),
            None => {
                let page = alloc.alloc_4k().ok_or(MapError::OutOfMemory(va))?;
                let pt = self.pt_mut(page);
                pt.zero();
                pd.set(pdi, PdEntry::present_next_with(PageEntryBits::table_link(), page));
                debug!("page table {page} now covers {}", pdi.base());
                Ok(pt)
            }
        }
    }

    /// Map `[va, va + size)` to `[pa, pa + size)` in 4 KiB steps.
    ///
    /// Entries that already hold the same translation (ignoring the
    /// accessed/dirty bits) are left untouched. Every changed entry of the
    /// active space is invalidated on the calling CPU. Returns the number of
    /// entries written.
    ///
    /// # Errors
    /// On failure the pages before the failing address stay mapped.
    pub fn try_map<A: FrameAlloc, T: Tlb + ?Sized>(
        &self,
        alloc: &mut A,
        tlb: &T,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<usize, MapError> {
        assert!(va.is_aligned::<Size4K>(), "unaligned virtual address {va}");
        assert!(pa.is_aligned::<Size4K>(), "unaligned physical address {pa}");

        let active = self.is_active(tlb);
        let mut written = 0;
        let mut offset = 0;
        while offset < size {
            let page_va = va + offset;
            let (pdi, pti) = split_indices(page_va);
            let pt = self.ensure_table(alloc, pdi, page_va)?;

            let new = PtEntry::present_with(flags, PhysicalPage::containing_address(pa + offset));
            let old = pt.get(pti);
            if !(old.is_present() && old.bits().same_mapping(new.bits())) {
                pt.set(pti, new);
                if active {
                    tlb.invalidate_page(page_va);
                }
                written += 1;
            }
            offset += PAGE_SIZE;
        }
        Ok(written)
    }

    /// Like [`try_map`](Self::try_map), for callers that cannot recover.
    ///
    /// # Panics
    /// If a page table cannot be allocated or a 4 MiB page is in the way.
    pub fn map<A: FrameAlloc, T: Tlb + ?Sized>(
        &self,
        alloc: &mut A,
        tlb: &T,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> usize {
        match self.try_map(alloc, tlb, va, pa, size, flags) {
            Ok(n) => n,
            Err(e) => panic!("kernel mapping failed: {e}"),
        }
    }

    /// Clear every present entry in `[va, va + size)`.
    ///
    /// Missing page tables and non-present entries are skipped. A 4 MiB leaf
    /// is cleared if the range covers it completely. Returns the number of
    /// 4 KiB pages that were mapped before.
    ///
    /// # Panics
    /// If the range covers only part of a 4 MiB leaf.
    pub fn unmap<T: Tlb + ?Sized>(&self, tlb: &T, va: VirtualAddress, size: u64) -> usize {
        assert!(va.is_aligned::<Size4K>(), "unaligned virtual address {va}");

        let active = self.is_active(tlb);
        let end = va.as_u64().saturating_add(size);
        let pd = self.pd_mut();
        let mut cleared = 0;
        let mut cursor = va.as_u64();
        while cursor < end {
            let page_va = VirtualAddress::new(cursor);
            let (pdi, pti) = split_indices(page_va);
            match pd.get(pdi).kind() {
                None => {
                    // Skip to the next directory slot.
                    cursor = (cursor | 0x3F_FFFF) + 1;
                }
                Some(PdEntryKind::Leaf4MiB(..)) => {
                    let covers = page_va.is_aligned::<Size4M>() && end - cursor >= 0x40_0000;
                    assert!(covers, "unmap of {page_va} would split a 4 MiB page");
                    pd.set_zero(pdi);
                    if active {
                        for i in 0..ENTRIES as u64 {
                            tlb.invalidate_page(page_va + i * PAGE_SIZE);
                        }
                    }
                    cleared += ENTRIES;
                    cursor += 0x40_0000;
                }
                Some(PdEntryKind::NextPageTable(page, _)) => {
                    let pt = self.pt_mut(page);
                    if pt.get(pti).is_present() {
                        pt.set_zero(pti);
                        if active {
                            tlb.invalidate_page(page_va);
                        }
                        cleared += 1;
                    }
                    cursor += PAGE_SIZE;
                }
            }
        }
        cleared
    }

    /// Translate `va`, if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (pdi, pti) = split_indices(va);
        match self.pd_mut().get(pdi).kind()? {
            PdEntryKind::Leaf4MiB(base, _) => Some(base.base() + va.offset::<Size4M>()),
            PdEntryKind::NextPageTable(page, _) => {
                let (base, _) = self.pt_mut(page).get(pti).page_4k()?;
                Some(base.base() + va.offset::<Size4K>())
            }
        }
    }

    /// The leaf flags of the page containing `va`, if mapped.
    #[must_use]
    pub fn flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let (pdi, pti) = split_indices(va);
        match self.pd_mut().get(pdi).kind()? {
            PdEntryKind::Leaf4MiB(_, bits) => Some(bits),
            PdEntryKind::NextPageTable(page, _) => {
                self.pt_mut(page).get(pti).page_4k().map(|(_, bits)| bits)
            }
        }
    }

    /// Write the present directory and table entries of `[va, va + size)`.
    ///
    /// One line per directory entry, then one indented line per present
    /// page-table entry:
    ///
    /// ```text
    /// PDE 0x300 [0xC0000000] -> PT 0x00103000
    ///     0xC0000000 -> 0x00000000 rw s -
    /// ```
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump<W: fmt::Write>(&self, w: &mut W, va: VirtualAddress, size: u64) -> fmt::Result {
        let start = va.align_down::<Size4K>().as_u64();
        let end = va.as_u64().saturating_add(size);
        let pd = self.pd_mut();
        let mut cursor = start;
        while cursor < end {
            let pdi = PdIndex::from(VirtualAddress::new(cursor));
            let slot_end = (cursor | 0x3F_FFFF) + 1;
            match pd.get(pdi).kind() {
                None => {}
                Some(PdEntryKind::Leaf4MiB(page, bits)) => {
                    writeln!(
                        w,
                        "PDE 0x{:03X} [{}] -> 4M {} {}",
                        pdi.as_usize(),
                        pdi.base(),
                        page.base(),
                        FlagStr(bits)
                    )?;
                }
                Some(PdEntryKind::NextPageTable(page, _)) => {
                    writeln!(
                        w,
                        "PDE 0x{:03X} [{}] -> PT {}",
                        pdi.as_usize(),
                        pdi.base(),
                        page.base()
                    )?;
                    let pt = self.pt_mut(page);
                    let mut inner = cursor;
                    while inner < slot_end.min(end) {
                        let page_va = VirtualAddress::new(inner);
                        if let Some((frame, bits)) = pt.get(PtIndex::from(page_va)).page_4k() {
                            writeln!(w, "    {page_va} -> {} {}", frame.base(), FlagStr(bits))?;
                        }
                        inner += PAGE_SIZE;
                    }
                }
            }
            cursor = slot_end;
        }
        Ok(())
    }
}

/// Compact `rw`/`ro`, user/supervisor and global rendering of entry flags.
struct FlagStr(PageEntryBits);

impl fmt::Display for FlagStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.0;
        f.write_str(if bits.writable() { "rw" } else { "ro" })?;
        f.write_str(if bits.user_access() { " u" } else { " s" })?;
        f.write_str(if bits.global() { " g" } else { " -" })
    }
}
