//! # Virtual Memory Support
//!
//! i386 paging (32-bit, no PAE) for the kernel's page-table manager.
//!
//! ## What you get
//! - An [`AddressSpace`] rooted at a page directory, with range
//!   [`map`](AddressSpace::map) / [`unmap`](AddressSpace::unmap) /
//!   [`query`](AddressSpace::query).
//! - The raw entry format [`PageEntryBits`] shared by both levels.
//! - 4 KiB-aligned [`PageDirectory`] and [`PageTable`] wrappers with typed
//!   indices.
//! - Local [`Tlb`] maintenance.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//!  CR3 → PD ──PS=0──► PT ──► 4 KiB page
//!         └───PS=1──────────► 4 MiB page
//! ```
//!
//! | Level | Table | Entry | Description |
//! |:------|:------|:------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | Referenced by `CR3`. Each entry links a PT, or maps 4 MiB directly if `PS=1`. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps one 4 KiB page. |
//!
//! Both tables hold 1024 entries of 4 bytes and span exactly one frame.
//! Page tables are taken from a [`FrameAlloc`] on first use and must be
//! reachable through the [`PhysMapper`], which for the kernel means the
//! linear zone.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod page_entry_bits;
pub mod page_table;
mod tlb;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdEntryKind, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::tlb::{LocalTlb, Tlb};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of zeroable 4 KiB frames for page tables.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// Turns a physical address into a usable reference.
pub trait PhysMapper {
    /// # Safety
    /// `pa` must be mapped, suitably aligned for `T`, and hold a valid `T`
    /// that nothing else references for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the [`PageDirectory`] stored in `page`.
    #[inline]
    fn pd_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        // SAFETY: page-table frames are owned by the paging code.
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the [`PageTable`] stored in `page`.
    #[inline]
    fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: page-table frames are owned by the paging code.
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }
}

#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use kernel_memory_addresses::VirtualAddress;

    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
        }
    }

    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    impl Aligned4K {
        const fn new_zeroed() -> Self {
            Self([0u8; 4096])
        }
    }

    /// Simulated physical memory: frame `n` lives at physical `n * 4096`.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                // Garbage so that missing zeroing shows up as stray entries.
                let mut frame = Aligned4K::new_zeroed();
                frame.0.fill(0xA5);
                v.push(frame);
            }
            Self { frames: v }
        }

        fn frame_mut_ptr(&self, idx: usize) -> *mut u8 {
            (&raw const self.frames[idx]).cast::<u8>().cast_mut()
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            debug_assert_eq!(off, 0);
            // SAFETY: the caller promises `T` matches the bytes in the frame.
            unsafe { &mut *self.frame_mut_ptr(idx).cast::<T>() }
        }
    }

    /// Records invalidations and pretends `root` is loaded.
    #[derive(Default)]
    struct RecordingTlb {
        root: Option<PhysicalPage<Size4K>>,
        flushed: RefCell<Vec<u64>>,
    }

    impl Tlb for RecordingTlb {
        fn active_root(&self) -> Option<PhysicalPage<Size4K>> {
            self.root
        }

        fn invalidate_page(&self, va: VirtualAddress) {
            self.flushed.borrow_mut().push(va.as_u64());
        }
    }

    fn setup(frames: usize) -> (TestPhys, BumpAlloc) {
        (
            TestPhys::with_frames(frames),
            BumpAlloc::new(0, (frames as u64) << 12),
        )
    }

    #[test]
    fn map_creates_table_and_leaves() {
        let (phys, mut alloc) = setup(16);
        let tlb = RecordingTlb::default();
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xC010_0000);
        let pa = PhysicalAddress::new(0x0030_0000);
        let n = aspace.map(&mut alloc, &tlb, va, pa, 3 * 4096, PageEntryBits::kernel_rw());
        assert_eq!(n, 3);

        let pd = phys.pd_mut(aspace.root_page());
        let pde = pd.get(PdIndex::from(va));
        let pt_page = pde.next_table().expect("page table linked");
        assert!(pde.bits().writable());

        let pt = phys.pt_mut(pt_page);
        assert_eq!(pt.present_count(), 3, "fresh table must be zeroed");
        let (page, bits) = pt.get(PtIndex::from(va + 0x2000)).page_4k().unwrap();
        assert_eq!(page.base().as_u64(), 0x0030_2000);
        assert!(bits.writable() && !bits.user_access());

        // Inactive space: no invalidation.
        assert!(tlb.flushed.borrow().is_empty());
    }

    #[test]
    fn map_crossing_directory_slot_allocates_two_tables() {
        let (phys, mut alloc) = setup(16);
        let tlb = RecordingTlb::default();
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xC03F_F000);
        aspace.map(&mut alloc, &tlb, va, PhysicalAddress::new(0x1000), 2 * 4096, PageEntryBits::kernel_rw());
        // Root plus two page tables.
        assert_eq!(alloc.next, 3 * 4096);
        assert_eq!(aspace.query(va + 0x1000), Some(PhysicalAddress::new(0x2000)));
    }

    #[test]
    fn remapping_identical_entries_is_a_no_op() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let tlb = RecordingTlb {
            root: Some(aspace.root_page()),
            ..RecordingTlb::default()
        };

        let va = VirtualAddress::new(0xF880_0000);
        let pa = PhysicalAddress::new(0x0800_0000);
        assert_eq!(aspace.map(&mut alloc, &tlb, va, pa, 4096, PageEntryBits::kernel_rw()), 1);
        assert_eq!(*tlb.flushed.borrow(), vec![0xF880_0000]);

        // CPU sets accessed/dirty; the translation is still the same.
        let pt = phys.pt_mut(phys.pd_mut(aspace.root_page()).get(PdIndex::from(va)).next_table().unwrap());
        let touched = pt.get(PtIndex::from(va)).bits().with_accessed(true).with_dirty(true);
        pt.set(PtIndex::from(va), PtEntry::present_with(touched, touched.physical_page()));

        assert_eq!(aspace.map(&mut alloc, &tlb, va, pa, 4096, PageEntryBits::kernel_rw()), 0);
        assert_eq!(tlb.flushed.borrow().len(), 1);

        // Different rights do get written and flushed.
        assert_eq!(aspace.map(&mut alloc, &tlb, va, pa, 4096, PageEntryBits::kernel_ro()), 1);
        assert_eq!(tlb.flushed.borrow().len(), 2);
    }

    #[test]
    fn unmap_skips_holes_and_flushes_active_space() {
        let (phys, mut alloc) = setup(16);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let tlb = RecordingTlb {
            root: Some(aspace.root_page()),
            ..RecordingTlb::default()
        };

        let va = VirtualAddress::new(0xF900_0000);
        aspace.map(&mut alloc, &tlb, va, PhysicalAddress::new(0x5000), 4096, PageEntryBits::kernel_rw());
        aspace.map(&mut alloc, &tlb, va + 0x2000, PhysicalAddress::new(0x7000), 4096, PageEntryBits::kernel_rw());
        tlb.flushed.borrow_mut().clear();

        // Covers a hole and a directory slot without a table.
        let cleared = aspace.unmap(&tlb, va, 0x80_0000);
        assert_eq!(cleared, 2);
        assert_eq!(*tlb.flushed.borrow(), vec![0xF900_0000, 0xF900_2000]);
        assert_eq!(aspace.query(va), None);

        // Nothing left to do the second time around.
        assert_eq!(aspace.unmap(&tlb, va, 0x3000), 0);
    }

    #[test]
    fn query_large_page() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xC040_0000);
        let big = PhysicalPage::from_addr(PhysicalAddress::new(0x0080_0000));
        phys.pd_mut(aspace.root_page())
            .set(PdIndex::from(va), PdEntry::present_leaf_with(PageEntryBits::kernel_rw(), big));

        assert_eq!(
            aspace.query(va + 0x12_3456),
            Some(PhysicalAddress::new(0x0092_3456))
        );
        let tlb = RecordingTlb::default();
        assert_eq!(
            aspace.try_map(&mut alloc, &tlb, va + 0x1000, PhysicalAddress::zero(), 4096, PageEntryBits::kernel_rw()),
            Err(MapError::LargePageInTheWay(va + 0x1000))
        );
        assert_eq!(aspace.unmap(&tlb, va, 0x40_0000), 1024);
        assert_eq!(aspace.query(va), None);
    }

    #[test]
    fn try_map_reports_exhaustion() {
        let (phys, mut alloc) = setup(1);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let tlb = RecordingTlb::default();
        let va = VirtualAddress::new(0xC000_0000);
        assert_eq!(
            aspace.try_map(&mut alloc, &tlb, va, PhysicalAddress::zero(), 4096, PageEntryBits::kernel_rw()),
            Err(MapError::OutOfMemory(va))
        );
    }

    #[test]
    #[should_panic(expected = "kernel mapping failed")]
    fn map_panics_on_exhaustion() {
        let (phys, mut alloc) = setup(1);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let tlb = RecordingTlb::default();
        aspace.map(&mut alloc, &tlb, VirtualAddress::new(0xC000_0000), PhysicalAddress::zero(), 4096, PageEntryBits::kernel_rw());
    }

    #[test]
    fn dump_lists_present_entries() {
        let (phys, mut alloc) = setup(8);
        let tlb = RecordingTlb::default();
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xC000_0000);
        aspace.map(&mut alloc, &tlb, va, PhysicalAddress::zero(), 4096, PageEntryBits::kernel_rw().with_global(true));
        aspace.map(&mut alloc, &tlb, va + 0x2000, PhysicalAddress::new(0x2000), 4096, PageEntryBits::kernel_ro());

        let mut out = String::new();
        aspace.dump(&mut out, va, 0x40_0000).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "PDE 0x300 [0xC0000000] -> PT 0x00001000",
                "    0xC0000000 -> 0x00000000 rw s g",
                "    0xC0002000 -> 0x00002000 ro s -",
            ]
        );
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }
}
