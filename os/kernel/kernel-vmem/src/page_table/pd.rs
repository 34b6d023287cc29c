//! # Page Directory (PD)
//!
//! - [`PdIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: either a link to a page table (`PS=0`) or a 4 MiB leaf (`PS=1`).
//! - [`PdEntryKind`]: decoded view of a present entry.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries.
//!
//! TLB maintenance is the caller's responsibility after mutating active mappings.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the page directory (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

impl PdIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u64() >> 22) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u64) << 22)
    }
}

/// Decoded page-directory entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdEntryKind {
    /// `PS=0`: the entry links a page table.
    NextPageTable(PhysicalPage<Size4K>, PageEntryBits),
    /// `PS=1`: the entry maps a 4 MiB page directly.
    Leaf4MiB(PhysicalPage<Size4M>, PageEntryBits),
}

/// One page-directory entry.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    /// Link `table` with `flags`; `PS` is forced to 0.
    #[inline]
    #[must_use]
    pub const fn present_next_with(flags: PageEntryBits, table: PhysicalPage<Size4K>) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_address(table.base()),
        )
    }

    /// Map the 4 MiB `page` with `flags`; `PS` is forced to 1.
    #[inline]
    #[must_use]
    pub const fn present_leaf_with(flags: PageEntryBits, page: PhysicalPage<Size4M>) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(true)
                .with_physical_address(page.base()),
        )
    }

    /// Decode the entry, or `None` if it is not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.0.present() {
            return None;
        }
        let pa = self.0.physical_address();
        if self.0.large_page() {
            // Bits 21:13 carry PAT/PSE-36 data in a 4 MiB PDE; the base is 4 MiB aligned.
            let base = PhysicalAddress::new(pa.as_u64() & !(0x3F_FFFF));
            Some(PdEntryKind::Leaf4MiB(PhysicalPage::from_addr(base), self.0))
        } else {
            Some(PdEntryKind::NextPageTable(PhysicalPage::from_addr(pa), self.0))
        }
    }

    /// The linked page table, if this is a present `PS=0` entry.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::NextPageTable(page, _)) => Some(page),
            _ => None,
        }
    }
}

impl core::fmt::Debug for PdEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PdEntry(0x{:08X})", self.0.into_bits())
    }
}

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    /// Reset every entry to non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: PdIndex) {
        self.set(i, PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> PdIndex {
        PdIndex::from(va)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pd_table_vs_4m() {
        let pt = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0030_0000));
        let e_tbl = PdEntry::present_next_with(PageEntryBits::table_link(), pt);
        match e_tbl.kind().unwrap() {
            PdEntryKind::NextPageTable(p, f) => {
                assert_eq!(p, pt);
                assert!(!f.large_page(), "must be PS=0");
            }
            PdEntryKind::Leaf4MiB(..) => panic!("expected next PT"),
        }
        assert_eq!(e_tbl.next_table(), Some(pt));

        let m4 = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(0x0400_0000));
        let e_4m = PdEntry::present_leaf_with(PageEntryBits::kernel_rw(), m4);
        match e_4m.kind().unwrap() {
            PdEntryKind::Leaf4MiB(p, f) => {
                assert_eq!(p, m4);
                assert!(f.large_page(), "must be PS=1");
            }
            PdEntryKind::NextPageTable(..) => panic!("expected 4MiB leaf"),
        }
        assert_eq!(e_4m.next_table(), None);
        assert_eq!(PdEntry::zero().kind(), None);
    }
}
