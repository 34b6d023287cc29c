//! # Page Table (PT)
//!
//! The leaf level. Every present entry maps one 4 KiB page; bit 7 is PAT
//! here, not PS.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Index into a page table (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtIndex(u16);

impl PtIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u64() >> 12) & 0x3FF) as u16)
    }

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
}

/// One page-table entry.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

impl PtEntry {
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

    /// Map `page` with `flags`; the present bit is always set.
    #[inline]
    #[must_use]
    pub const fn present_with(flags: PageEntryBits, page: PhysicalPage<Size4K>) -> Self {
        Self(flags.with_present(true).with_physical_address(page.base()))
    }

    /// The mapped page and its flags, if present.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if self.0.present() {
            Some((self.0.physical_page(), self.0))
        } else {
            None
        }
    }
}

impl core::fmt::Debug for PtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PtEntry(0x{:08X})", self.0.into_bits())
    }
}

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PtIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PtIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: PtIndex) {
        self.set(i, PtEntry::zero());
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> PtIndex {
        PtIndex::from(va)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pt_entry_round_trip() {
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0ABC_D000));
        let e = PtEntry::present_with(PageEntryBits::kernel_ro(), page);
        let (p, f) = e.page_4k().unwrap();
        assert_eq!(p, page);
        assert!(f.present() && !f.writable());
        assert_eq!(PtEntry::zero().page_4k(), None);
    }

    #[test]
    fn present_count_tracks_sets() {
        let mut pt = PageTable::zeroed();
        let page = PhysicalPage::<Size4K>::from_number(7);
        pt.set(PtIndex::new(3), PtEntry::present_with(PageEntryBits::kernel_rw(), page));
        pt.set(PtIndex::new(1023), PtEntry::present_with(PageEntryBits::kernel_rw(), page));
        assert_eq!(pt.present_count(), 2);
        pt.set_zero(PtIndex::new(3));
        assert_eq!(pt.present_count(), 1);
    }
}
