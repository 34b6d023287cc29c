//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases and frame
//! numbers used by the paging and allocation code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory. |
//! | [`Pfn`] | Index of a 4 KiB physical frame, i.e. a descriptor-table slot. |
//!
//! ## Page Sizes
//!
//! 32-bit x86 paging without PAE knows two page sizes, modelled as marker
//! types implementing [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages, mapped through a page table
//! - [`Size4M`] — 4 MiB pages, mapped directly from the page directory
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let pfn = Pfn::containing(pa);
//! assert_eq!(pfn.base(), pa.align_down::<Size4K>());
//! assert_eq!(pfn.base() + pa.offset::<Size4K>(), pa);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod pfn;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size4K, Size4M};
pub use pfn::Pfn;
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_4k() {
        let a = PhysicalAddress::new(0x1234_5678);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x1234_5000);
        assert_eq!(a.align_up::<Size4K>().as_u64(), 0x1234_6000);
        assert_eq!(a.offset::<Size4K>(), 0x678);
        assert!(!a.is_aligned::<Size4K>());
        assert!(a.align_down::<Size4K>().is_aligned::<Size4K>());
    }

    #[test]
    fn align_up_is_identity_on_aligned_input() {
        let va = VirtualAddress::new(0xC000_0000);
        assert_eq!(va.align_up::<Size4K>(), va);
        assert_eq!(va.align_up::<Size4M>(), va);
    }

    #[test]
    fn large_page_containing_address() {
        let va = VirtualAddress::new(0xC07F_FFFF);
        assert_eq!(va.page::<Size4M>().base().as_u64(), 0xC040_0000);
        assert_eq!(va.page::<Size4K>().next().base().as_u64(), 0xC080_0000);
    }

    #[test]
    fn pfn_conversions() {
        let pfn = Pfn::new(0x38000);
        assert_eq!(pfn.base().as_u64(), 0x3800_0000);
        assert_eq!(pfn.page().number(), 0x38000);
        assert_eq!(Pfn::from(pfn.page()), pfn);
        assert_eq!(pfn.index(), 0x38000);
        assert_eq!(pfn + 1, Pfn::new(0x38001));
    }

    #[test]
    fn pfn_block_alignment() {
        let head = Pfn::new(1 << 12);
        for order in 0..=12u8 {
            assert!(head.is_aligned(order));
        }
        assert!(!head.is_aligned(13));
        assert!(!Pfn::new(6).is_aligned(2));
        assert!(Pfn::new(6).is_aligned(1));
    }

    #[test]
    fn address_differences() {
        let a = VirtualAddress::new(0xF800_0000);
        let b = a + 0x3000;
        assert_eq!(b - a, 0x3000);
        assert_eq!(a.checked_add(u64::MAX), None);
    }

    #[test]
    fn debug_formats() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x00001000)"
        );
        assert_eq!(format!("{}", VirtualAddress::new(0xC000_0000)), "0xC0000000");
        assert_eq!(format!("{}", Pfn::new(0x10)), "pfn 0x00010");
    }
}
