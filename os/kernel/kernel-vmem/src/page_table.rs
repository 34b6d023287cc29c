//! # Page Directory and Page Table
//!
//! Both levels of 32-bit paging are 4 KiB tables of 1024 four-byte entries.
//! A linear address splits as:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at either level.
pub const ENTRIES: usize = 1024;

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let (pd, pt) = split_indices(VirtualAddress::new(0xC012_3456));
        assert_eq!(pd.as_usize(), 0x300);
        assert_eq!(pt.as_usize(), 0x123);

        let (pd, pt) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!((pd.as_usize(), pt.as_usize()), (1023, 1023));
    }
}
