use crate::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use core::fmt;
use core::ops::Add;

/// Page-frame number: the index of a 4 KiB physical frame.
///
/// 32-bit x86 addresses at most 4 GiB of physical memory, i.e. `2^20` frames,
/// so the number always fits into a `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pfn = Pfn::containing(PhysicalAddress::new(0x0000_5123));
/// assert_eq!(pfn.as_u32(), 5);
/// assert_eq!(pfn.base().as_u64(), 0x5000);
/// assert!(Pfn::new(8).is_aligned(3));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u32);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Convert a descriptor-table index into a frame number.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_index(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize);
        Self(index as u32)
    }

    /// The frame containing `pa`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self((pa.as_u64() >> Size4K::SHIFT) as u32)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the frame-descriptor table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 as u64) << Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.0 as u64)
    }

    /// Whether a block of `2^order` frames may start at this frame.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: u8) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }
}

impl From<PhysicalPage<Size4K>> for Pfn {
    #[inline]
    fn from(page: PhysicalPage<Size4K>) -> Self {
        Self::containing(page.base())
    }
}

impl Add<u32> for Pfn {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn(0x{:05X})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn 0x{:05X}", self.0)
    }
}
