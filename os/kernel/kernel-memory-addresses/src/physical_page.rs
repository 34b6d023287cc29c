use crate::{PageSize, PhysicalAddress, Size4K};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let page = PhysicalPage::<Size4M>::containing_address(PhysicalAddress::new(0x0065_4321));
/// assert_eq!(page.base().as_u64(), 0x0040_0000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(PhysicalAddress, PhantomData<S>);

impl<S: PageSize> PhysicalPage<S> {
    /// Wrap an address that is already aligned to `S`.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: PhysicalAddress) -> Self {
        debug_assert!(base.is_aligned::<S>(), "page base must be aligned");
        Self(base, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn containing_address(pa: PhysicalAddress) -> Self {
        Self(pa.align_down::<S>(), PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// Page number, i.e. `base >> S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> S::SHIFT
    }
}

impl PhysicalPage<Size4K> {
    /// Build the page from a 4 KiB page-frame number.
    #[inline]
    #[must_use]
    pub const fn from_number(pfn: u64) -> Self {
        Self(PhysicalAddress::new(pfn << Size4K::SHIFT), PhantomData)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:08X})", S::as_str(), self.0.as_u64())
    }
}
