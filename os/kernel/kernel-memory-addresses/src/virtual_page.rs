use crate::{PageSize, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Virtual memory page base for size `S`.
///
/// The low `S::SHIFT` bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(VirtualAddress, PhantomData<S>);

impl<S: PageSize> VirtualPage<S> {
    /// Wrap an address that is already aligned to `S`.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: VirtualAddress) -> Self {
        debug_assert!(base.is_aligned::<S>(), "page base must be aligned");
        Self(base, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn containing_address(va: VirtualAddress) -> Self {
        Self(va.align_down::<S>(), PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    /// The page directly after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(VirtualAddress::new(self.0.as_u64() + S::SIZE), PhantomData)
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:08X})", S::as_str(), self.0.as_u64())
    }
}
