//! # Linear-Map PhysMapper for Kernel Virtual Memory
//!
//! The kernel keeps the low part of physical memory (the linear zone)
//! permanently mapped at a fixed offset. Physical address `pa` below the
//! limit is visible at `virt_base + pa`, so converting between the two is
//! plain arithmetic.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses. Page tables, slab frames
//!   and heap pages are allocated as physical frames and must be touched
//!   through their linear-map alias.
//! - Host-side tests simulate RAM with a heap buffer; they build a
//!   [`LinearMap`] whose base is that buffer's address.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::LinearMap;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! let map = LinearMap::kernel();
//! let va = map.phys_to_virt(PhysicalAddress::new(0x0010_0000)).unwrap();
//! assert_eq!(va, VirtualAddress::new(0xC010_0000));
//! assert_eq!(map.virt_to_phys(va), Some(PhysicalAddress::new(0x0010_0000)));
//! assert_eq!(map.phys_to_virt(PhysicalAddress::new(0x3800_0000)), None);
//! ```

use kernel_info::memory::{KERNEL_VIRTUAL_BASE, LINEAR_MAP_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Pfn, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for memory below the highmem threshold.
///
/// # Safety
/// - The linear map must be present and cover `[0, limit)`.
/// - References returned by [`PhysMapper::phys_to_mut`] are only valid for
///   memory the caller owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinearMap {
    virt_base: u64,
    limit: u64,
}

impl LinearMap {
    /// The kernel's own linear map.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new(KERNEL_VIRTUAL_BASE, LINEAR_MAP_SIZE)
    }

    /// Physical `[0, limit)` visible at `virt_base`.
    #[must_use]
    pub const fn new(virt_base: u64, limit: u64) -> Self {
        Self { virt_base, limit }
    }

    /// One past the highest physical address covered.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.limit)
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        if pa.as_u64() < self.limit {
            Some(VirtualAddress::new(self.virt_base + pa.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match va.as_u64().checked_sub(self.virt_base) {
            Some(off) if off < self.limit => Some(PhysicalAddress::new(off)),
            _ => None,
        }
    }

    /// Virtual address of the first byte of `pfn`.
    #[inline]
    #[must_use]
    pub const fn pfn_to_virt(&self, pfn: Pfn) -> Option<VirtualAddress> {
        self.phys_to_virt(pfn.base())
    }

    /// Frame containing the linear-map address `va`.
    #[inline]
    #[must_use]
    pub const fn virt_to_pfn(&self, va: VirtualAddress) -> Option<Pfn> {
        match self.virt_to_phys(va) {
            Some(pa) => Some(Pfn::containing(pa)),
            None => None,
        }
    }
}

impl PhysMapper for LinearMap {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(va) = self.phys_to_virt(pa) else {
            panic!("{pa} is outside the linear map");
        };
        // SAFETY: the caller guarantees the frame holds a `T` it owns.
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }
}
