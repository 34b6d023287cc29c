use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3 — Page-Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical base of the page directory and the cache-control flags
/// used when the MMU walks it.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2 — Ignored.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the page directory.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the page directory.
    pub pcd: bool,

    /// Bits 5–11 — Ignored.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31 — page-directory physical base >> 12.
    #[bits(20)]
    page_directory_4k: u32,
}

impl Cr3 {
    /// Create a `Cr3` value pointing at the page directory in `page`.
    #[must_use]
    pub fn from_page_directory(page: PhysicalPage<Size4K>) -> Self {
        debug_assert!(
            page.base().as_u64() <= u64::from(u32::MAX),
            "page directory must live below 4 GiB"
        );
        let mut cr3 = Self::new();
        #[allow(clippy::cast_possible_truncation)]
        cr3.set_page_directory_4k((page.base().as_u64() >> 12) as u32);
        cr3
    }

    /// The page holding the page directory.
    #[must_use]
    pub fn page_directory(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(
            u64::from(self.page_directory_4k()) << 12,
        ))
    }
}

#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
impl LoadRegisterUnsafe for Cr3 {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn load_unsafe() -> Self {
        let cr3: usize;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3 as u32)
    }
}

#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits() as usize;
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_directory_round_trips_through_bits() {
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0012_3000));
        let cr3 = Cr3::from_page_directory(page).with_pwt(true);
        assert_eq!(cr3.into_bits(), 0x0012_3008);
        assert_eq!(cr3.page_directory(), page);
        assert!(!cr3.pcd());
    }
}
