//! # Translation Lookaside Buffer
//!
//! Invalidation is local to the calling CPU. There is no shootdown: other
//! CPUs may keep stale translations until their next CR3 reload.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// What the page-table code needs from the MMU of the current CPU.
pub trait Tlb {
    /// The page directory currently loaded in CR3, or `None` if paging is
    /// not (yet) under our control.
    fn active_root(&self) -> Option<PhysicalPage<Size4K>>;

    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// The TLB of the CPU executing the call (`CR3` + `invlpg`).
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalTlb;

#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
impl Tlb for LocalTlb {
    fn active_root(&self) -> Option<PhysicalPage<Size4K>> {
        use kernel_registers::{Cr3, LoadRegisterUnsafe};
        // SAFETY: reading CR3 has no side effects; we run at CPL0.
        let cr3 = unsafe { Cr3::load_unsafe() };
        Some(cr3.page_directory())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn invalidate_page(&self, va: VirtualAddress) {
        let addr = va.as_u64() as usize;
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64"))))]
impl Tlb for LocalTlb {
    fn active_root(&self) -> Option<PhysicalPage<Size4K>> {
        None
    }

    fn invalidate_page(&self, _va: VirtualAddress) {}
}
