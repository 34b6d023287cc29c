//! # Boot Memory Map
//!
//! The boot stage probes physical memory (BIOS `e820`) and leaves the result
//! for the kernel. The frame allocator consumes it exactly once while seeding.

use kernel_memory_addresses::PhysicalAddress;

/// Region type as reported by the firmware.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM.
    Usable = 1,
    /// Reserved by firmware or hardware.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    Unusable = 5,
}

impl MemoryKind {
    /// Decode the raw firmware type; unknown values are treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Unusable,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the physical memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// First byte of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub size: u64,
    /// What the region may be used for.
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: MemoryKind) -> Self {
        Self { base, size, kind }
    }

    /// First byte of the region.
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.size))
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryKind::Usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_are_reserved() {
        assert_eq!(MemoryKind::from_raw(1), MemoryKind::Usable);
        assert_eq!(MemoryKind::from_raw(2), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_raw(0xdead), MemoryKind::Reserved);
    }

    #[test]
    fn region_bounds() {
        let r = MemoryRegion::new(0x10_0000, 0x7F0_0000, MemoryKind::Usable);
        assert_eq!(r.start().as_u64(), 0x10_0000);
        assert_eq!(r.end().as_u64(), 0x800_0000);
        assert!(r.is_usable());
        assert!(!MemoryRegion::new(0, 0x1000, MemoryKind::Reserved).is_usable());
    }
}
