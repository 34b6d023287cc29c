use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A 32-bit x86 paging entry (PDE or PTE, non-PAE) in raw bitfield form.
///
/// ### Bit layout
///
/// | Bits  | Name   | Meaning |
/// |-------|--------|---------|
/// | 0     | `P`    | Present |
/// | 1     | `RW`   | Writable |
/// | 2     | `US`   | User-mode accessible |
/// | 3     | `PWT`  | Write-through caching |
/// | 4     | `PCD`  | Cache disable |
/// | 5     | `A`    | Accessed (set by the CPU) |
/// | 6     | `D`    | Dirty (leaf only, set by the CPU) |
/// | 7     | `PS`   | 4 MiB page (PDE only) |
/// | 8     | `G`    | Global (leaf only) |
/// | 9–11  | avail  | Free for the OS |
/// | 12–31 | addr   | Physical frame bits \[31:12\] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P).
    pub present: bool,

    /// Writable (RW). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US). Set to allow ring 3 access.
    pub user_access: bool,

    /// Page-level write-through (PWT).
    pub write_through: bool,

    /// Page-level cache disable (PCD).
    pub cache_disabled: bool,

    /// Accessed (A). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D). Set by the CPU on first write to a leaf.
    pub dirty: bool,

    /// Page size (PS). In a PDE this maps a 4 MiB page directly.
    pub large_page: bool,

    /// Global (G). Survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// Bits 9–11 available to the OS.
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number, i.e. address bits \[31:12\].
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    /// Bits the CPU writes back on its own; ignored when comparing mappings.
    const HARDWARE_MANAGED: u32 = (1 << 5) | (1 << 6);

    /// Present, writable, supervisor-only.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, supervisor-only.
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Link to a page table. The directory level is kept permissive; the
    /// leaf decides the effective rights.
    #[must_use]
    pub const fn table_link() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.as_u64() <= u32::MAX as u64, "address beyond 4 GiB");
        self.with_frame((pa.as_u64() >> 12) as u32)
    }

    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame() as u64) << 12)
    }

    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame() as u64)
    }

    /// Whether `self` and `other` describe the same translation, ignoring
    /// the accessed and dirty bits maintained by the CPU.
    #[must_use]
    pub const fn same_mapping(self, other: Self) -> bool {
        (self.into_bits() & !Self::HARDWARE_MANAGED) == (other.into_bits() & !Self::HARDWARE_MANAGED)
    }
}
