//! # Memory Layout

/// Size of a base page / physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Where the linear map of physical memory begins in the kernel's address space.
///
/// Physical address `pa` in the linear zone is visible at `KERNEL_VIRTUAL_BASE + pa`.
pub const KERNEL_VIRTUAL_BASE: u64 = 0xC000_0000;

/// Size of the linear map (896 MiB).
pub const LINEAR_MAP_SIZE: u64 = 0x3800_0000;

/// First physical address of the highmem zone.
pub const HIGHMEM_START: u64 = LINEAR_MAP_SIZE;

/// Lowest address of the `vmalloc`/`vmap` window.
pub const VMALLOC_START: u64 = 0xF880_0000;

/// One past the highest address of the `vmalloc`/`vmap` window.
pub const VMALLOC_END: u64 = 0xFF80_0000;

/// Largest buddy order of the frame allocator; blocks span up to `2^MAX_ORDER` frames.
pub const MAX_ORDER: u8 = 10;

/// Largest order a virtual-memory area may have, in pages (covers 4 GiB).
pub const MAX_VMA_ORDER: u8 = 20;

/// Size of the static bootstrap heap arena.
pub const EARLY_ARENA_SIZE: usize = 128 * 1024;

/// log2 of the smallest bootstrap heap block (32 bytes).
pub const EARLY_MIN_BLOCK_SHIFT: u32 = 5;

/// Largest order of the bootstrap heap; one block of this order spans the arena.
pub const EARLY_MAX_ORDER: u8 = 12;

/// Smallest slab size class in bytes.
pub const SLAB_MIN_OBJECT: usize = 32;

/// Largest request served by a slab size class; bigger ones take whole frames.
pub const SLAB_CEILING: usize = 2048;

/// Upper bound of objects carved out of one slab frame.
pub const SLAB_MAX_OBJECTS: usize = 128;

const _: () = {
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
    assert!(KERNEL_VIRTUAL_BASE + LINEAR_MAP_SIZE <= VMALLOC_START);
    assert!(VMALLOC_START < VMALLOC_END);
    assert!(VMALLOC_START.is_multiple_of(PAGE_SIZE) && VMALLOC_END.is_multiple_of(PAGE_SIZE));
    assert!(HIGHMEM_START.is_multiple_of(PAGE_SIZE << MAX_ORDER));
    assert!(EARLY_ARENA_SIZE == 1 << (EARLY_MIN_BLOCK_SHIFT + EARLY_MAX_ORDER as u32));
    assert!(SLAB_MIN_OBJECT.is_power_of_two() && SLAB_CEILING.is_power_of_two());
    assert!(SLAB_CEILING <= PAGE_SIZE as usize);
    assert!(PAGE_SIZE as usize / SLAB_MIN_OBJECT <= SLAB_MAX_OBJECTS);
    assert!(1u64 << (MAX_VMA_ORDER as u32 + PAGE_SHIFT) == 1u64 << 32);
};
