//! # Kernel Memory Layout and Boot Interface
//!
//! Compile-time layout of the 32-bit kernel and the shape of the physical
//! memory map the boot stage hands over.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │          User Space             │
//! KERNEL_     ├─────────────────────────────────┤ 0xC000_0000
//! VIRTUAL_    │   Linear map of physical RAM    │
//! BASE        │   (first 896 MiB, "lowmem")     │
//!             ├─────────────────────────────────┤ 0xF800_0000
//!             │          Guard gap              │
//! VMALLOC_    ├─────────────────────────────────┤ 0xF880_0000
//! START       │  vmalloc / vmap window          │
//! VMALLOC_END ├─────────────────────────────────┤ 0xFF80_0000
//!             │   Fixed mappings (reserved)     │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Physical frames below [`HIGHMEM_START`](memory::HIGHMEM_START) are
//! reachable through the linear map at `KERNEL_VIRTUAL_BASE + pa`; frames above
//! it ("highmem") have no permanent kernel mapping and are only usable through
//! explicit page-table mappings such as `vmalloc`.
//!
//! ## Modules
//! * [`memory`] — layout constants, allocator geometry and their compile-time checks.
//! * [`boot`] — the e820-style physical memory map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
