//! # Kernel Memory Allocation
//!
//! Physical frames, kernel heap and virtual areas of the 32-bit kernel,
//! gathered in one [`MemoryManager`].
//!
//! ## Architecture Overview
//!
//! ```text
//!  kmalloc / kfree               vmalloc / vfree, vmap / vunmap
//!  (heap, global)                (vmm)
//!     │          │                 │                │
//!  early_heap   slab caches      vma areas        kernel-vmem
//!  (bootstrap)     │             + interval tree  page tables
//!                  │                                │
//!                  └──► frame_alloc: buddy, linear + highmem ◄──┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame allocator ([`frame_alloc`])
//! A binary buddy allocator over a table of [`Frame`](frame::Frame)
//! descriptors, one per physical frame. The descriptor records who owns a
//! frame, which is what lets `kfree` classify a pointer without a header.
//!
//! ### Slab caches ([`slab`])
//! Fixed-size objects carved from single linear frames.
//!
//! ### Heap ([`heap`], [`early_heap`], [`global`])
//! A static bootstrap arena until [`MemoryManager::enable_slab`], then
//! power-of-two size classes and whole frames. [`GlobalHeap`] puts the
//! `alloc` crate on top.
//!
//! ### Virtual areas ([`vma`], [`vmm`])
//! Page-granular areas of the `vmalloc` window, indexed by an interval tree
//! and backed by frames mapped through the kernel page tables.
//!
//! ## Typical Usage
//!
//! ```rust,no_run
//! use kernel_alloc::early_heap::EarlyArena;
//! use kernel_alloc::frame::Frame;
//! use kernel_alloc::{MemoryConfig, MemoryManager};
//! use kernel_info::boot::MemoryRegion;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::LocalTlb;
//!
//! # fn boot(frames: &'static mut [Frame], arena: &'static mut EarlyArena,
//! #         map: &[MemoryRegion], kernel_end: PhysicalAddress) {
//! let mm: MemoryManager<'_, LocalTlb> =
//!     MemoryManager::new(MemoryConfig::default(), frames, arena, LocalTlb);
//! mm.seed_from_memory_map(map, kernel_end);
//! mm.init_kernel_space().expect("no memory for the kernel page directory");
//! mm.map_kernel_linear();
//! mm.enable_slab();
//!
//! let buf = mm.kmalloc(100).unwrap();
//! mm.kfree(buf);
//! let area = mm.vmalloc(3 * 4096).unwrap();
//! mm.vfree(area);
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod buddy;
pub mod early_heap;
pub mod frame;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod list;
mod manager;
pub mod phys_mapper;
pub mod slab;
pub mod vma;
pub mod vmm;

pub use global::GlobalHeap;
pub use heap::KernelHeap;
pub use manager::{MemoryConfig, MemoryManager, MemoryStats, SIZE_CLASSES};
pub use vmm::VmallocError;
