//! Simulated machine for host-side tests.
//!
//! The linear zone is a page-aligned heap buffer whose address serves as the
//! kernel virtual base, so page tables and slabs are real memory. Highmem
//! frames only exist as descriptors; nothing dereferences them.

#![allow(dead_code)]

use kernel_alloc::early_heap::EarlyArena;
use kernel_alloc::frame::Frame;
use kernel_alloc::{MemoryConfig, MemoryManager};
use kernel_info::boot::{MemoryKind, MemoryRegion};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::RawSingleWriter;
use kernel_vmem::Tlb;
use std::sync::Mutex;

pub const PAGE: u64 = 4096;

#[derive(Clone)]
#[repr(C, align(4096))]
pub struct Page([u8; 4096]);

/// Records invalidations; reports `active` as the loaded page directory.
#[derive(Default)]
pub struct TestTlb {
    pub active: Mutex<Option<PhysicalPage<Size4K>>>,
    pub flushed: Mutex<Vec<u64>>,
}

impl TestTlb {
    pub fn flushed(&self) -> Vec<u64> {
        self.flushed.lock().unwrap().clone()
    }
}

impl Tlb for TestTlb {
    fn active_root(&self) -> Option<PhysicalPage<Size4K>> {
        *self.active.lock().unwrap()
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.flushed.lock().unwrap().push(va.as_u64());
    }
}

pub type TestManager<'m> = MemoryManager<'m, TestTlb>;

/// A manager for a single execution context; any contention panics.
pub type UniManager<'m> = MemoryManager<'m, TestTlb, RawSingleWriter>;

/// Backing storage of one simulated machine.
pub struct Machine {
    ram: Vec<Page>,
    frames: Vec<Frame>,
    arena: Box<EarlyArena>,
}

impl Machine {
    /// `linear` frames of real memory followed by `highmem` descriptor-only
    /// frames. `linear` must be a multiple of 1024.
    pub fn new(linear: usize, highmem: usize) -> Self {
        Self {
            ram: vec![Page([0; 4096]); linear],
            frames: vec![Frame::new(); linear + highmem],
            arena: Box::new(EarlyArena::new()),
        }
    }

    pub fn config(&self) -> MemoryConfig {
        MemoryConfig {
            highmem_start: PhysicalAddress::new(self.ram.len() as u64 * PAGE),
            kernel_virtual_base: VirtualAddress::from_ptr(self.ram.as_ptr()),
            ..MemoryConfig::default()
        }
    }

    /// A manager with every frame free.
    pub fn boot(&mut self) -> TestManager<'_> {
        let config = self.config();
        let total = self.frames.len() as u64 * PAGE;
        let mm = MemoryManager::new(config, &mut self.frames, &mut self.arena, TestTlb::default());
        let map = [MemoryRegion::new(0, total, MemoryKind::Usable)];
        assert_eq!(mm.seed_from_memory_map(&map, PhysicalAddress::zero()) as u64, total / PAGE);
        mm
    }

    /// Like [`boot`](Self::boot), plus kernel page directory and slab era.
    pub fn boot_full(&mut self) -> TestManager<'_> {
        let mm = self.boot();
        mm.init_kernel_space().unwrap();
        mm.enable_slab();
        mm
    }

    /// Fully booted manager guarded by single-writer locks.
    pub fn boot_uni(&mut self) -> UniManager<'_> {
        let config = self.config();
        let total = self.frames.len() as u64 * PAGE;
        let mm: UniManager<'_> =
            MemoryManager::new(config, &mut self.frames, &mut self.arena, TestTlb::default());
        let map = [MemoryRegion::new(0, total, MemoryKind::Usable)];
        mm.seed_from_memory_map(&map, PhysicalAddress::zero());
        mm.init_kernel_space().unwrap();
        mm.enable_slab();
        mm
    }
}
