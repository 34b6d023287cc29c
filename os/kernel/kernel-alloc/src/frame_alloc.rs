//! # Physical Frame Allocator
//!
//! A binary buddy allocator over a caller-provided [`Frame`] table. Frames
//! are split into two zones at a fixed PFN threshold:
//!
//! * **linear**: permanently mapped at the kernel's linear map, usable for
//!   anything the kernel dereferences directly (page tables, slabs, heap);
//! * **highmem**: everything above, only reachable through explicit mappings.
//!
//! Each zone has its own free lists; blocks never straddle the threshold.
//!
//! ```text
//! order 10 ┌───────────────────────────────┐
//!   ...    │ alloc(order 2) splits down:   │
//! order  2 │ [0..4) taken, 4, 8, 16 … free │
//!          └───────────────────────────────┘
//! ```

use crate::buddy::BuddyLists;
use crate::frame::{Frame, FrameFlags, FrameLink, FrameRole, FrameUsage, SlabFrame};
use crate::list::IndexList;
use crate::slab::CacheId;
use core::fmt;
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Pfn, Size4K};
use kernel_vmem::FrameAlloc;
use log::{debug, error};

const ORDERS: usize = MAX_ORDER as usize + 1;

/// Which zone a request would like to be served from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZoneHint {
    /// Must be linearly mapped. Never falls back to highmem.
    Linear,
    /// Prefer highmem, fall back to the linear zone.
    HighMem,
}

/// One of the two zones.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZoneId {
    Linear = 0,
    HighMem = 1,
}

impl ZoneId {
    pub const ALL: [Self; 2] = [Self::Linear, Self::HighMem];

    const fn name(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::HighMem => "highmem",
        }
    }
}

impl ZoneHint {
    const fn zones(self) -> &'static [ZoneId] {
        match self {
            Self::Linear => &[ZoneId::Linear],
            Self::HighMem => &[ZoneId::HighMem, ZoneId::Linear],
        }
    }
}

struct Zone {
    lists: BuddyLists<Frame, ORDERS>,
    managed: usize,
}

impl Zone {
    fn new() -> Self {
        Self {
            lists: BuddyLists::new(),
            managed: 0,
        }
    }
}

/// Buddy allocator over the frame table.
pub struct FrameAllocator<'m> {
    frames: &'m mut [Frame],
    zones: [Zone; 2],
    highmem_start: Pfn,
}

impl<'m> FrameAllocator<'m> {
    /// Manage `frames`, where `frames[i]` describes PFN `i`. Every frame
    /// starts out reserved until [`add_free_range`](Self::add_free_range).
    ///
    /// # Panics
    /// If `highmem_start` is not aligned to the largest block size.
    pub fn new(frames: &'m mut [Frame], highmem_start: Pfn) -> Self {
        assert!(
            highmem_start.is_aligned(MAX_ORDER),
            "zone boundary {highmem_start} must be aligned to order {MAX_ORDER}"
        );
        frames.fill(Frame::new());
        Self {
            frames,
            zones: [Zone::new(), Zone::new()],
            highmem_start,
        }
    }

    /// First PFN of the highmem zone.
    #[inline]
    #[must_use]
    pub const fn highmem_start(&self) -> Pfn {
        self.highmem_start
    }

    /// Number of descriptors, i.e. one past the highest PFN.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn zone_of(&self, pfn: Pfn) -> ZoneId {
        if pfn < self.highmem_start {
            ZoneId::Linear
        } else {
            ZoneId::HighMem
        }
    }

    /// Hand `[start, end)` to the allocator. Partial frames at either end are
    /// dropped and the part beyond the frame table is ignored. The range is
    /// split into maximal aligned blocks, which merge with neighbours that are
    /// already free.
    ///
    /// # Panics
    /// If any frame in the range is already managed.
    pub fn add_free_range(&mut self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        let first = Pfn::containing(start.align_up::<Size4K>()).index();
        let last = Pfn::containing(end.align_down::<Size4K>())
            .index()
            .min(self.frames.len());
        if first >= last {
            return 0;
        }

        for index in first..last {
            let pfn = Pfn::from_index(index);
            let frame = &mut self.frames[index];
            assert!(
                frame.role() == FrameRole::Reserved,
                "{pfn} seeded twice ({:?})",
                frame.role()
            );
            frame.set_flags(
                FrameFlags::new()
                    .with_available(true)
                    .with_highmem(pfn >= self.highmem_start),
            );
            frame.set_role(FrameRole::Tail);
        }

        let boundary = self.highmem_start.index();
        let mut index = first;
        while index < last {
            let zone_end = if index < boundary { last.min(boundary) } else { last };
            let mut order = MAX_ORDER;
            while order > 0 && (index & ((1 << order) - 1) != 0 || index + (1 << order) > zone_end)
            {
                order -= 1;
            }
            let zone = self.zone_of(Pfn::from_index(index));
            self.zones[zone as usize].managed += 1 << order;
            self.release(zone, index, order);
            index += 1 << order;
        }

        debug!(
            "seeded {} frames [{}, {})",
            last - first,
            Pfn::from_index(first).base(),
            Pfn::from_index(last).base()
        );
        last - first
    }

    /// Allocate `2^order` contiguous frames for plain use.
    pub fn alloc(&mut self, hint: ZoneHint, order: u8) -> Option<Pfn> {
        self.alloc_for(hint, order, FrameUsage::Raw)
    }

    /// Allocate `2^order` contiguous frames and record `usage` on the head.
    pub fn alloc_for(&mut self, hint: ZoneHint, order: u8, usage: FrameUsage) -> Option<Pfn> {
        if order > MAX_ORDER {
            error!("frame request of order {order} exceeds the maximum order {MAX_ORDER}");
            return None;
        }
        for &zone in hint.zones() {
            if let Some(index) = self.zones[zone as usize].lists.take(self.frames, order) {
                self.frames[index].set_role(FrameRole::Allocated { order, usage });
                return Some(Pfn::from_index(index));
            }
        }
        error!("out of frames for order {order} ({hint:?}, {usage:?})");
        None
    }

    /// Release the block headed by `pfn`.
    ///
    /// # Panics
    /// If `pfn` does not head an allocated block: double frees, slab frames,
    /// tails and reserved frames are all rejected.
    pub fn free(&mut self, pfn: Pfn) {
        let order = match self.frame(pfn).role() {
            FrameRole::Allocated { order, .. } => order,
            FrameRole::Free { .. } => panic!("double free of {pfn}"),
            FrameRole::Slab(slab) => {
                panic!("{pfn} is owned by slab cache {:?}", slab.cache)
            }
            role => panic!("freeing {pfn} in role {role:?}"),
        };
        self.release(self.zone_of(pfn), pfn.index(), order);
    }

    fn release(&mut self, zone: ZoneId, index: usize, order: u8) {
        let highmem = zone == ZoneId::HighMem;
        self.zones[zone as usize]
            .lists
            .release(self.frames, index, order, |_, buddy| {
                buddy.flags().available() && buddy.flags().highmem() == highmem
            });
    }

    /// Take one linear frame and turn it into an empty slab of `cache`.
    pub fn alloc_slab(&mut self, cache: CacheId, objects: u16) -> Option<Pfn> {
        let pfn = self.alloc_for(ZoneHint::Linear, 0, FrameUsage::Raw)?;
        self.frames[pfn.index()].set_role(FrameRole::Slab(SlabFrame::new(cache, objects)));
        Some(pfn)
    }

    /// Slab bookkeeping of `pfn`.
    ///
    /// # Panics
    /// If `pfn` is not a slab frame.
    pub fn slab_mut(&mut self, pfn: Pfn) -> &mut SlabFrame {
        match self.frames.get_mut(pfn.index()).and_then(Frame::slab_mut) {
            Some(slab) => slab,
            None => panic!("{pfn} is not a slab frame"),
        }
    }

    /// Clear the slab role of an empty slab frame and free it.
    ///
    /// # Panics
    /// If the frame is not an empty slab.
    pub fn free_slab(&mut self, pfn: Pfn) {
        let slab = *self.slab_mut(pfn);
        assert!(slab.is_empty(), "{pfn} still holds {} objects", slab.active());
        self.frames[pfn.index()].set_role(FrameRole::Allocated {
            order: 0,
            usage: FrameUsage::Raw,
        });
        self.free(pfn);
    }

    /// Descriptor of `pfn`.
    ///
    /// # Panics
    /// If `pfn` lies beyond the frame table.
    #[inline]
    #[must_use]
    pub fn frame(&self, pfn: Pfn) -> &Frame {
        match self.frames.get(pfn.index()) {
            Some(frame) => frame,
            None => panic!("{pfn} is beyond the frame table ({} frames)", self.frames.len()),
        }
    }

    /// Whether `pfn` has a descriptor.
    #[inline]
    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn.index() < self.frames.len()
    }

    /// PFN described by `frame`, which must be an element of this table.
    #[must_use]
    pub fn pfn_of(&self, frame: &Frame) -> Option<Pfn> {
        let base = self.frames.as_ptr().addr();
        let offset = (frame as *const Frame).addr().checked_sub(base)?;
        let index = offset / size_of::<Frame>();
        (offset % size_of::<Frame>() == 0 && index < self.frames.len())
            .then(|| Pfn::from_index(index))
    }

    /// The table, for walking lists threaded through [`FrameLink`].
    #[inline]
    pub(crate) fn frames(&self) -> &[Frame] {
        self.frames
    }

    /// Link a slab frame onto a cache list; see [`FrameLink`].
    pub(crate) fn link_slab(&mut self, list: &mut IndexList<FrameLink>, pfn: Pfn) {
        list.push_front(self.frames, pfn.index());
    }

    pub(crate) fn unlink_slab(&mut self, list: &mut IndexList<FrameLink>, pfn: Pfn) {
        list.remove(self.frames, pfn.index());
    }

    /// Free frames in `zone`.
    #[must_use]
    pub fn free_frames(&self, zone: ZoneId) -> usize {
        self.zones[zone as usize].lists.free_units()
    }

    /// Frames ever seeded into `zone`.
    #[must_use]
    pub fn managed_frames(&self, zone: ZoneId) -> usize {
        self.zones[zone as usize].managed
    }

    /// Number of free blocks of `order` in `zone`.
    #[must_use]
    pub fn free_blocks(&self, zone: ZoneId, order: u8) -> usize {
        self.zones[zone as usize].lists.count(order)
    }

    /// Heads of the free blocks of `order` in `zone`, most recent first.
    pub fn free_list(&self, zone: ZoneId, order: u8) -> impl Iterator<Item = Pfn> + '_ {
        self.zones[zone as usize]
            .lists
            .iter(self.frames, order)
            .map(Pfn::from_index)
    }

    /// Per-zone, per-order free-list listing.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        for zone in ZoneId::ALL {
            writeln!(
                w,
                "zone {}: {} of {} frames free",
                zone.name(),
                self.free_frames(zone),
                self.managed_frames(zone)
            )?;
            for order in 0..=MAX_ORDER {
                let count = self.free_blocks(zone, order);
                if count == 0 {
                    continue;
                }
                write!(w, "  order {order:2}: {count:5} block(s)")?;
                for pfn in self.free_list(zone, order).take(4) {
                    write!(w, " {}", pfn.base())?;
                }
                if count > 4 {
                    w.write_str(" ...")?;
                }
                writeln!(w)?;
            }
        }
        Ok(())
    }

    /// Walk the whole table and check that free lists, roles and flags agree.
    ///
    /// # Panics
    /// On the first inconsistency, after logging a free-list dump.
    pub fn check_consistency(&self) {
        let mut index = 0;
        let mut free_heads = [[0usize; ORDERS]; 2];
        while index < self.frames.len() {
            let frame = &self.frames[index];
            let pfn = Pfn::from_index(index);
            let span = match frame.role() {
                FrameRole::Reserved => {
                    self.expect(!frame.flags().available(), pfn, "reserved but available");
                    1
                }
                FrameRole::Tail => {
                    self.fail(pfn, "tail outside of any block");
                }
                FrameRole::Free { order } | FrameRole::Allocated { order, .. } => {
                    if let FrameRole::Free { .. } = frame.role() {
                        free_heads[self.zone_of(pfn) as usize][order as usize] += 1;
                    }
                    self.expect(pfn.is_aligned(order), pfn, "misaligned block head");
                    self.expect(frame.flags().available(), pfn, "block head not available");
                    let span = 1usize << order;
                    self.expect(index + span <= self.frames.len(), pfn, "block beyond the table");
                    for tail in index + 1..index + span {
                        let t = &self.frames[tail];
                        self.expect(t.role() == FrameRole::Tail, Pfn::from_index(tail), "expected tail");
                        self.expect(
                            t.flags() == frame.flags(),
                            Pfn::from_index(tail),
                            "block crosses the zone boundary",
                        );
                    }
                    span
                }
                FrameRole::Slab(slab) => {
                    self.expect(slab.active() <= slab.total(), pfn, "slab over capacity");
                    self.expect(!frame.flags().highmem(), pfn, "slab in highmem");
                    1
                }
            };
            index += span;
        }

        for zone in ZoneId::ALL {
            let lists = &self.zones[zone as usize].lists;
            for order in 0..=MAX_ORDER {
                self.expect(
                    lists.count(order) == free_heads[zone as usize][order as usize],
                    Pfn::new(0),
                    "free list length differs from the number of free heads",
                );
                for pfn in self.free_list(zone, order) {
                    self.expect(
                        self.frame(pfn).role() == FrameRole::Free { order },
                        pfn,
                        "listed block is not free at this order",
                    );
                    self.expect(self.zone_of(pfn) == zone, pfn, "listed in the wrong zone");
                }
            }
        }
    }

    fn expect(&self, ok: bool, pfn: Pfn, what: &str) {
        if !ok {
            self.fail(pfn, what);
        }
    }

    fn fail(&self, pfn: Pfn, what: &str) -> ! {
        let mut dump = DumpToLog;
        let _ = self.dump(&mut dump);
        panic!("frame allocator corrupted at {pfn}: {what}");
    }
}

/// Forwards a dump line by line to the logger.
struct DumpToLog;

impl fmt::Write for DumpToLog {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for line in s.lines().filter(|l| !l.is_empty()) {
            error!("{line}");
        }
        Ok(())
    }
}

impl FrameAlloc for FrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_for(ZoneHint::Linear, 0, FrameUsage::PageTable)
            .map(Pfn::page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn table(n: usize) -> Vec<Frame> {
        vec![Frame::new(); n]
    }

    #[test]
    fn ten_order_two_allocations_from_one_max_block() {
        let mut frames = table(2048);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(4 * MIB));
        assert_eq!(fa.free_blocks(ZoneId::Linear, 10), 1);

        for i in 0..10u32 {
            assert_eq!(fa.alloc(ZoneHint::Linear, 2), Some(Pfn::new(4 * i)));
        }
        assert_eq!(fa.free_frames(ZoneId::Linear), 1024 - 40);

        let expect = [(3, 40), (4, 48), (6, 64), (7, 128), (8, 256), (9, 512)];
        for order in 0..=MAX_ORDER {
            let found: Vec<u32> = fa.free_list(ZoneId::Linear, order).map(Pfn::as_u32).collect();
            let wanted: Vec<u32> = expect
                .iter()
                .filter(|(o, _)| *o == order)
                .map(|(_, p)| *p)
                .collect();
            assert_eq!(found, wanted, "order {order}");
        }
        fa.check_consistency();
    }

    #[test]
    fn alloc_then_free_restores_the_free_lists() {
        let mut frames = table(1024);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(4 * MIB));

        let pfn = fa.alloc(ZoneHint::Linear, 3).unwrap();
        assert_eq!(
            fa.frame(pfn).role(),
            FrameRole::Allocated {
                order: 3,
                usage: FrameUsage::Raw
            }
        );
        fa.free(pfn);
        assert_eq!(fa.free_blocks(ZoneId::Linear, 10), 1);
        assert_eq!(fa.free_list(ZoneId::Linear, 10).next(), Some(Pfn::new(0)));
        assert_eq!(fa.free_frames(ZoneId::Linear), 1024);
        fa.check_consistency();
    }

    #[test]
    fn seeding_splits_unaligned_ranges_into_maximal_blocks() {
        let mut frames = table(1024);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        // PFN 3 .. 21 → 3, 4..8, 8..16, 16..20, 20
        let added = fa.add_free_range(PhysicalAddress::new(0x3000), PhysicalAddress::new(0x15000));
        assert_eq!(added, 18);
        assert_eq!(fa.free_blocks(ZoneId::Linear, 0), 2);
        assert_eq!(fa.free_blocks(ZoneId::Linear, 2), 2);
        assert_eq!(fa.free_blocks(ZoneId::Linear, 3), 1);
        fa.check_consistency();

        // Filling the hole in front merges upward.
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x3000));
        assert_eq!(fa.free_blocks(ZoneId::Linear, 4), 1);
        assert_eq!(fa.free_frames(ZoneId::Linear), 21);
        fa.check_consistency();
    }

    #[test]
    fn partial_pages_are_dropped() {
        let mut frames = table(16);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        assert_eq!(fa.add_free_range(PhysicalAddress::new(0x0800), PhysicalAddress::new(0x1800)), 0);
        assert_eq!(fa.add_free_range(PhysicalAddress::new(0x0800), PhysicalAddress::new(0x2800)), 1);
        // Beyond the table is ignored.
        assert_eq!(fa.add_free_range(PhysicalAddress::new(0xF000), PhysicalAddress::new(0x20000)), 1);
    }

    #[test]
    fn zones_never_merge_across_the_boundary() {
        let mut frames = table(4096);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(16 * MIB));
        assert_eq!(fa.free_frames(ZoneId::Linear), 1024);
        assert_eq!(fa.free_frames(ZoneId::HighMem), 3072);
        assert!(fa.frame(Pfn::new(1024)).flags().highmem());
        assert!(!fa.frame(Pfn::new(1023)).flags().highmem());

        let low = fa.alloc(ZoneHint::Linear, 0).unwrap();
        let high = fa.alloc(ZoneHint::HighMem, 0).unwrap();
        assert!(low < Pfn::new(1024));
        assert!(high >= Pfn::new(1024));
        fa.free(low);
        fa.free(high);
        assert_eq!(fa.free_blocks(ZoneId::Linear, 10), 1);
        assert_eq!(fa.free_blocks(ZoneId::HighMem, 10), 3);
        fa.check_consistency();
    }

    #[test]
    fn highmem_falls_back_to_linear_but_not_vice_versa() {
        let mut frames = table(2048);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x1000));
        assert_eq!(fa.alloc(ZoneHint::HighMem, 0), Some(Pfn::new(0)));

        let mut frames = table(2048);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::new(4 * MIB), PhysicalAddress::new(4 * MIB + 0x1000));
        assert_eq!(fa.alloc(ZoneHint::Linear, 0), None);
        assert_eq!(fa.alloc(ZoneHint::HighMem, 0), Some(Pfn::new(1024)));
    }

    #[test]
    fn exhaustion_and_oversized_orders_fail_cleanly() {
        let mut frames = table(1024);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(4 * MIB));
        assert_eq!(fa.alloc(ZoneHint::Linear, MAX_ORDER + 1), None);
        let all = fa.alloc(ZoneHint::Linear, MAX_ORDER).unwrap();
        assert_eq!(fa.alloc(ZoneHint::Linear, 0), None);
        fa.free(all);
        fa.check_consistency();
    }

    #[test]
    fn page_table_frames_are_tagged() {
        let mut frames = table(16);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x10000));
        let page = fa.alloc_4k().unwrap();
        assert_eq!(
            fa.frame(Pfn::from(page)).role(),
            FrameRole::Allocated {
                order: 0,
                usage: FrameUsage::PageTable
            }
        );
    }

    #[test]
    fn descriptor_and_pfn_conversions() {
        let mut frames = table(16);
        let fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        let pfn = Pfn::new(7);
        assert_eq!(fa.pfn_of(fa.frame(pfn)), Some(pfn));
        let stranger = Frame::new();
        assert_eq!(fa.pfn_of(&stranger), None);
    }

    #[test]
    fn slab_frames_round_trip() {
        let mut frames = table(16);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x10000));
        let pfn = fa.alloc_slab(CacheId(3), 8).unwrap();
        assert_eq!(fa.slab_mut(pfn).cache, CacheId(3));
        fa.free_slab(pfn);
        assert_eq!(fa.free_frames(ZoneId::Linear), 16);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut frames = table(16);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x10000));
        let pfn = fa.alloc(ZoneHint::Linear, 0).unwrap();
        fa.free(pfn);
        fa.free(pfn);
    }

    #[test]
    #[should_panic(expected = "owned by slab cache")]
    fn freeing_a_slab_frame_panics() {
        let mut frames = table(16);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x10000));
        let pfn = fa.alloc_slab(CacheId(0), 4).unwrap();
        fa.free(pfn);
    }

    #[test]
    fn dump_lists_blocks_per_order() {
        let mut frames = table(1024);
        let mut fa = FrameAllocator::new(&mut frames, Pfn::new(1024));
        fa.add_free_range(PhysicalAddress::zero(), PhysicalAddress::new(0x3000));
        let mut out = String::new();
        fa.dump(&mut out).unwrap();
        assert_eq!(
            out.lines().collect::<Vec<_>>(),
            vec![
                "zone linear: 3 of 3 frames free",
                "  order  0:     1 block(s) 0x00002000",
                "  order  1:     1 block(s) 0x00000000",
                "zone highmem: 0 of 0 frames free",
            ]
        );
    }
}
