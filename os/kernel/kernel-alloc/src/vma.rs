//! # Virtual Memory Areas
//!
//! Hands out page-granular ranges of one or more reserved virtual windows.
//! Every area, free or busy, is a node on an address-ordered list; free
//! areas additionally sit on the free list of order `floor(log2(pages))`,
//! busy areas are indexed by an [`IntervalTree`] so any address inside them
//! finds its owner.
//!
//! Allocation rounds the request up to a power of two only to pick the list
//! to scan from; the area handed out is trimmed to the requested page count
//! and the rest goes back as a free remainder. Freeing absorbs free
//! neighbours, so two free areas are never address-contiguous.
//!
//! Node storage grows through the global allocator. Growth is reserved
//! before anything is modified, so an out-of-memory condition leaves the
//! allocator untouched.

use crate::list::{Adapter, IndexList, Link};
use crate::vmm::VmallocError;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{MAX_VMA_ORDER, PAGE_SIZE};
use kernel_interval_tree::IntervalTree;
use kernel_memory_addresses::{Pfn, Size4K, VirtualAddress};
use log::{debug, error};

const ORDERS: usize = MAX_VMA_ORDER as usize + 1;

/// Handle of a busy area.
///
/// Node slots are recycled, so the handle also carries the generation the
/// slot had when the area was handed out; a handle kept past its `free` no
/// longer names a busy area even once the slot is busy again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VmaId {
    index: u32,
    generation: u32,
}

impl VmaId {
    #[inline]
    const fn index(self) -> usize {
        self.index as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }
}

/// What is mapped behind a busy area.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Backing {
    /// Nothing yet.
    Unbacked,
    /// Frames allocated for the area (`vmalloc`); released with it.
    Owned(Vec<Pfn>),
    /// Caller-provided frames (`vmap`); the caller keeps ownership.
    Borrowed,
}

/// A range `[start, end)` of virtual memory.
#[derive(Debug)]
pub struct Vma {
    start: VirtualAddress,
    end: VirtualAddress,
    free: bool,
    backing: Backing,
}

impl Vma {
    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }
}

struct Node {
    vma: Vma,
    live: bool,
    /// Bumped each time the area becomes busy.
    generation: u32,
    by_address: Link,
    /// Free-list link of a free area, vacant-slot link of a dead node.
    list: Link,
}

struct ByAddress;

impl Adapter for ByAddress {
    type Item = Node;

    fn link(item: &Node) -> &Link {
        &item.by_address
    }

    fn link_mut(item: &mut Node) -> &mut Link {
        &mut item.by_address
    }
}

struct OnList;

impl Adapter for OnList {
    type Item = Node;

    fn link(item: &Node) -> &Link {
        &item.list
    }

    fn link_mut(item: &mut Node) -> &mut Link {
        &mut item.list
    }
}

/// Free list holding an area of `pages`.
#[allow(clippy::cast_possible_truncation)]
fn floor_order(pages: u64) -> usize {
    (pages.ilog2() as usize).min(MAX_VMA_ORDER as usize)
}

/// Smallest order whose areas are guaranteed to hold `pages`.
#[allow(clippy::cast_possible_truncation)]
fn ceil_order(pages: u64) -> usize {
    pages.next_power_of_two().trailing_zeros() as usize
}

/// Allocator of virtual areas over disjoint windows.
pub struct VmaAllocator {
    nodes: Vec<Node>,
    by_address: IndexList<ByAddress>,
    free_lists: [IndexList<OnList>; ORDERS],
    vacant: IndexList<OnList>,
    busy: IntervalTree<VmaId>,
}

impl Default for VmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VmaAllocator {
    /// An allocator without any window; see [`add_range`](Self::add_range).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_address: IndexList::new(),
            free_lists: [const { IndexList::new() }; ORDERS],
            vacant: IndexList::new(),
            busy: IntervalTree::new(),
        }
    }

    /// Make `[start, end)` available for allocation.
    ///
    /// # Errors
    /// [`VmallocError::OutOfMemory`] if no node can be allocated.
    ///
    /// # Panics
    /// If the window is empty, unaligned, or overlaps a known window.
    pub fn add_range(&mut self, start: VirtualAddress, end: VirtualAddress) -> Result<(), VmallocError> {
        assert!(
            start < end && start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>(),
            "invalid vma window {start}..{end}"
        );
        let mut before = None;
        for index in self.by_address.iter(&self.nodes) {
            let vma = &self.nodes[index].vma;
            assert!(
                vma.end <= start || end <= vma.start,
                "vma window {start}..{end} overlaps {}..{}",
                vma.start,
                vma.end
            );
            if vma.end <= start {
                before = Some(index);
            }
        }

        self.reserve_node()?;
        let index = self.new_node(start, end);
        match before {
            Some(at) => self.by_address.insert_after(&mut self.nodes, at, index),
            None => self.by_address.push_front(&mut self.nodes, index),
        }
        self.release_area(index);
        debug!("vma window {start}..{end}");
        Ok(())
    }

    /// Reserve `len` bytes, rounded up to whole pages.
    ///
    /// # Errors
    /// * [`VmallocError::AddressSpaceExhausted`] if no free area is large enough.
    /// * [`VmallocError::OutOfMemory`] if node or tree storage cannot grow.
    ///
    /// # Panics
    /// If `len` is zero.
    pub fn alloc(&mut self, len: u64) -> Result<VmaId, VmallocError> {
        assert!(len > 0, "zero-sized vma request");
        let pages = len.div_ceil(PAGE_SIZE);
        let order = ceil_order(pages);
        if order >= ORDERS {
            error!("vma request of {pages} pages exceeds order {MAX_VMA_ORDER}");
            return Err(VmallocError::AddressSpaceExhausted);
        }
        self.reserve_node()?;

        let Some(index) = (order..ORDERS).find_map(|k| self.free_lists[k].front()) else {
            error!("no free vma of {pages} pages");
            return Err(VmallocError::AddressSpaceExhausted);
        };
        let k = floor_order(self.nodes[index].vma.pages());
        self.free_lists[k].remove(&mut self.nodes, index);

        let start = self.nodes[index].vma.start;
        let end = self.nodes[index].vma.end;
        let split = start + pages * PAGE_SIZE;
        let mut remainder = None;
        if split < end {
            let rest = self.new_node(split, end);
            self.by_address.insert_after(&mut self.nodes, index, rest);
            self.nodes[index].vma.end = split;
            self.push_free(rest);
            remainder = Some(rest);
        }

        let node = &mut self.nodes[index];
        node.vma.free = false;
        node.vma.backing = Backing::Unbacked;
        node.generation = node.generation.wrapping_add(1);
        let id = VmaId::new(index, node.generation);
        if let Err(e) = self.busy.insert(start.as_u64(), split.as_u64() - 1, id) {
            error!("cannot index vma {start}..{split}: {e}");
            if let Some(rest) = remainder {
                self.free_lists[floor_order(self.nodes[rest].vma.pages())].remove(&mut self.nodes, rest);
                self.by_address.remove(&mut self.nodes, rest);
                self.destroy_node(rest);
                self.nodes[index].vma.end = end;
            }
            self.nodes[index].vma.free = true;
            self.push_free(index);
            return Err(VmallocError::OutOfMemory);
        }
        Ok(id)
    }

    /// Release a busy area and hand back whatever backed it.
    ///
    /// # Panics
    /// If `id` does not name a busy area.
    pub fn free(&mut self, id: VmaId) -> Backing {
        let vma = self.busy_vma(id);
        let start = vma.start;
        match self.busy.remove(start.as_u64()) {
            Ok((_, found)) if found == id => {}
            other => panic!("vma {start} is not indexed correctly: {other:?}"),
        }
        let node = &mut self.nodes[id.index()];
        let backing = core::mem::replace(&mut node.vma.backing, Backing::Unbacked);
        node.vma.free = true;
        self.release_area(id.index());
        backing
    }

    /// The busy area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<VmaId> {
        self.busy.search(va.as_u64()).map(|(_, id)| *id)
    }

    /// A busy area.
    #[must_use]
    pub fn get(&self, id: VmaId) -> Option<&Vma> {
        self.nodes
            .get(id.index())
            .filter(|n| n.live && !n.vma.free && n.generation == id.generation)
            .map(|n| &n.vma)
    }

    /// Record what backs a busy area.
    ///
    /// # Panics
    /// If `id` does not name a busy area.
    pub fn attach(&mut self, id: VmaId, backing: Backing) {
        self.busy_vma(id);
        self.nodes[id.index()].vma.backing = backing;
    }

    fn busy_vma(&self, id: VmaId) -> &Vma {
        match self.get(id) {
            Some(vma) => vma,
            None => panic!("{id:?} is not a busy vma"),
        }
    }

    /// Number of busy areas.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    /// Pages in free areas.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.areas().filter(|v| v.free).map(Vma::pages).sum()
    }

    /// All areas in address order.
    pub fn areas(&self) -> impl Iterator<Item = &Vma> + '_ {
        self.by_address.iter(&self.nodes).map(|i| &self.nodes[i].vma)
    }

    /// One line per area.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        for vma in self.areas() {
            let what = match (&vma.backing, vma.free) {
                (_, true) => "free",
                (Backing::Unbacked, false) => "busy",
                (Backing::Owned(_), false) => "busy owned",
                (Backing::Borrowed, false) => "busy borrowed",
            };
            writeln!(w, "{}-{} {:6} pages {what}", vma.start, vma.end, vma.pages())?;
        }
        Ok(())
    }

    /// Sideways dump of the index of busy areas.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump_tree<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.busy.dump(w)
    }

    /// Check the lists and the index against each other.
    ///
    /// # Panics
    /// On the first inconsistency.
    pub fn validate(&self) {
        let mut prev: Option<&Vma> = None;
        let mut busy = 0;
        for index in self.by_address.iter(&self.nodes) {
            let node = &self.nodes[index];
            let vma = &node.vma;
            assert!(node.live, "dead vma node {index} on the address list");
            assert!(vma.start < vma.end, "empty vma at {}", vma.start);
            if let Some(p) = prev {
                assert!(p.end <= vma.start, "vma {} overlaps {}", p.start, vma.start);
                assert!(
                    !(p.free && vma.free && p.end == vma.start),
                    "free vmas {} and {} were not merged",
                    p.start,
                    vma.start
                );
            }
            if vma.free {
                let k = floor_order(vma.pages());
                assert!(
                    self.free_lists[k].iter(&self.nodes).any(|i| i == index),
                    "free vma {} missing from list {k}",
                    vma.start
                );
            } else {
                busy += 1;
                assert_eq!(
                    self.find(vma.start),
                    Some(VmaId::new(index, node.generation)),
                    "busy vma {} is not indexed",
                    vma.start
                );
            }
            prev = Some(vma);
        }
        let listed: usize = self.free_lists.iter().map(IndexList::len).sum();
        let free = self.areas().filter(|v| v.free).count();
        assert_eq!(listed, free, "free lists hold {listed} areas, {free} are free");
        assert_eq!(busy, self.busy.len(), "index holds {} areas, {busy} are busy", self.busy.len());
        self.busy.assert_valid();
    }

    /// Make sure [`new_node`](Self::new_node) will not need to allocate.
    fn reserve_node(&mut self) -> Result<(), VmallocError> {
        if self.vacant.is_empty() {
            self.nodes.try_reserve(1).map_err(|_| {
                error!("out of memory for vma nodes");
                VmallocError::OutOfMemory
            })?;
        }
        Ok(())
    }

    fn new_node(&mut self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let vma = Vma {
            start,
            end,
            free: true,
            backing: Backing::Unbacked,
        };
        if let Some(index) = self.vacant.pop_front(&mut self.nodes) {
            let node = &mut self.nodes[index];
            node.vma = vma;
            node.live = true;
            return index;
        }
        debug_assert!(self.nodes.len() < self.nodes.capacity(), "vma node not reserved");
        self.nodes.push(Node {
            vma,
            live: true,
            generation: 0,
            by_address: Link::UNLINKED,
            list: Link::UNLINKED,
        });
        self.nodes.len() - 1
    }

    fn destroy_node(&mut self, index: usize) {
        self.nodes[index].live = false;
        self.vacant.push_front(&mut self.nodes, index);
    }

    fn push_free(&mut self, index: usize) {
        let k = floor_order(self.nodes[index].vma.pages());
        self.free_lists[k].push_front(&mut self.nodes, index);
    }

    /// Merge the free area at `index` with free neighbours and list it.
    fn release_area(&mut self, index: usize) {
        while let Some(prev) = self.by_address.prev(&self.nodes, index) {
            if !self.absorbable(prev) || self.nodes[prev].vma.end != self.nodes[index].vma.start {
                break;
            }
            self.nodes[index].vma.start = self.nodes[prev].vma.start;
            self.drop_free_neighbour(prev);
        }
        while let Some(next) = self.by_address.next(&self.nodes, index) {
            if !self.absorbable(next) || self.nodes[next].vma.start != self.nodes[index].vma.end {
                break;
            }
            self.nodes[index].vma.end = self.nodes[next].vma.end;
            self.drop_free_neighbour(next);
        }
        self.push_free(index);
    }

    fn absorbable(&self, index: usize) -> bool {
        self.nodes[index].vma.free
    }

    fn drop_free_neighbour(&mut self, index: usize) {
        let k = floor_order(self.nodes[index].vma.pages());
        self.free_lists[k].remove(&mut self.nodes, index);
        self.by_address.remove(&mut self.nodes, index);
        self.destroy_node(index);
    }
}
