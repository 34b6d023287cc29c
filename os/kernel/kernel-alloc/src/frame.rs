//! # Frame Descriptors
//!
//! One [`Frame`] per 4 KiB physical frame, indexed by PFN. The descriptor
//! records which zone the frame belongs to and what it is currently used for.

use crate::buddy::BuddyBlock;
use crate::list::{Adapter, Link};
use crate::slab::CacheId;
use bitfield_struct::bitfield;
use kernel_info::memory::SLAB_MAX_OBJECTS;

/// Static properties of a frame, fixed when memory is seeded.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FrameFlags {
    /// Backed by usable RAM and handed to the allocator.
    pub available: bool,
    /// Above the linear-map threshold.
    pub highmem: bool,
    #[bits(6)]
    __: u8,
}

/// Who asked for an allocated block. Recorded so frees can be classified
/// without guessing from addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameUsage {
    /// Handed out by `alloc_pages`.
    Raw,
    /// A multi-page `kmalloc` allocation.
    Heap,
    /// A page directory or page table.
    PageTable,
    /// Backing store of a `vmalloc` area.
    Vmalloc,
}

/// What a frame is currently used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameRole {
    /// Not managed (hole, firmware, kernel image, or beyond RAM).
    Reserved,
    /// Interior frame of a larger free or allocated block.
    Tail,
    /// Head of a free block.
    Free { order: u8 },
    /// Head of an allocated block.
    Allocated { order: u8, usage: FrameUsage },
    /// A single frame carved into objects of one slab cache.
    Slab(SlabFrame),
}

/// Slab bookkeeping kept in the descriptor instead of in the frame itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabFrame {
    pub cache: CacheId,
    /// Bit `i` set: object `i` is free.
    free: [u64; 2],
    active: u16,
    total: u16,
}

impl SlabFrame {
    /// A fresh slab with all `total` objects free.
    #[must_use]
    pub fn new(cache: CacheId, total: u16) -> Self {
        assert!(
            total > 0 && usize::from(total) <= SLAB_MAX_OBJECTS,
            "slab of {total} objects"
        );
        let mut free = [0u64; 2];
        for (word, bits) in free.iter_mut().enumerate() {
            let lo = word * 64;
            let n = usize::from(total).saturating_sub(lo).min(64);
            *bits = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
        }
        Self {
            cache,
            free,
            active: 0,
            total,
        }
    }

    #[inline]
    #[must_use]
    pub const fn active(&self) -> u16 {
        self.active
    }

    #[inline]
    #[must_use]
    pub const fn total(&self) -> u16 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.active == self.total
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Claim the lowest free object index.
    pub fn take_object(&mut self) -> Option<usize> {
        let (word, bits) = self.free.iter_mut().enumerate().find(|(_, b)| **b != 0)?;
        let bit = bits.trailing_zeros() as usize;
        *bits &= !(1u64 << bit);
        self.active += 1;
        Some(word * 64 + bit)
    }

    /// Return object `index`.
    ///
    /// # Panics
    /// If the index is out of range or the object is already free.
    pub fn put_object(&mut self, index: usize) {
        assert!(index < usize::from(self.total), "object index {index} out of range");
        let (word, bit) = (index / 64, index % 64);
        assert!(
            self.free[word] & (1u64 << bit) == 0,
            "double free of slab object {index}"
        );
        self.free[word] |= 1u64 << bit;
        self.active -= 1;
    }
}

/// Descriptor of one physical frame.
#[derive(Copy, Clone, Debug)]
pub struct Frame {
    flags: FrameFlags,
    role: FrameRole,
    link: Link,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    /// An unmanaged frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: FrameFlags::new(),
            role: FrameRole::Reserved,
            link: Link::UNLINKED,
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn role(&self) -> FrameRole {
        self.role
    }

    #[inline]
    pub(crate) const fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags;
    }

    #[inline]
    pub(crate) const fn set_role(&mut self, role: FrameRole) {
        self.role = role;
    }

    /// Slab bookkeeping, if this frame belongs to a cache.
    #[inline]
    #[must_use]
    pub const fn slab(&self) -> Option<&SlabFrame> {
        match &self.role {
            FrameRole::Slab(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub(crate) const fn slab_mut(&mut self) -> Option<&mut SlabFrame> {
        match &mut self.role {
            FrameRole::Slab(s) => Some(s),
            _ => None,
        }
    }
}

impl BuddyBlock for Frame {
    #[inline]
    fn free_order(&self) -> Option<u8> {
        match self.role {
            FrameRole::Free { order } => Some(order),
            _ => None,
        }
    }

    #[inline]
    fn mark_free(&mut self, order: u8) {
        self.role = FrameRole::Free { order };
    }

    #[inline]
    fn mark_tail(&mut self) {
        self.role = FrameRole::Tail;
    }

    #[inline]
    fn link(&self) -> &Link {
        &self.link
    }

    #[inline]
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Threads slab partial/full lists through [`Frame::link`].
///
/// A slab frame is never on a free list, so the link is shared.
pub struct FrameLink;

impl Adapter for FrameLink {
    type Item = Frame;

    #[inline]
    fn link(item: &Frame) -> &Link {
        &item.link
    }

    #[inline]
    fn link_mut(item: &mut Frame) -> &mut Link {
        &mut item.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_frame_hands_out_lowest_index_first() {
        let mut slab = SlabFrame::new(CacheId(0), 3);
        assert_eq!(slab.take_object(), Some(0));
        assert_eq!(slab.take_object(), Some(1));
        slab.put_object(0);
        assert_eq!(slab.take_object(), Some(0));
        assert_eq!(slab.take_object(), Some(2));
        assert!(slab.is_full());
        assert_eq!(slab.take_object(), None);
    }

    #[test]
    fn slab_frame_spans_both_words() {
        let mut slab = SlabFrame::new(CacheId(1), 128);
        for i in 0..128 {
            assert_eq!(slab.take_object(), Some(i));
        }
        assert!(slab.is_full());
        slab.put_object(100);
        assert_eq!(slab.active(), 127);
        assert_eq!(slab.take_object(), Some(100));
    }

    #[test]
    fn slab_frame_with_64_objects() {
        let slab = SlabFrame::new(CacheId(2), 64);
        assert_eq!(slab.free, [u64::MAX, 0]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn slab_double_free_panics() {
        let mut slab = SlabFrame::new(CacheId(0), 4);
        let i = slab.take_object().unwrap();
        slab.put_object(i);
        slab.put_object(i);
    }

    #[test]
    fn frame_role_transitions() {
        let mut f = Frame::new();
        assert_eq!(f.role(), FrameRole::Reserved);
        f.mark_free(3);
        assert_eq!(f.free_order(), Some(3));
        f.mark_tail();
        assert_eq!(f.free_order(), None);
        assert!(f.slab().is_none());
    }
}
