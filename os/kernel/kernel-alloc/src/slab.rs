//! # Slab Caches
//!
//! Fixed-size object caches. Each slab is a single linear frame carved into
//! `objects_per_slab` equally sized objects; its bookkeeping lives in the
//! frame descriptor ([`SlabFrame`](crate::frame::SlabFrame)). A cache keeps
//! slabs with free objects on `partial` and exhausted ones on `full`; slabs
//! that become empty go straight back to the frame allocator.
//!
//! Every mutation runs under the cache's own spinlock. Callers that also hold
//! the frame allocator must take it first.

use crate::frame::FrameLink;
use crate::frame_alloc::FrameAllocator;
use crate::list::IndexList;
use crate::phys_mapper::LinearMap;
use core::fmt;
use kernel_info::memory::{PAGE_SIZE, SLAB_MAX_OBJECTS};
use kernel_memory_addresses::{Pfn, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use log::{debug, error};

/// Identifies a cache; stored in the descriptor of each of its slabs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CacheId(pub u16);

/// Objects are at least this aligned.
const OBJECT_ALIGN: usize = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SlabError {
    #[error("object size {0} is not within 1..={PAGE_SIZE}")]
    InvalidSize(usize),
    #[error("no cache identifiers left")]
    TooManyCaches,
}

struct CacheState {
    partial: IndexList<FrameLink>,
    full: IndexList<FrameLink>,
    active_objects: usize,
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CacheStats {
    pub object_size: usize,
    pub objects_per_slab: u16,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub active_objects: usize,
}

impl CacheStats {
    /// Objects the current slabs can hold.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        (self.partial_slabs + self.full_slabs) * self.objects_per_slab as usize
    }
}

pub struct SlabCache {
    id: CacheId,
    object_size: usize,
    objects_per_slab: u16,
    state: SpinLock<CacheState>,
}

impl SlabCache {
    /// A cache for objects of `size` bytes.
    ///
    /// # Errors
    /// [`SlabError::InvalidSize`] unless `0 < size <= PAGE_SIZE`.
    pub fn new(id: CacheId, size: usize) -> Result<Self, SlabError> {
        Self::check_size(size)?;
        Ok(Self::with_valid_size(id, size))
    }

    /// # Errors
    /// [`SlabError::InvalidSize`] unless `0 < size <= PAGE_SIZE`.
    pub const fn check_size(size: usize) -> Result<(), SlabError> {
        if size == 0 || size > PAGE_SIZE as usize {
            return Err(SlabError::InvalidSize(size));
        }
        Ok(())
    }

    /// A slab never holds more than [`SLAB_MAX_OBJECTS`] objects, since the
    /// free set lives in the frame descriptor. Objects below
    /// `PAGE_SIZE / SLAB_MAX_OBJECTS` bytes leave the rest of the frame unused.
    pub(crate) fn with_valid_size(id: CacheId, size: usize) -> Self {
        let object_size = size.next_multiple_of(OBJECT_ALIGN);
        let fit = PAGE_SIZE as usize / object_size;
        let per_slab = fit.min(SLAB_MAX_OBJECTS);
        if per_slab < fit {
            debug!(
                "cache {id:?}: {object_size} byte objects use {} of {PAGE_SIZE} bytes per slab",
                per_slab * object_size
            );
        }
        Self {
            id,
            object_size,
            #[allow(clippy::cast_possible_truncation)]
            objects_per_slab: per_slab as u16,
            state: SpinLock::new(CacheState {
                partial: IndexList::new(),
                full: IndexList::new(),
                active_objects: 0,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> CacheId {
        self.id
    }

    /// Size of one object after alignment padding.
    #[inline]
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    #[must_use]
    pub const fn objects_per_slab(&self) -> u16 {
        self.objects_per_slab
    }

    /// Allocate one object, growing the cache by a frame if needed.
    ///
    /// Returns `None` when no partial slab exists and no linear frame is left.
    pub fn alloc(&self, frames: &mut FrameAllocator, linear: &LinearMap) -> Option<VirtualAddress> {
        let mut st = self.state.lock();
        let pfn = match st.partial.front() {
            Some(index) => Pfn::from_index(index),
            None => {
                let Some(pfn) = frames.alloc_slab(self.id, self.objects_per_slab) else {
                    error!("cache {:?}: no frame for a new slab", self.id);
                    return None;
                };
                frames.link_slab(&mut st.partial, pfn);
                debug!("cache {:?}: new slab {pfn}", self.id);
                pfn
            }
        };

        let slab = frames.slab_mut(pfn);
        let Some(index) = slab.take_object() else {
            panic!("cache {:?}: {pfn} on the partial list has no free object", self.id);
        };
        let full = slab.is_full();
        st.active_objects += 1;
        if full {
            frames.unlink_slab(&mut st.partial, pfn);
            frames.link_slab(&mut st.full, pfn);
        }

        let Some(base) = linear.pfn_to_virt(pfn) else {
            panic!("slab {pfn} is not linearly mapped");
        };
        Some(base + (index * self.object_size) as u64)
    }

    /// Return `object` to this cache.
    ///
    /// # Panics
    /// If `object` is not an object of this cache or is already free.
    pub fn free(&self, frames: &mut FrameAllocator, linear: &LinearMap, object: VirtualAddress) {
        let Some(pa) = linear.virt_to_phys(object) else {
            panic!("cache {:?}: {object} is not a linear-map address", self.id);
        };
        let pfn = Pfn::containing(pa);
        let offset = pa.offset::<Size4K>() as usize;

        let mut st = self.state.lock();
        let slab = frames.slab_mut(pfn);
        assert_eq!(
            slab.cache, self.id,
            "{object} belongs to cache {:?}, not {:?}",
            slab.cache, self.id
        );
        assert!(
            offset.is_multiple_of(self.object_size),
            "{object} is not at an object boundary of cache {:?}",
            self.id
        );

        let was_full = slab.is_full();
        slab.put_object(offset / self.object_size);
        let now_empty = slab.is_empty();
        st.active_objects -= 1;

        if now_empty {
            if was_full {
                frames.unlink_slab(&mut st.full, pfn);
            } else {
                frames.unlink_slab(&mut st.partial, pfn);
            }
            frames.free_slab(pfn);
            debug!("cache {:?}: released slab {pfn}", self.id);
        } else if was_full {
            frames.unlink_slab(&mut st.full, pfn);
            frames.link_slab(&mut st.partial, pfn);
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab,
            partial_slabs: st.partial.len(),
            full_slabs: st.full.len(),
            active_objects: st.active_objects,
        }
    }

    /// Check list membership against the descriptors of the cache's slabs.
    ///
    /// # Panics
    /// If a slab is on the wrong list, belongs to another cache, or the
    /// object count disagrees.
    pub fn check(&self, frames: &FrameAllocator) {
        let st = self.state.lock();
        let mut active = 0;
        for (list, want_full) in [(&st.partial, false), (&st.full, true)] {
            for index in list.iter(frames.frames()) {
                let pfn = Pfn::from_index(index);
                let Some(slab) = frames.frame(pfn).slab() else {
                    panic!("cache {:?}: listed {pfn} is not a slab", self.id);
                };
                assert_eq!(slab.cache, self.id, "cache {:?}: foreign slab {pfn}", self.id);
                assert!(!slab.is_empty(), "cache {:?}: empty slab {pfn} kept", self.id);
                assert_eq!(slab.is_full(), want_full, "cache {:?}: {pfn} on the wrong list", self.id);
                active += usize::from(slab.active());
            }
        }
        assert_eq!(active, st.active_objects, "cache {:?}: object count drifted", self.id);
    }

    /// One line per cache.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let s = self.stats();
        writeln!(
            w,
            "cache {:3} size {:4}: {:5}/{:5} objects, {} partial, {} full",
            self.id.0,
            s.object_size,
            s.active_objects,
            s.capacity(),
            s.partial_slabs,
            s.full_slabs
        )
    }
}
