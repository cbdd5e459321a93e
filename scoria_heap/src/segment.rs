//! Segments: the unit of wholesale memory acquisition
//!
//! A segment is a fixed 2 MiB region mapped from the OS whose base address
//! is aligned to its own size. The alignment is load-bearing: from any
//! pointer into a segment, the header is recovered by masking off the low
//! bits, and the per-page descriptor array in the header then classifies the
//! page in O(1) with no global lookup structure of any kind.
//!
//! Huge-object segments are longer than 2 MiB (their length is the
//! page-rounded object size) but keep the same base alignment so pointer
//! masking stays valid; only their first descriptor is meaningful.

use std::mem;
use std::ptr::{self, addr_of_mut, NonNull};

use tracing::Level;

use crate::heap::ThreadHeap;
use crate::mman::{self, MapError};
use crate::util::UsizePtr;

/// log2 of the page size
pub const PAGE_SHIFT: usize = 12;
/// Size in bytes of a page, the unit of free-list granularity
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 4 K
/// log2 of the segment size
pub const SEGMENT_SHIFT: usize = 21;
/// Size in bytes of an ordinary segment
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT; // 2 M
/// The number of pages covered by one segment's descriptor array
pub const PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / PAGE_SIZE;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE % PAGE_SIZE == 0);

/// What a page is currently used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageStatus {
    /// Part of a free run; reusable through the heap's free-slab lists
    Free,
    /// Occupied by the segment header itself
    Metadata,
    /// Part of a slab carved into uniform small blocks
    SmallSlab,
    /// Part of a multi-page single-block slab
    LargeSlab,
    /// First page of a one-object huge segment
    HugeSlab,
}

/// Per-page record in the segment header
///
/// `slab_ptr` points at the header owning the page: the segment itself for
/// metadata pages, the slab header for small/large slab pages (identical for
/// every page of the slab), and the first page of the run for free pages.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PageDescriptor {
    pub status: PageStatus,
    pub slab_ptr: *mut u8,
}

/// Header at the base of every mapped segment
#[repr(C)]
pub struct Segment {
    /// Heap that created this segment and owns all of its pages
    pub(crate) owner_heap: *const ThreadHeap,
    /// Intrusive links for the owning heap's segment lists
    pub(crate) prev: *mut Segment,
    pub(crate) next: *mut Segment,
    /// Actual byte length of the mapping (`SEGMENT_SIZE`, larger for huge)
    pub(crate) length: usize,
    /// One descriptor per page of the region, indexed by page offset
    pub(crate) descriptors: [PageDescriptor; PAGES_PER_SEGMENT],
}

/// Bytes occupied by the segment header, descriptor array included
pub const SEGMENT_HEADER_SIZE: usize = mem::size_of::<Segment>();
/// Pages at the start of every segment consumed by the header
pub const SEGMENT_METADATA_PAGES: usize = SEGMENT_HEADER_SIZE.div_ceil(PAGE_SIZE);
/// Pages of an ordinary segment usable for slabs
pub const AVAILABLE_PAGES: usize = PAGES_PER_SEGMENT - SEGMENT_METADATA_PAGES;

const _: () = assert!(SEGMENT_HEADER_SIZE < SEGMENT_SIZE);

impl Segment {
    /// Map a fresh segment of `length` bytes, aligned to `SEGMENT_SIZE`
    ///
    /// `length` is `SEGMENT_SIZE` for ordinary segments and the page-rounded
    /// object size for huge ones. The pages holding the header itself are
    /// stamped `Metadata`; everything else starts `Free` and unowned.
    pub fn create(length: usize) -> Result<NonNull<Segment>, MapError> {
        debug_assert!(length % PAGE_SIZE == 0);
        debug_assert!(length >= SEGMENT_METADATA_PAGES * PAGE_SIZE);

        let mapping = mman::map_aligned(length, SEGMENT_SIZE)?;
        let self_ = mapping.as_ptr() as *mut Segment;
        unsafe {
            Segment::init(self_, length);
        }

        tracing::event!(
            Level::TRACE,
            seg = ?UsizePtr::from(self_),
            length,
            "segment mapped"
        );
        // safety: the mapping is non-null
        Ok(unsafe { NonNull::new_unchecked(self_) })
    }

    /// Return the whole mapping to the OS
    ///
    /// Every structure derived from the segment (slab headers, descriptors,
    /// user blocks) becomes invalid; no per-slab teardown is needed.
    pub unsafe fn destroy(self_: *mut Segment) {
        let length = (*self_).length;
        tracing::event!(
            Level::TRACE,
            seg = ?UsizePtr::from(self_),
            length,
            "segment unmapped"
        );
        mman::unmap(self_ as *mut u8, length);
    }

    unsafe fn init(self_: *mut Segment, length: usize) {
        addr_of_mut!((*self_).owner_heap).write(ptr::null());
        addr_of_mut!((*self_).prev).write(ptr::null_mut());
        addr_of_mut!((*self_).next).write(ptr::null_mut());
        addr_of_mut!((*self_).length).write(length);

        let descriptors = addr_of_mut!((*self_).descriptors).cast::<PageDescriptor>();
        for i in 0..PAGES_PER_SEGMENT {
            descriptors.add(i).write(PageDescriptor {
                status: PageStatus::Free,
                slab_ptr: ptr::null_mut(),
            });
        }
        for i in 0..SEGMENT_METADATA_PAGES {
            descriptors.add(i).write(PageDescriptor {
                status: PageStatus::Metadata,
                slab_ptr: self_ as *mut u8,
            });
        }
    }

    /// Recover the owning segment from any pointer into it
    #[inline]
    pub fn of_ptr(ptr: *const u8) -> *mut Segment {
        (ptr as usize & !(SEGMENT_SIZE - 1)) as *mut Segment
    }

    /// Index of the page containing `ptr` within this segment
    #[inline]
    pub unsafe fn page_index(self_: *const Segment, ptr: *const u8) -> usize {
        (ptr as usize - self_ as usize) >> PAGE_SHIFT
    }

    /// Descriptor of the page containing `ptr`
    #[inline]
    pub unsafe fn descriptor_of(self_: *mut Segment, ptr: *const u8) -> *mut PageDescriptor {
        let index = Segment::page_index(self_, ptr);
        debug_assert!(index < PAGES_PER_SEGMENT);
        addr_of_mut!((*self_).descriptors)
            .cast::<PageDescriptor>()
            .add(index)
    }

    #[inline]
    pub unsafe fn length(self_: *const Segment) -> usize {
        (*self_).length
    }

    #[inline]
    pub unsafe fn owner_heap(self_: *const Segment) -> *const ThreadHeap {
        (*self_).owner_heap
    }
}
