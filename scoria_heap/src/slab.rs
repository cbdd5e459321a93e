//! In-place slab headers
//!
//! Both header types live in the first bytes of the region they describe,
//! so there is no separate metadata tier: recovering a header from a page
//! descriptor lands directly on cache-warm memory inside the slab itself.
//!
//! A small slab carves a multi-page run into uniform blocks tracked by a
//! bitmap (1 = free) that trails the header in memory; block `i` lives at
//! `slab + slab_metadata_size + i * block_size`. A large slab is one block
//! spanning the whole run; its header doubles as the free-run list node once
//! the run is released, which is why the two lifecycles share the layout.
//!
//! Headers are operated on through raw pointers: the bitmap extends past the
//! struct itself, so all accesses derive from the slab's base pointer.

use std::mem;
use std::ptr::{self, addr_of_mut, NonNull};

use crate::size_class::SizeClassTable;

/// Header at the first byte of a small slab
///
/// `prev`/`next` link the slab into its class's cache of partial slabs; both
/// are null while the slab is full (and therefore unlisted).
#[repr(C)]
pub struct SmallSlabHeader {
    pub prev: *mut SmallSlabHeader,
    pub next: *mut SmallSlabHeader,
    free_count: u16,
    class_id: u16,
    /// Marker for the bitmap trailing the header; real length is
    /// `ceil(slab_capacity / 64)` words, known only via the size class
    bitmap: [u64; 0],
}

/// Byte offset of the bitmap within a small slab
pub const SMALL_SLAB_BITMAP_OFFSET: usize = mem::offset_of!(SmallSlabHeader, bitmap);

impl SmallSlabHeader {
    /// A header linked to nothing, used for cache sentinel nodes
    pub fn detached() -> SmallSlabHeader {
        SmallSlabHeader {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            free_count: 0,
            class_id: u16::MAX,
            bitmap: [],
        }
    }

    /// Construct a header in place at the base of a fresh slab
    ///
    /// All `slab_capacity` blocks start free: the bitmap is all ones up to
    /// capacity, with the excess bits of the last word held at zero so a
    /// word scan can never step past the last block.
    pub unsafe fn init(self_: *mut SmallSlabHeader, class_id: u16) {
        let info = SizeClassTable::global().info(class_id as usize);
        debug_assert!(info.slab_capacity < u16::MAX as usize);

        addr_of_mut!((*self_).prev).write(ptr::null_mut());
        addr_of_mut!((*self_).next).write(ptr::null_mut());
        addr_of_mut!((*self_).free_count).write(info.slab_capacity as u16);
        addr_of_mut!((*self_).class_id).write(class_id);

        let bitmap = SmallSlabHeader::bitmap_ptr(self_);
        let words = info.slab_capacity.div_ceil(64);
        for i in 0..words {
            bitmap.add(i).write(u64::MAX);
        }
        let excess = info.slab_capacity % 64;
        if excess > 0 {
            bitmap.add(words - 1).write((1u64 << excess) - 1);
        }
    }

    /// Take one free block, or `None` when the slab is full
    ///
    /// Picks the lowest-index set bit; within one word that yields LIFO-ish
    /// reuse, but callers get no ordering contract.
    pub unsafe fn allocate_block(self_: *mut SmallSlabHeader) -> Option<NonNull<u8>> {
        if SmallSlabHeader::is_full(self_) {
            return None;
        }
        let info = SizeClassTable::global().info((*self_).class_id as usize);
        let bitmap = SmallSlabHeader::bitmap_ptr(self_);
        let words = info.slab_capacity.div_ceil(64);

        for i in 0..words {
            let word = *bitmap.add(i);
            if word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let block_index = i * 64 + bit;
            // excess bits past capacity are never set
            debug_assert!(block_index < info.slab_capacity);

            bitmap.add(i).write(word & !(1u64 << bit));
            (*self_).free_count -= 1;

            let block = (self_ as *mut u8).add(info.slab_metadata_size + block_index * info.block_size);
            // safety: the slab base is non-null and the offset stays inside it
            return Some(NonNull::new_unchecked(block));
        }

        debug_assert!(false, "free_count nonzero but no free bit found");
        None
    }

    /// Return `ptr`'s block to the slab
    ///
    /// A pointer off a block boundary or a bit that is already free means
    /// the caller handed back garbage; both assert in debug builds and are
    /// ignored in release builds.
    pub unsafe fn free_block(self_: *mut SmallSlabHeader, ptr: *mut u8) {
        let info = SizeClassTable::global().info((*self_).class_id as usize);
        let blocks = (self_ as *mut u8).add(info.slab_metadata_size);
        let offset = (ptr as usize).wrapping_sub(blocks as usize);

        let block_index = offset / info.block_size;
        if offset % info.block_size != 0 || block_index >= info.slab_capacity {
            debug_assert!(false, "free of pointer not on a block boundary");
            return;
        }

        let bitmap = SmallSlabHeader::bitmap_ptr(self_);
        let word = bitmap.add(block_index / 64);
        let mask = 1u64 << (block_index % 64);
        if *word & mask != 0 {
            debug_assert!(false, "double free of small block");
            return;
        }

        word.write(*word | mask);
        (*self_).free_count += 1;
        debug_assert!((*self_).free_count as usize <= info.slab_capacity);
    }

    #[inline]
    pub unsafe fn is_full(self_: *const SmallSlabHeader) -> bool {
        (*self_).free_count == 0
    }

    #[inline]
    pub unsafe fn is_empty(self_: *const SmallSlabHeader) -> bool {
        let info = SizeClassTable::global().info((*self_).class_id as usize);
        (*self_).free_count as usize == info.slab_capacity
    }

    #[inline]
    pub unsafe fn class_id(self_: *const SmallSlabHeader) -> u16 {
        (*self_).class_id
    }

    #[inline]
    pub unsafe fn free_count(self_: *const SmallSlabHeader) -> u16 {
        (*self_).free_count
    }

    #[inline]
    pub unsafe fn bitmap_ptr(self_: *mut SmallSlabHeader) -> *mut u64 {
        (self_ as *mut u8).add(SMALL_SLAB_BITMAP_OFFSET) as *mut u64
    }
}

/// Header at the first byte of a large slab or a free run
///
/// Allocated: passive metadata, user data starts `LARGE_HEADER_SIZE` bytes
/// in. Free: list node in the heap's free-slab lists, the rest of the run
/// unused.
#[repr(C)]
pub struct LargeSlabHeader {
    pub prev: *mut LargeSlabHeader,
    pub next: *mut LargeSlabHeader,
    pub num_pages: u16,
}

/// Distance from a large-slab header to its user data, padded so user
/// pointers keep 16-byte alignment
pub const LARGE_HEADER_SIZE: usize = 32;
const _: () = assert!(mem::size_of::<LargeSlabHeader>() <= LARGE_HEADER_SIZE);
const _: () = assert!(LARGE_HEADER_SIZE % 16 == 0);

impl LargeSlabHeader {
    pub unsafe fn init(self_: *mut LargeSlabHeader, num_pages: u16) {
        addr_of_mut!((*self_).prev).write(ptr::null_mut());
        addr_of_mut!((*self_).next).write(ptr::null_mut());
        addr_of_mut!((*self_).num_pages).write(num_pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mman;
    use crate::segment::PAGE_SIZE;

    // back a slab header with plain anonymous pages; nothing in this module
    // touches page descriptors
    fn with_slab(class_id: usize, f: impl FnOnce(*mut SmallSlabHeader)) {
        let info = SizeClassTable::global().info(class_id);
        let mapping = mman::map_anonymous(info.slab_pages * PAGE_SIZE).unwrap();
        let header = mapping.as_ptr() as *mut SmallSlabHeader;
        unsafe {
            SmallSlabHeader::init(header, class_id as u16);
            f(header);
            mman::unmap(mapping.as_ptr(), info.slab_pages * PAGE_SIZE);
        }
    }

    fn class_of(size: usize) -> usize {
        SizeClassTable::global().class_of(size).unwrap()
    }

    #[test]
    fn init_marks_every_block_free() {
        let class_id = class_of(32);
        let info = *SizeClassTable::global().info(class_id);
        with_slab(class_id, |header| unsafe {
            assert_eq!(SmallSlabHeader::free_count(header) as usize, info.slab_capacity);
            assert!(SmallSlabHeader::is_empty(header));
            assert!(!SmallSlabHeader::is_full(header));

            // popcount over the bitmap equals the capacity, excess bits zero
            let bitmap = SmallSlabHeader::bitmap_ptr(header);
            let words = info.slab_capacity.div_ceil(64);
            let mut ones = 0;
            for i in 0..words {
                ones += (*bitmap.add(i)).count_ones() as usize;
            }
            assert_eq!(ones, info.slab_capacity);
        });
    }

    #[test]
    fn allocate_block_walks_up_from_block_zero() {
        let class_id = class_of(32);
        let info = *SizeClassTable::global().info(class_id);
        with_slab(class_id, |header| unsafe {
            let base = (header as *mut u8).add(info.slab_metadata_size);
            let b0 = SmallSlabHeader::allocate_block(header).unwrap();
            let b1 = SmallSlabHeader::allocate_block(header).unwrap();
            assert_eq!(b0.as_ptr(), base);
            assert_eq!(b1.as_ptr(), base.add(info.block_size));
            assert_eq!(
                SmallSlabHeader::free_count(header) as usize,
                info.slab_capacity - 2
            );
        });
    }

    #[test]
    fn freed_block_is_reused_before_higher_indices() {
        let class_id = class_of(64);
        with_slab(class_id, |header| unsafe {
            let b0 = SmallSlabHeader::allocate_block(header).unwrap();
            let _b1 = SmallSlabHeader::allocate_block(header).unwrap();
            SmallSlabHeader::free_block(header, b0.as_ptr());
            // lowest-index set bit comes back first
            let again = SmallSlabHeader::allocate_block(header).unwrap();
            assert_eq!(again, b0);
        });
    }

    #[test]
    fn slab_fills_to_capacity_and_refuses_more() {
        let class_id = class_of(MAX_TEST_BLOCK);
        let info = *SizeClassTable::global().info(class_id);
        with_slab(class_id, |header| unsafe {
            let mut blocks = Vec::new();
            for i in 0..info.slab_capacity {
                let b = SmallSlabHeader::allocate_block(header)
                    .unwrap_or_else(|| panic!("block {} failed", i));
                blocks.push(b);
            }
            assert!(SmallSlabHeader::is_full(header));
            assert!(SmallSlabHeader::allocate_block(header).is_none());

            // distinct, in-range, block-aligned
            let mut addrs: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
            addrs.sort();
            addrs.dedup();
            assert_eq!(addrs.len(), info.slab_capacity);
            let base = (header as *mut u8).add(info.slab_metadata_size) as usize;
            for addr in &addrs {
                let offset = addr - base;
                assert_eq!(offset % info.block_size, 0);
                assert!(offset / info.block_size < info.slab_capacity);
            }

            for b in blocks {
                SmallSlabHeader::free_block(header, b.as_ptr());
            }
            assert!(SmallSlabHeader::is_empty(header));
        });
    }

    // a mid-table class keeps the fill loop fast while still spanning
    // multiple bitmap words
    const MAX_TEST_BLOCK: usize = 4096;

    #[test]
    fn large_header_fits_its_padded_slot() {
        assert!(mem::size_of::<LargeSlabHeader>() <= LARGE_HEADER_SIZE);
        let mapping = mman::map_anonymous(PAGE_SIZE).unwrap();
        let header = mapping.as_ptr() as *mut LargeSlabHeader;
        unsafe {
            LargeSlabHeader::init(header, 17);
            assert_eq!((*header).num_pages, 17);
            assert!((*header).prev.is_null());
            assert!((*header).next.is_null());
            mman::unmap(mapping.as_ptr(), PAGE_SIZE);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_asserts_in_debug() {
        let class_id = class_of(32);
        with_slab(class_id, |header| unsafe {
            let b = SmallSlabHeader::allocate_block(header).unwrap();
            SmallSlabHeader::free_block(header, b.as_ptr());
            SmallSlabHeader::free_block(header, b.as_ptr());
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "block boundary")]
    fn misaligned_free_asserts_in_debug() {
        let class_id = class_of(32);
        with_slab(class_id, |header| unsafe {
            let b = SmallSlabHeader::allocate_block(header).unwrap();
            SmallSlabHeader::free_block(header, b.as_ptr().add(1));
        });
    }
}
