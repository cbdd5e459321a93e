//! Size classes for small allocations
//!
//! An immutable, process-wide table enumerating every small block size the
//! heap hands out, together with the slab geometry derived for it: how many
//! pages a fresh slab of the class spans, how many blocks fit, and where the
//! block area starts past the in-place header and bitmap. A dense byte array
//! maps every request size in `[0, MAX_SMALL_OBJECT_SIZE]` to its class in
//! O(1).
//!
//! The schedule uses staged strides: fine 8-byte steps at the bottom,
//! coarsening geometrically up to 256 KiB, for 88 classes total. Slab page
//! counts follow an 8-blocks-per-slab heuristic clamped to half a segment so
//! the tail waste stays bounded.

use std::sync::OnceLock;

use crate::segment::{PAGE_SIZE, PAGES_PER_SEGMENT};
use crate::slab::SMALL_SLAB_BITMAP_OFFSET;
use crate::util::roundto;

/// Largest request size served from a small slab
pub const MAX_SMALL_OBJECT_SIZE: usize = 256 * 1024;
/// Upper bound on the number of size classes (the schedule produces 88)
pub const MAX_NUM_SIZE_CLASSES: usize = 128;
// the dense lookup array stores class ids as bytes
const _: () = assert!(MAX_NUM_SIZE_CLASSES <= u8::MAX as usize);

/// Geometry of one size class
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeClassInfo {
    /// Bytes per block handed to the user
    pub block_size: usize,
    /// Pages spanned by a fresh slab of this class
    pub slab_pages: usize,
    /// Blocks per slab
    pub slab_capacity: usize,
    /// Byte offset of block 0 past the in-place header and bitmap
    pub slab_metadata_size: usize,
}

/// The process-wide size-class table
pub struct SizeClassTable {
    infos: [SizeClassInfo; MAX_NUM_SIZE_CLASSES],
    num_classes: usize,
    /// Dense size -> class id map, one byte per size in [0, MAX_SMALL_OBJECT_SIZE]
    lookup: Box<[u8]>,
}

impl SizeClassTable {
    /// The singleton table, built once on first use
    pub fn global() -> &'static SizeClassTable {
        static TABLE: OnceLock<SizeClassTable> = OnceLock::new();
        TABLE.get_or_init(SizeClassTable::build)
    }

    /// Class id serving `size`, or `None` when the request is out of the
    /// small range and must go to the large/huge paths
    ///
    /// Size 0 maps to class 0 by convention; the heap handles the zero case
    /// before ever asking.
    #[inline]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        if size > MAX_SMALL_OBJECT_SIZE {
            return None;
        }
        Some(self.lookup[size] as usize)
    }

    /// Geometry of class `class_id`
    #[inline]
    pub fn info(&self, class_id: usize) -> &SizeClassInfo {
        debug_assert!(class_id < self.num_classes);
        &self.infos[class_id]
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn build() -> SizeClassTable {
        let mut infos = [SizeClassInfo::default(); MAX_NUM_SIZE_CLASSES];
        let mut num_classes = 0;

        // enumerate block sizes with staged strides
        let mut block_size = 8usize;
        while block_size <= MAX_SMALL_OBJECT_SIZE {
            let suggested_pages = if block_size <= 1024 {
                16
            } else if block_size <= 64 * 1024 {
                (block_size * 8).div_ceil(PAGE_SIZE)
            } else {
                (block_size * 2).div_ceil(PAGE_SIZE)
            };
            // at least 8 blocks per slab, at most half a segment
            let min_pages = (block_size * 8).div_ceil(PAGE_SIZE);
            let max_allowed_pages = PAGES_PER_SEGMENT / 2;
            let slab_pages = suggested_pages.max(min_pages).min(max_allowed_pages);

            infos[num_classes] = SizeClassInfo {
                block_size,
                slab_pages,
                slab_capacity: 0,
                slab_metadata_size: 0,
            };
            num_classes += 1;
            assert!(num_classes < MAX_NUM_SIZE_CLASSES);

            block_size += if block_size < 128 {
                8
            } else if block_size < 256 {
                16
            } else if block_size < 512 {
                32
            } else if block_size < 1024 {
                64
            } else if block_size < 4096 {
                256
            } else if block_size < 16384 {
                1024
            } else if block_size < 65536 {
                4096
            } else {
                16384
            };
        }

        // derive capacity and metadata size: the largest block count whose
        // 8-byte-aligned header+bitmap still leaves room for all the blocks
        for info in infos[..num_classes].iter_mut() {
            let slab_total = info.slab_pages * PAGE_SIZE;
            let mut capacity = slab_total / info.block_size;
            while capacity > 0 {
                let bitmap_words = capacity.div_ceil(64);
                let metadata = roundto(SMALL_SLAB_BITMAP_OFFSET + bitmap_words * 8, 8);
                if metadata + capacity * info.block_size <= slab_total {
                    info.slab_metadata_size = metadata;
                    break;
                }
                capacity -= 1;
            }
            assert!(capacity > 0, "size class cannot fit a single block");
            info.slab_capacity = capacity;
        }

        // dense lookup: walk the classes in step with the sizes
        let mut lookup = vec![0u8; MAX_SMALL_OBJECT_SIZE + 1].into_boxed_slice();
        let mut current_class = 0;
        for size in 1..=MAX_SMALL_OBJECT_SIZE {
            if size > infos[current_class].block_size {
                current_class += 1;
            }
            lookup[size] = current_class as u8;
        }
        lookup[0] = 0;

        SizeClassTable {
            infos,
            num_classes,
            lookup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_has_88_classes() {
        let table = SizeClassTable::global();
        assert_eq!(table.num_classes(), 88);
        assert_eq!(table.info(0).block_size, 8);
        assert_eq!(
            table.info(table.num_classes() - 1).block_size,
            MAX_SMALL_OBJECT_SIZE
        );
    }

    #[test]
    fn block_sizes_strictly_increase() {
        let table = SizeClassTable::global();
        for i in 1..table.num_classes() {
            assert!(
                table.info(i).block_size > table.info(i - 1).block_size,
                "class {} ({}) must be > class {} ({})",
                i,
                table.info(i).block_size,
                i - 1,
                table.info(i - 1).block_size
            );
        }
    }

    #[test]
    fn lookup_maps_zero_and_one_to_class_zero() {
        let table = SizeClassTable::global();
        assert_eq!(table.class_of(0), Some(0));
        assert_eq!(table.class_of(1), Some(0));
        assert_eq!(table.class_of(8), Some(0));
        assert_eq!(table.class_of(9), Some(1));
    }

    #[test]
    fn lookup_rejects_out_of_small_range() {
        let table = SizeClassTable::global();
        assert_eq!(
            table.class_of(MAX_SMALL_OBJECT_SIZE),
            Some(table.num_classes() - 1)
        );
        assert_eq!(table.class_of(MAX_SMALL_OBJECT_SIZE + 1), None);
        assert_eq!(table.class_of(usize::MAX), None);
    }

    #[test]
    fn lookup_is_idempotent_across_each_class_range() {
        // every size in (prev_block_size, block_size] maps to exactly this class
        let table = SizeClassTable::global();
        let mut prev_block_size = 0;
        for c in 0..table.num_classes() {
            let block_size = table.info(c).block_size;
            for s in [prev_block_size + 1, block_size] {
                assert_eq!(table.class_of(s), Some(c), "size {}", s);
                assert!(table.info(table.class_of(s).unwrap()).block_size >= s);
            }
            prev_block_size = block_size;
        }
    }

    #[test]
    fn slab_geometry_fits_and_is_maximal() {
        let table = SizeClassTable::global();
        for c in 0..table.num_classes() {
            let info = table.info(c);
            let slab_total = info.slab_pages * PAGE_SIZE;
            assert!(info.slab_capacity > 0, "class {}", c);

            // the chosen capacity fits
            let words = info.slab_capacity.div_ceil(64);
            let metadata = roundto(SMALL_SLAB_BITMAP_OFFSET + words * 8, 8);
            assert_eq!(metadata, info.slab_metadata_size);
            assert!(metadata + info.slab_capacity * info.block_size <= slab_total);

            // one more block would not
            let words = (info.slab_capacity + 1).div_ceil(64);
            let metadata = roundto(SMALL_SLAB_BITMAP_OFFSET + words * 8, 8);
            assert!(metadata + (info.slab_capacity + 1) * info.block_size > slab_total);
        }
    }

    #[test]
    fn slab_pages_follow_the_schedule() {
        let table = SizeClassTable::global();
        for c in 0..table.num_classes() {
            let info = table.info(c);
            assert!(info.slab_pages >= 1 && info.slab_pages <= PAGES_PER_SEGMENT / 2);
            if info.block_size <= 1024 {
                assert_eq!(info.slab_pages, 16);
            }
        }
    }

    #[test]
    fn metadata_keeps_block_zero_eight_byte_aligned() {
        // every block size is a multiple of 8, so an 8-byte-aligned start
        // of the block area keeps every block 8-byte aligned
        let table = SizeClassTable::global();
        for c in 0..table.num_classes() {
            let info = table.info(c);
            assert_eq!(info.block_size % 8, 0, "class {}", c);
            assert_eq!(
                info.slab_metadata_size % 8,
                0,
                "class {} block_size {}",
                c,
                info.block_size
            );
        }
    }
}
