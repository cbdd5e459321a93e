//! Thread-caching segment/slab memory allocator core
//!
//! This is the substrate of a `malloc`/`free` replacement in the
//! segment-and-slab tradition of
//! [Mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf)
//! and tcmalloc: each [ThreadHeap] carves page-aligned slabs out of 2 MiB
//! OS segments aligned to their own size, so that `free` can recover all
//! metadata from a bare pointer with two memory reads and no global lookup
//! structure.
//!
//! Requests are routed into three regimes: *small* sizes share bitmap slabs
//! cached per size class, *large* sizes take a multi-page run from
//! segregated free-run lists with split-and-coalesce, and *huge* sizes get
//! a segment of their own. The public `malloc` ABI shim and the per-thread
//! binding of heaps are deliberately out of scope; this crate is the heap
//! itself.

pub mod heap;
pub mod mman;
pub mod segment;
pub mod size_class;
pub mod slab;
pub mod util;

pub use heap::{ThreadHeap, HUGE_OBJECT_THRESHOLD};
pub use segment::{Segment, PAGE_SIZE, SEGMENT_SIZE};
pub use size_class::{SizeClassTable, MAX_SMALL_OBJECT_SIZE};
