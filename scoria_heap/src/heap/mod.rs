//! The thread heap
//!
//! One heap owns a set of 2 MiB segments and serves all three request
//! regimes out of them:
//!
//! - *small* (up to [MAX_SMALL_OBJECT_SIZE]): one block out of a bitmap slab;
//!   each size class keeps a cache of partial slabs so the common case is a
//!   bitmap scan in the slab at the head of the list.
//! - *large* (up to [HUGE_OBJECT_THRESHOLD]): a multi-page run popped from
//!   the free-slab lists, which index free runs by exact page count and are
//!   refilled by splitting bigger runs or mapping a fresh segment.
//! - *huge*: one whole segment per object, unmapped directly on free.
//!
//! `free` never consults any global structure: masking the pointer recovers
//! the segment, the page descriptor names the owning slab header, and the
//! header page's own descriptor tells which regime the block belongs to.
//! Every mutation path below has to preserve that dispatch invariant.
//!
//! Freed runs coalesce with both address-space neighbors through one-page
//! descriptor lookups, so no two free runs are ever adjacent and the lists
//! stay short. [HeapState::initialize_as_free_slab] is the sole writer of
//! free-run descriptors, which is what lets coalescing trust a single
//! neighbor read.
//!
//! The whole heap is guarded by one mutex; `allocate` and `free` are each a
//! single critical section, which also makes free-from-another-thread safe
//! (a shim routing cross-thread frees to the owning heap needs nothing more
//! from us). Lock-free fast paths and remote-free queues are future work.

use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::Level;

use crate::segment::{
    PageDescriptor, PageStatus, Segment, AVAILABLE_PAGES, PAGES_PER_SEGMENT, PAGE_SIZE,
    SEGMENT_HEADER_SIZE, SEGMENT_METADATA_PAGES, SEGMENT_SIZE,
};
use crate::size_class::{SizeClassTable, MAX_NUM_SIZE_CLASSES, MAX_SMALL_OBJECT_SIZE};
use crate::slab::{LargeSlabHeader, SmallSlabHeader, LARGE_HEADER_SIZE};
use crate::util::{roundto, UsizePtr};

/// Requests above this go to the one-segment-per-object path
///
/// Chosen so that a huge payload can never fit in a standard segment once
/// the segment header and the large-slab header are deducted.
pub const HUGE_OBJECT_THRESHOLD: usize = AVAILABLE_PAGES * PAGE_SIZE - LARGE_HEADER_SIZE;
const _: () = assert!(HUGE_OBJECT_THRESHOLD > MAX_SMALL_OBJECT_SIZE);

/// Cache of partial slabs for one size class
///
/// The sentinel is a detached header boxed on its own so its address
/// survives moves of the heap; the circular prev/next discipline keeps
/// link and unlink branch-free.
struct SlabCache {
    sentinel: *mut SmallSlabHeader,
}

impl SlabCache {
    fn new() -> SlabCache {
        let sentinel = Box::into_raw(Box::new(SmallSlabHeader::detached()));
        unsafe {
            (*sentinel).prev = sentinel;
            (*sentinel).next = sentinel;
        }
        SlabCache { sentinel }
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        // safety: the sentinel was leaked from a Box in new() and is never
        // part of any segment
        unsafe { drop(Box::from_raw(self.sentinel)) };
    }
}

/// Everything the heap mutates, behind its one lock
struct HeapState {
    /// Per-class caches of partial small slabs
    slab_caches: [SlabCache; MAX_NUM_SIZE_CLASSES],
    /// Free runs indexed by page count minus one
    free_slabs: [*mut LargeSlabHeader; PAGES_PER_SEGMENT],
    /// All ordinary segments obtained from the OS
    active_segments: *mut Segment,
    /// All one-object huge segments
    huge_segments: *mut Segment,
}

/// A three-tier allocator serving small, large, and huge requests
///
/// Logically owned by a single thread for the fast path (the canonical
/// binding is one heap per OS thread, which is the collaborator's job), but
/// safe to call from any thread thanks to the heap-wide mutex.
pub struct ThreadHeap {
    state: Mutex<HeapState>,
}

// safety: the raw pointers in HeapState all reach memory exclusively owned
// by this heap (its segments and the boxed cache sentinels), and the mutex
// serializes every access to them
unsafe impl Send for ThreadHeap {}
unsafe impl Sync for ThreadHeap {}

impl ThreadHeap {
    pub fn new() -> ThreadHeap {
        ThreadHeap {
            state: Mutex::new(HeapState {
                slab_caches: std::array::from_fn(|_| SlabCache::new()),
                free_slabs: [ptr::null_mut(); PAGES_PER_SEGMENT],
                active_segments: ptr::null_mut(),
                huge_segments: ptr::null_mut(),
            }),
        }
    }

    /// Allocate `size` bytes, null (`None`) on zero size or OS OOM
    ///
    /// Small pointers are at least 8-byte aligned (every block size is a
    /// multiple of 8), large and huge pointers 16-byte aligned. On OOM no
    /// heap state has been mutated observably.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let trace_span = tracing::span!(Level::TRACE, "heap::allocate", size);
        let _span_enter = trace_span.enter();

        if size == 0 {
            return None;
        }

        let owner = self as *const ThreadHeap;
        let mut state = self.lock_state();
        let ptr = unsafe {
            if size > HUGE_OBJECT_THRESHOLD {
                state.allocate_huge(size, owner)
            } else if size > MAX_SMALL_OBJECT_SIZE {
                state.allocate_large(size, owner)
            } else {
                state.allocate_small(size, owner)
            }
        };

        match ptr {
            Some(p) => tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(p)),
            None => tracing::event!(Level::WARN, size, "allocation failed"),
        }
        ptr
    }

    /// Release a block previously returned by [allocate](Self::allocate)
    ///
    /// No-op on null. Double-free and foreign-pointer free are undefined;
    /// where detection is cheap, debug builds assert and release builds
    /// ignore the call.
    pub fn free(&self, ptr: *mut u8) {
        let trace_span = tracing::span!(Level::TRACE, "heap::free", ptr = ?UsizePtr::from(ptr));
        let _span_enter = trace_span.enter();

        if ptr.is_null() {
            return;
        }

        let mut state = self.lock_state();
        unsafe {
            let seg = Segment::of_ptr(ptr);
            if (*seg).descriptors[0].status == PageStatus::HugeSlab {
                // huge objects bypass the free-slab lists entirely
                state.free_huge(seg);
                return;
            }
            state.slab_free(ptr);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Walk every structure the heap owns and assert the cross-component
    /// invariants: descriptor consistency, free-run non-adjacency and list
    /// membership, bitmap counts, and cache lifecycle states.
    ///
    /// Heavyweight; meant for tests and debugging sessions only.
    pub fn _debug_validate(&self) {
        use std::collections::HashSet;

        let state = self.lock_state();
        let table = SizeClassTable::global();
        let owner = self as *const ThreadHeap;

        unsafe {
            // every free run, as seen from the lists
            let mut listed_runs = HashSet::new();
            for index in 0..PAGES_PER_SEGMENT {
                let mut node = state.free_slabs[index];
                let mut expected_prev: *mut LargeSlabHeader = ptr::null_mut();
                while !node.is_null() {
                    assert_eq!(
                        (*node).num_pages as usize,
                        index + 1,
                        "run is in the wrong free list"
                    );
                    assert_eq!((*node).prev, expected_prev);
                    assert!(
                        listed_runs.insert(node as usize),
                        "run listed more than once"
                    );
                    let seg = Segment::of_ptr(node as *const u8);
                    for i in 0..(*node).num_pages as usize {
                        let page = (node as *const u8).add(i * PAGE_SIZE);
                        let desc = *Segment::descriptor_of(seg, page);
                        assert_eq!(desc.status, PageStatus::Free);
                        assert_eq!(desc.slab_ptr, node as *mut u8);
                    }
                    expected_prev = node;
                    node = (*node).next;
                }
            }

            // every page of every ordinary segment belongs to exactly one
            // category, and free runs found in the walk are exactly the
            // listed ones
            let mut walked_runs = 0;
            let mut seg = state.active_segments;
            let mut expected_prev: *mut Segment = ptr::null_mut();
            while !seg.is_null() {
                assert_eq!((*seg).owner_heap, owner);
                assert_eq!((*seg).prev, expected_prev);
                assert_eq!(Segment::length(seg), SEGMENT_SIZE);

                let base = seg as *const u8;
                let mut i = SEGMENT_METADATA_PAGES;
                while i < PAGES_PER_SEGMENT {
                    let page = base.add(i * PAGE_SIZE);
                    let desc = *Segment::descriptor_of(seg, page);
                    match desc.status {
                        PageStatus::Free => {
                            let run = desc.slab_ptr as *mut LargeSlabHeader;
                            assert_eq!(
                                run as usize, page as usize,
                                "free page out of run order"
                            );
                            assert!(listed_runs.contains(&(run as usize)), "free run not listed");
                            walked_runs += 1;
                            let num_pages = (*run).num_pages as usize;
                            assert!(num_pages >= 1 && i + num_pages <= PAGES_PER_SEGMENT);
                            // no two free runs adjacent in address space
                            if i + num_pages < PAGES_PER_SEGMENT {
                                let after =
                                    *Segment::descriptor_of(seg, base.add((i + num_pages) * PAGE_SIZE));
                                assert_ne!(
                                    after.status,
                                    PageStatus::Free,
                                    "adjacent free runs not coalesced"
                                );
                            }
                            i += num_pages;
                        }
                        PageStatus::SmallSlab => {
                            let header = desc.slab_ptr as *mut SmallSlabHeader;
                            assert_eq!(header as usize, page as usize);
                            let class_id = SmallSlabHeader::class_id(header) as usize;
                            assert!(class_id < table.num_classes());
                            let info = table.info(class_id);
                            for j in 0..info.slab_pages {
                                let d = *Segment::descriptor_of(seg, page.add(j * PAGE_SIZE));
                                assert_eq!(d.status, PageStatus::SmallSlab);
                                assert_eq!(d.slab_ptr, header as *mut u8);
                            }
                            // free_count is the bitmap popcount
                            let bitmap = SmallSlabHeader::bitmap_ptr(header);
                            let words = info.slab_capacity.div_ceil(64);
                            let mut ones = 0;
                            for w in 0..words {
                                ones += (*bitmap.add(w)).count_ones() as usize;
                            }
                            assert_eq!(ones, SmallSlabHeader::free_count(header) as usize);
                            // lifecycle: full slabs are unlisted, partial
                            // slabs are cached, empty slabs do not persist
                            assert!(!SmallSlabHeader::is_empty(header), "empty slab not released");
                            if SmallSlabHeader::is_full(header) {
                                assert!((*header).prev.is_null() && (*header).next.is_null());
                            } else {
                                assert!(!(*header).prev.is_null() && !(*header).next.is_null());
                            }
                            i += info.slab_pages;
                        }
                        PageStatus::LargeSlab => {
                            let header = desc.slab_ptr as *mut LargeSlabHeader;
                            assert_eq!(header as usize, page as usize);
                            let num_pages = (*header).num_pages as usize;
                            assert!(num_pages >= 1 && i + num_pages <= PAGES_PER_SEGMENT);
                            for j in 0..num_pages {
                                let d = *Segment::descriptor_of(seg, page.add(j * PAGE_SIZE));
                                assert_eq!(d.status, PageStatus::LargeSlab);
                                assert_eq!(d.slab_ptr, header as *mut u8);
                            }
                            i += num_pages;
                        }
                        PageStatus::Metadata | PageStatus::HugeSlab => {
                            panic!("unexpected page status past the metadata region");
                        }
                    }
                }
                expected_prev = seg;
                seg = (*seg).next;
            }
            assert_eq!(walked_runs, listed_runs.len(), "free run not reachable");

            // cache lists hold partial slabs of the right class only
            for class_id in 0..table.num_classes() {
                let sentinel = state.slab_caches[class_id].sentinel;
                let mut slab = (*sentinel).next;
                while slab != sentinel {
                    assert_eq!(SmallSlabHeader::class_id(slab) as usize, class_id);
                    assert!(!SmallSlabHeader::is_full(slab));
                    assert!(!SmallSlabHeader::is_empty(slab));
                    assert_eq!((*(*slab).next).prev, slab);
                    assert_eq!((*(*slab).prev).next, slab);
                    slab = (*slab).next;
                }
            }

            // huge segments carry the huge marker in their first descriptor
            let mut seg = state.huge_segments;
            let mut expected_prev: *mut Segment = ptr::null_mut();
            while !seg.is_null() {
                assert_eq!((*seg).owner_heap, owner);
                assert_eq!((*seg).prev, expected_prev);
                assert_eq!((*seg).descriptors[0].status, PageStatus::HugeSlab);
                assert!(Segment::length(seg) >= SEGMENT_SIZE);
                expected_prev = seg;
                seg = (*seg).next;
            }
        }
    }
}

impl Default for ThreadHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadHeap {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        // unmapping the segments invalidates every derived structure at
        // once; blocks still held by the user are not reclaimed gracefully
        unsafe {
            HeapState::destroy_segment_list(&mut state.active_segments);
            HeapState::destroy_segment_list(&mut state.huge_segments);
        }
    }
}

impl HeapState {
    //
    // allocation paths
    //

    unsafe fn allocate_small(
        &mut self,
        size: usize,
        owner: *const ThreadHeap,
    ) -> Option<NonNull<u8>> {
        let class_id = SizeClassTable::global().class_of(size)?;
        let sentinel = self.slab_caches[class_id].sentinel;

        let mut slab = (*sentinel).next;
        if slab == sentinel {
            slab = self.allocate_small_slab(class_id, owner)?;
        }

        let block = SmallSlabHeader::allocate_block(slab);
        debug_assert!(block.is_some(), "cached slab had no free block");
        if SmallSlabHeader::is_full(slab) {
            HeapState::cache_unlink(slab);
        }
        block
    }

    /// Carve a fresh slab for `class_id` out of the page pool and cache it
    unsafe fn allocate_small_slab(
        &mut self,
        class_id: usize,
        owner: *const ThreadHeap,
    ) -> Option<*mut SmallSlabHeader> {
        let info = *SizeClassTable::global().info(class_id);
        let slab_ptr = self.acquire_pages(info.slab_pages, owner)?;
        let seg = Segment::of_ptr(slab_ptr);

        let header = slab_ptr as *mut SmallSlabHeader;
        SmallSlabHeader::init(header, class_id as u16);
        for i in 0..info.slab_pages {
            let desc = Segment::descriptor_of(seg, slab_ptr.add(i * PAGE_SIZE));
            (*desc).status = PageStatus::SmallSlab;
            (*desc).slab_ptr = header as *mut u8;
        }

        HeapState::cache_link_front(self.slab_caches[class_id].sentinel, header);
        tracing::event!(
            Level::TRACE,
            class_id,
            slab = ?UsizePtr::from(header),
            pages = info.slab_pages,
            "fresh small slab"
        );
        Some(header)
    }

    unsafe fn allocate_large(
        &mut self,
        size: usize,
        owner: *const ThreadHeap,
    ) -> Option<NonNull<u8>> {
        let num_pages = (size + LARGE_HEADER_SIZE).div_ceil(PAGE_SIZE);
        debug_assert!(num_pages <= AVAILABLE_PAGES);

        let slab_ptr = self.acquire_pages(num_pages, owner)?;
        let seg = Segment::of_ptr(slab_ptr);
        for i in 0..num_pages {
            let desc = Segment::descriptor_of(seg, slab_ptr.add(i * PAGE_SIZE));
            (*desc).status = PageStatus::LargeSlab;
            (*desc).slab_ptr = slab_ptr;
        }

        let header = slab_ptr as *mut LargeSlabHeader;
        LargeSlabHeader::init(header, num_pages as u16);

        // safety: the header sits at a non-null page boundary
        Some(NonNull::new_unchecked(slab_ptr.add(LARGE_HEADER_SIZE)))
    }

    unsafe fn allocate_huge(
        &mut self,
        size: usize,
        owner: *const ThreadHeap,
    ) -> Option<NonNull<u8>> {
        let total_size = roundto(SEGMENT_HEADER_SIZE + size, PAGE_SIZE);
        let seg = match Segment::create(total_size) {
            Ok(seg) => seg.as_ptr(),
            Err(e) => {
                tracing::event!(Level::WARN, size, error = %e, "huge segment mapping failed");
                return None;
            }
        };

        (*seg).owner_heap = owner;
        (*seg).descriptors[0] = PageDescriptor {
            status: PageStatus::HugeSlab,
            slab_ptr: seg as *mut u8,
        };
        HeapState::segment_list_prepend(&mut self.huge_segments, seg);

        // safety: the payload starts inside the mapping, past the header
        Some(NonNull::new_unchecked((seg as *mut u8).add(SEGMENT_HEADER_SIZE)))
    }

    //
    // free paths
    //

    /// Classify a non-huge pointer by its descriptors and route the release
    unsafe fn slab_free(&mut self, ptr: *mut u8) {
        let seg = Segment::of_ptr(ptr);
        let desc = Segment::descriptor_of(seg, ptr);
        let header = (*desc).slab_ptr;
        if header.is_null() {
            debug_assert!(false, "free of pointer into unowned page");
            tracing::event!(Level::WARN, ptr = ?UsizePtr::from(ptr), "free of invalid pointer");
            return;
        }

        // the header page's status is the dispatch oracle; it routes
        // interior pointers of a large slab through the one true header
        match (*Segment::descriptor_of(seg, header)).status {
            PageStatus::LargeSlab => {
                let slab = header as *mut LargeSlabHeader;
                let num_pages = (*slab).num_pages as usize;
                self.release_pages(header, num_pages);
            }
            PageStatus::SmallSlab => {
                self.free_in_small_slab(ptr, header as *mut SmallSlabHeader);
            }
            _ => {
                debug_assert!(false, "free of pointer with no owning slab");
                tracing::event!(Level::WARN, ptr = ?UsizePtr::from(ptr), "free of invalid pointer");
            }
        }
    }

    unsafe fn free_in_small_slab(&mut self, ptr: *mut u8, header: *mut SmallSlabHeader) {
        let was_full = SmallSlabHeader::is_full(header);
        SmallSlabHeader::free_block(header, ptr);

        let class_id = SmallSlabHeader::class_id(header) as usize;
        let info = *SizeClassTable::global().info(class_id);

        if SmallSlabHeader::is_empty(header) {
            // drained: the pages flow back to the pool; the release
            // overwrites the header, so unlink first
            if !(*header).prev.is_null() {
                HeapState::cache_unlink(header);
            }
            self.release_pages(header as *mut u8, info.slab_pages);
        } else if was_full {
            // full -> partial: becomes allocatable again
            HeapState::cache_link_front(self.slab_caches[class_id].sentinel, header);
        }
        // partial -> partial needs no list mutation
    }

    unsafe fn free_huge(&mut self, seg: *mut Segment) {
        HeapState::segment_list_remove(&mut self.huge_segments, seg);
        Segment::destroy(seg);
    }

    //
    // the page pool: free runs indexed by exact page count
    //

    /// Pop a run of exactly `num_pages` pages, splitting a bigger run or
    /// mapping a fresh segment when no exact fit exists
    ///
    /// The returned run's descriptors still read `Free`; the caller owns
    /// rewriting them for whatever the pages become.
    unsafe fn acquire_pages(
        &mut self,
        num_pages: usize,
        owner: *const ThreadHeap,
    ) -> Option<*mut u8> {
        if num_pages == 0 || num_pages > AVAILABLE_PAGES {
            return None;
        }

        // exact fit
        let head = self.free_slabs[num_pages - 1];
        if !head.is_null() {
            self.remove_free_slab(head);
            return Some(head as *mut u8);
        }

        // any bigger run, keeping the front and refiling the remainder
        for index in num_pages..PAGES_PER_SEGMENT {
            let run = self.free_slabs[index];
            if !run.is_null() {
                self.remove_free_slab(run);
                return Some(self.split_slab(run, num_pages));
            }
        }

        // out of reusable runs: grow by one fresh segment
        let seg = match Segment::create(SEGMENT_SIZE) {
            Ok(seg) => seg.as_ptr(),
            Err(e) => {
                tracing::event!(Level::WARN, num_pages, error = %e, "segment mapping failed");
                return None;
            }
        };
        (*seg).owner_heap = owner;
        HeapState::segment_list_prepend(&mut self.active_segments, seg);

        let run_start = (seg as *mut u8).add(SEGMENT_METADATA_PAGES * PAGE_SIZE);
        let run = self.initialize_as_free_slab(run_start, AVAILABLE_PAGES);
        if num_pages == AVAILABLE_PAGES {
            return Some(run as *mut u8);
        }
        Some(self.split_slab(run, num_pages))
    }

    /// Keep the first `required_pages` of `run` for the caller; the
    /// remainder becomes a fresh free run
    unsafe fn split_slab(
        &mut self,
        run: *mut LargeSlabHeader,
        required_pages: usize,
    ) -> *mut u8 {
        let total_pages = (*run).num_pages as usize;
        debug_assert!(total_pages > required_pages);

        let remainder_start = (run as *mut u8).add(required_pages * PAGE_SIZE);
        let remainder = self.initialize_as_free_slab(remainder_start, total_pages - required_pages);
        self.prepend_free_slab(remainder);

        run as *mut u8
    }

    /// Return `num_pages` pages starting at `slab_ptr` to the pool,
    /// coalescing with both address-space neighbors
    unsafe fn release_pages(&mut self, slab_ptr: *mut u8, num_pages: usize) {
        let seg = Segment::of_ptr(slab_ptr);
        let mut start = slab_ptr;
        let mut pages = num_pages;

        // the run after: must stay inside this segment
        let after = slab_ptr.add(num_pages * PAGE_SIZE);
        if (after as usize) < seg as usize + SEGMENT_SIZE {
            let desc = Segment::descriptor_of(seg, after);
            if (*desc).status == PageStatus::Free {
                let next_run = (*desc).slab_ptr as *mut LargeSlabHeader;
                self.remove_free_slab(next_run);
                pages += (*next_run).num_pages as usize;
            }
        }

        // the run before: must not cross into the metadata region
        if (start as usize) > seg as usize + SEGMENT_METADATA_PAGES * PAGE_SIZE {
            let before = start.sub(PAGE_SIZE);
            let desc = Segment::descriptor_of(seg, before);
            if (*desc).status == PageStatus::Free {
                // any page of a free run names the run's first page
                let prev_run = (*desc).slab_ptr as *mut LargeSlabHeader;
                self.remove_free_slab(prev_run);
                pages += (*prev_run).num_pages as usize;
                start = prev_run as *mut u8;
            }
        }

        let run = self.initialize_as_free_slab(start, pages);
        self.prepend_free_slab(run);
    }

    /// Stamp all `num_pages` descriptors of a run as free and build its
    /// header; the one place free-run descriptors are ever written
    unsafe fn initialize_as_free_slab(
        &mut self,
        slab_ptr: *mut u8,
        num_pages: usize,
    ) -> *mut LargeSlabHeader {
        debug_assert!(num_pages >= 1 && num_pages <= AVAILABLE_PAGES);
        let seg = Segment::of_ptr(slab_ptr);
        for i in 0..num_pages {
            let desc = Segment::descriptor_of(seg, slab_ptr.add(i * PAGE_SIZE));
            (*desc).status = PageStatus::Free;
            (*desc).slab_ptr = slab_ptr;
        }
        let header = slab_ptr as *mut LargeSlabHeader;
        LargeSlabHeader::init(header, num_pages as u16);
        header
    }

    unsafe fn prepend_free_slab(&mut self, node: *mut LargeSlabHeader) {
        let index = (*node).num_pages as usize - 1;
        let head = self.free_slabs[index];
        (*node).prev = ptr::null_mut();
        (*node).next = head;
        if !head.is_null() {
            (*head).prev = node;
        }
        self.free_slabs[index] = node;
    }

    unsafe fn remove_free_slab(&mut self, node: *mut LargeSlabHeader) {
        let index = (*node).num_pages as usize - 1;
        if (*node).prev.is_null() {
            debug_assert!(self.free_slabs[index] == node);
            self.free_slabs[index] = (*node).next;
        } else {
            (*(*node).prev).next = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        }
        (*node).prev = ptr::null_mut();
        (*node).next = ptr::null_mut();
    }

    //
    // intrusive list plumbing
    //

    unsafe fn cache_link_front(sentinel: *mut SmallSlabHeader, slab: *mut SmallSlabHeader) {
        (*slab).next = (*sentinel).next;
        (*slab).prev = sentinel;
        (*(*sentinel).next).prev = slab;
        (*sentinel).next = slab;
    }

    unsafe fn cache_unlink(slab: *mut SmallSlabHeader) {
        (*(*slab).prev).next = (*slab).next;
        (*(*slab).next).prev = (*slab).prev;
        (*slab).prev = ptr::null_mut();
        (*slab).next = ptr::null_mut();
    }

    unsafe fn segment_list_prepend(head: &mut *mut Segment, seg: *mut Segment) {
        let old_head = *head;
        (*seg).prev = ptr::null_mut();
        (*seg).next = old_head;
        if !old_head.is_null() {
            (*old_head).prev = seg;
        }
        *head = seg;
    }

    unsafe fn segment_list_remove(head: &mut *mut Segment, seg: *mut Segment) {
        if (*seg).prev.is_null() {
            debug_assert!(*head == seg);
            *head = (*seg).next;
        } else {
            (*(*seg).prev).next = (*seg).next;
        }
        if !(*seg).next.is_null() {
            (*(*seg).next).prev = (*seg).prev;
        }
        (*seg).prev = ptr::null_mut();
        (*seg).next = ptr::null_mut();
    }

    unsafe fn destroy_segment_list(head: &mut *mut Segment) {
        let mut seg = *head;
        while !seg.is_null() {
            let next = (*seg).next;
            Segment::destroy(seg);
            seg = next;
        }
        *head = ptr::null_mut();
    }
}
