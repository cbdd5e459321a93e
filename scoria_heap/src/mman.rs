//! OS page-mapping primitives
//!
//! Thin wrappers over anonymous `mmap`/`munmap` plus the aligned-mapping
//! strategy the segment layer depends on: over-request `align - PAGE_SIZE`
//! extra bytes, then trim the unaligned head and the unused tail back to the
//! kernel, leaving exactly the requested length at an address aligned to
//! `align`. `munmap` on a page-aligned sub-range of a prior mapping is
//! guaranteed by POSIX, which is what makes the trim legal.

use std::ptr::{self, NonNull};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;
use tracing::Level;

use crate::segment::PAGE_SIZE;
use crate::util::{roundto, UsizePtr};

/// Failure from the kernel mapping layer, usually `ENOMEM`
#[derive(Debug, Error)]
pub enum MapError {
    #[error("anonymous mapping of {length} bytes failed: {source}")]
    MapFailed { length: usize, source: nix::Error },
}

/// Anonymous private read/write mapping of `length` bytes at any address
pub fn map_anonymous(length: usize) -> Result<NonNull<u8>, MapError> {
    debug_assert!(length > 0 && length % PAGE_SIZE == 0);

    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .map_err(|source| MapError::MapFailed { length, source })?;

    // safety: a successful mmap never returns null
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
}

/// Release a previously mapped (or trimmed) page-aligned range
///
/// Failures are not recoverable by the caller (the address range was handed
/// to us by our own mapping layer), so they are only logged.
pub unsafe fn unmap(ptr: *mut u8, length: usize) {
    debug_assert!(ptr as usize % PAGE_SIZE == 0 && length % PAGE_SIZE == 0);

    if let Err(e) = munmap(ptr as *mut libc::c_void, length) {
        tracing::event!(
            Level::WARN,
            ptr = ?UsizePtr::from(ptr),
            length,
            error = %e,
            "munmap failed"
        );
    }
}

/// Anonymous mapping of `length` bytes whose start is aligned to `align`
///
/// `length` must be a page multiple but need not be a multiple of `align`.
pub fn map_aligned(length: usize, align: usize) -> Result<NonNull<u8>, MapError> {
    debug_assert!(align.is_power_of_two() && align >= PAGE_SIZE);
    debug_assert!(length > 0 && length % PAGE_SIZE == 0);

    // The worst-case head trim is align - PAGE_SIZE bytes; requesting that
    // much extra guarantees an aligned start inside the mapping.
    let padded_length = length + align - PAGE_SIZE;
    let base = map_anonymous(padded_length)?;

    let base_addr = base.as_ptr() as usize;
    let aligned_addr = roundto(base_addr, align);

    let head_length = aligned_addr - base_addr;
    if head_length > 0 {
        unsafe { unmap(base.as_ptr(), head_length) };
    }

    let tail_length = (base_addr + padded_length) - (aligned_addr + length);
    if tail_length > 0 {
        unsafe { unmap((aligned_addr + length) as *mut u8, tail_length) };
    }

    // safety: aligned_addr lies inside a successful mapping, never null
    Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
}
