//! Pages: the primitive facade for obtaining and releasing OS-aligned page
//! runs. Every other allocator in this crate (the arena, the block heap)
//! ultimately bottoms out here.
//!
//! No intermediate global allocator sits between this module and the OS:
//! Unix goes through `libc::mmap`/`munmap`, Windows through
//! `VirtualAlloc`/`VirtualFree`, mirroring the split already declared in the
//! pack (`libc`, `windows-sys`) and demonstrated end-to-end in
//! `mimalloc-rs`'s `os.rs`.

use crate::error::PagesError;
use crate::mem::util::{align_down, align_up, is_power_of_two};
use std::sync::OnceLock;

mod syscall;

/// A contiguous byte range whose base address is aligned to at least the
/// host page size, obtained from and returned to the OS page mapper.
///
/// Immutable in length once mapped: `shrink` only ever narrows the *logical*
/// view a caller holds, it never physically unmaps or relocates.
#[derive(Debug)]
pub struct PageRun {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: a `PageRun` owns a mapping exclusively; moving it between threads
// is sound as long as the caller does not alias it, which is the same
// contract raw pointers already carry.
unsafe impl Send for PageRun {}

impl PageRun {
    /// Reconstructs a `PageRun` from a raw pointer and length previously
    /// obtained from [`PageRun::as_ptr`]/[`PageRun::len`].
    ///
    /// Exists so allocators built on top of Pages (the arena, the block
    /// heap) can store a run's identity inline in their own bookkeeping
    /// instead of holding a `PageRun` value, and hand it back to
    /// [`release`] later.
    ///
    /// # Safety
    /// `ptr` and `len` must together describe a range currently mapped by
    /// this module and not already reconstructed and released elsewhere.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// The base address of the run.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The length of the run in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` iff the run is empty (which `obtain` never returns).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Returns the host page size in bytes, queried once and cached for the
/// lifetime of the process.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(syscall::query_page_size)
}

fn check_request(size: usize, align: usize) {
    let ps = page_size();
    debug_assert!(size > 0 && size % ps == 0, "size must be a nonzero multiple of the page size");
    debug_assert!(align % ps == 0, "alignment must be a multiple of the page size");
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
}

/// Maps a fresh page run of `size` bytes aligned to `align`.
///
/// # Preconditions
/// `size` and `align` must be multiples of [`page_size`], and `align` must
/// be a power of two no smaller than [`page_size`]. Violating this is a
/// programmer error and panics in debug builds.
///
/// # Errors
/// Returns [`PagesError::OutOfMemory`] if the OS page mapper cannot satisfy
/// the request.
pub fn obtain(size: usize, align: usize) -> Result<PageRun, PagesError> {
    check_request(size, align);
    let ps = page_size();
    let ptr = if align <= ps {
        syscall::map(size)
    } else {
        syscall::map_aligned(size, align)
    };
    match ptr {
        Some(ptr) => Ok(PageRun { ptr, len: size }),
        None => Err(PagesError::OutOfMemory { size, align }),
    }
}

/// Grows or shrinks `run` to `new_size` bytes aligned to `new_align`,
/// possibly relocating it.
///
/// If the existing run already satisfies the new size and alignment it is
/// returned unchanged (no syscall). Otherwise a fresh run is obtained, the
/// overlapping prefix copied across, and the old run released.
///
/// # Errors
/// Returns [`PagesError::OutOfMemory`] if a relocation is required and the
/// OS page mapper cannot satisfy it. `run` is left intact on failure.
pub fn realloc(run: PageRun, new_size: usize, new_align: usize) -> Result<PageRun, PagesError> {
    check_request(new_size, new_align);
    if run.len == new_size && (run.ptr as usize) % new_align == 0 {
        return Ok(run);
    }
    let new_run = obtain(new_size, new_align)?;
    let copy_len = run.len.min(new_size);
    if copy_len > 0 {
        // SAFETY: both ranges are live mappings of at least `copy_len`
        // bytes, and they cannot overlap since `new_run` was freshly mapped.
        unsafe {
            std::ptr::copy_nonoverlapping(run.ptr, new_run.ptr, copy_len);
        }
    }
    release(run);
    Ok(new_run)
}

/// Narrows `run`'s logical length to `new_size` (aligned to `new_align`).
///
/// This never fails: if the alignment cannot be satisfied in place, the
/// pages are left fully mapped and the caller simply receives back the
/// smaller logical view at the same base address, exactly as spec §4.1
/// permits ("may just cap length"). No physical unmap happens here; the
/// full range is released together when the caller eventually calls
/// [`release`].
#[must_use]
pub fn shrink(run: PageRun, new_size: usize, new_align: usize) -> PageRun {
    debug_assert!(new_size <= run.len);
    if (run.ptr as usize) % new_align == 0 {
        PageRun { ptr: run.ptr, len: new_size }
    } else {
        run
    }
}

/// Returns `run` to the OS.
pub fn release(run: PageRun) {
    if run.len == 0 {
        return;
    }
    syscall::unmap(run.ptr, run.len);
}

/// Rounds `size` up to a multiple of [`page_size`].
#[must_use]
pub fn round_to_page_size(size: usize) -> usize {
    align_up(size, page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_returns_page_aligned_memory() {
        let ps = page_size();
        let run = obtain(ps, ps).expect("obtain should succeed");
        assert_eq!(run.as_ptr() as usize % ps, 0);
        assert_eq!(run.len(), ps);
        release(run);
    }

    #[test]
    fn obtain_honors_over_aligned_request() {
        let ps = page_size();
        let align = ps * 16;
        let run = obtain(align, align).expect("obtain should succeed");
        assert_eq!(run.as_ptr() as usize % align, 0);
        release(run);
    }

    #[test]
    fn realloc_preserves_prefix_bytes() {
        let ps = page_size();
        let mut run = obtain(ps, ps).expect("obtain should succeed");
        unsafe {
            std::ptr::write_bytes(run.as_ptr(), 0xAB, 16);
        }
        run = realloc(run, ps * 2, ps).expect("realloc should succeed");
        let bytes = unsafe { std::slice::from_raw_parts(run.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0xAB));
        release(run);
    }

    #[test]
    fn shrink_never_fails_and_caps_length() {
        let ps = page_size();
        let run = obtain(ps * 4, ps).expect("obtain should succeed");
        let base = run.as_ptr();
        let run = shrink(run, ps, ps);
        assert_eq!(run.as_ptr(), base);
        assert_eq!(run.len(), ps);
        release(run);
    }

    #[test]
    fn round_to_page_size_rounds_up() {
        let ps = page_size();
        assert_eq!(round_to_page_size(1), ps);
        assert_eq!(round_to_page_size(ps), ps);
        assert_eq!(round_to_page_size(ps + 1), ps * 2);
    }
}
