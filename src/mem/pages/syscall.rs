//! OS-level page mapping primitives.
//!
//! The `unix` path is a thin wrapper around `mmap`/`munmap`. The `windows`
//! path wraps `VirtualAlloc`/`VirtualFree`. Over-alignment (requesting a
//! base address aligned beyond the platform's native mapping granularity)
//! is handled by the classic over-allocate-then-trim technique: map
//! `size + align` bytes, then narrow to the aligned middle — three mapping
//! calls on Unix (which can unmap sub-ranges of a mapping), a bounded retry
//! loop on Windows (which cannot).

#[cfg(unix)]
pub(super) fn query_page_size() -> usize {
    // SAFETY: `sysconf` with a valid `_SC_PAGESIZE` argument has no
    // preconditions beyond being callable, which it always is.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(windows)]
pub(super) fn query_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a valid, writable `SYSTEM_INFO` of the right size.
    unsafe { GetSystemInfo(&mut info) };
    if info.dwPageSize > 0 {
        info.dwPageSize as usize
    } else {
        4096
    }
}

#[cfg(unix)]
pub(super) fn map(size: usize) -> Option<*mut u8> {
    // SAFETY: arguments describe an anonymous, private mapping of `size`
    // bytes; `mmap` never reads through `addr` when it is null.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr.cast())
    }
}

#[cfg(unix)]
pub(super) fn map_aligned(size: usize, align: usize) -> Option<*mut u8> {
    let over_size = size.checked_add(align)?;
    let base = map(over_size)?;
    let base_addr = base as usize;
    let aligned_addr = (base_addr + align - 1) & !(align - 1);
    let aligned = aligned_addr as *mut u8;

    let pre = aligned_addr - base_addr;
    let post = over_size - pre - size;
    if pre > 0 {
        unsafe { libc::munmap(base.cast(), pre) };
    }
    if post > 0 {
        unsafe { libc::munmap(aligned.add(size).cast(), post) };
    }
    Some(aligned)
}

#[cfg(unix)]
pub(super) fn unmap(ptr: *mut u8, size: usize) {
    // SAFETY: callers only pass back ranges previously returned by `map`
    // or `map_aligned`, of exactly the length recorded in the `PageRun`.
    unsafe {
        libc::munmap(ptr.cast(), size);
    }
}

#[cfg(windows)]
pub(super) fn map(size: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    // SAFETY: requests a fresh reserved-and-committed region; no aliasing
    // is possible since the OS chooses the base address.
    let ptr = unsafe {
        VirtualAlloc(std::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };
    if ptr.is_null() {
        None
    } else {
        Some(ptr.cast())
    }
}

#[cfg(windows)]
pub(super) fn map_aligned(size: usize, align: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    // Windows cannot release a sub-range of a mapping, so over-allocate,
    // free the whole thing, then retry at the now-known-aligned address.
    // This races against other threads mapping in the interim; retry a
    // bounded number of times before giving up.
    const ATTEMPTS: u32 = 8;
    for _ in 0..ATTEMPTS {
        let over_size = size.checked_add(align)?;
        let probe = map(over_size)?;
        let probe_addr = probe as usize;
        unsafe { VirtualFree(probe.cast(), 0, MEM_RELEASE) };

        let aligned_addr = (probe_addr + align - 1) & !(align - 1);
        let aligned = aligned_addr as *mut u8;
        // SAFETY: requesting a specific address is a hint; VirtualAlloc
        // returns null on failure rather than aliasing live memory.
        let p = unsafe {
            VirtualAlloc(aligned.cast(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if !p.is_null() && p as usize == aligned_addr {
            return Some(aligned);
        }
        if !p.is_null() {
            unsafe { VirtualFree(p.cast(), 0, MEM_RELEASE) };
        }
    }
    None
}

#[cfg(windows)]
pub(super) fn unmap(ptr: *mut u8, _size: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    // SAFETY: `ptr` is the base address returned by a prior `map`/
    // `map_aligned` call; `VirtualFree` with `MEM_RELEASE` requires the
    // full original region and ignores the size argument.
    unsafe {
        VirtualFree(ptr.cast(), 0, MEM_RELEASE);
    }
}
