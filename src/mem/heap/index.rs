//! Index slabs: the per-size-class linked list of page-sized chunks that
//! track, for each data slab, its free-slot count and its base pointer —
//! the "SoA pair of parallel arrays" spec §3/§4.4 describes.
//!
//! Laid out with [`ChunkLayout`] at a runtime `chunk_size` equal to the host
//! page size, which is the same placement algorithm the ECS-facing
//! component arrays use — an index slab is, structurally, just a chunk
//! whose two fields happen to be heap bookkeeping rather than game data.

use crate::mem::chunk::{ChunkLayout, Field};
use crate::mem::heap::slab::SlabHeader;
use crate::mem::pages::{self, PageRun};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Header at the base of an index slab.
#[repr(C)]
pub(crate) struct IndexSlabHeader {
    pub next: Option<NonNull<IndexSlabHeader>>,
    pub capacity: usize,
    pub in_use: usize,
}

fn layout() -> &'static ChunkLayout {
    static LAYOUT: OnceLock<ChunkLayout> = OnceLock::new();
    LAYOUT.get_or_init(|| {
        ChunkLayout::compute(
            pages::page_size(),
            std::mem::size_of::<IndexSlabHeader>(),
            std::mem::align_of::<IndexSlabHeader>(),
            &[Field::of::<u32>(), Field::of::<*mut SlabHeader>()],
        )
    })
}

/// Allocates a fresh, zeroed index slab (one host page) and links it as the
/// new head of `existing_head`.
pub(crate) fn push_index_slab(
    existing_head: Option<NonNull<IndexSlabHeader>>,
) -> Result<NonNull<IndexSlabHeader>, crate::error::PagesError> {
    let ps = pages::page_size();
    let run = pages::obtain(ps, ps)?;
    let base = run.as_ptr();
    std::mem::forget(run);
    let layout = layout();
    let header_ptr = base.cast::<IndexSlabHeader>();
    // SAFETY: `base` is a freshly mapped, page-sized, page-aligned run.
    unsafe {
        header_ptr.write(IndexSlabHeader { next: existing_head, capacity: layout.num_items(), in_use: 0 });
        let free_counts = free_counts_mut(NonNull::new_unchecked(header_ptr));
        let data_slabs = data_slabs_mut(NonNull::new_unchecked(header_ptr));
        free_counts.fill(0);
        data_slabs.fill(std::ptr::null_mut());
    }
    Ok(unsafe { NonNull::new_unchecked(header_ptr) })
}

/// Releases the page backing `slab`. Does not unlink it; callers walk the
/// whole list away first.
pub(crate) unsafe fn release_index_slab(slab: NonNull<IndexSlabHeader>) {
    let ps = pages::page_size();
    pages::release(PageRun::from_raw(slab.as_ptr().cast(), ps));
}

/// The free-slot-count array, length `capacity`.
pub(crate) unsafe fn free_counts_mut(slab: NonNull<IndexSlabHeader>) -> &'static mut [u32] {
    let layout = layout();
    let base = slab.as_ptr().cast::<u8>();
    let ptr = base.add(layout.offsets()[0]).cast::<u32>();
    std::slice::from_raw_parts_mut(ptr, layout.num_items())
}

/// The data-slab-pointer array, length `capacity`. `null` means the entry is
/// unused (beyond `in_use`).
pub(crate) unsafe fn data_slabs_mut(slab: NonNull<IndexSlabHeader>) -> &'static mut [*mut SlabHeader] {
    let layout = layout();
    let base = slab.as_ptr().cast::<u8>();
    let ptr = base.add(layout.offsets()[1]).cast::<*mut SlabHeader>();
    std::slice::from_raw_parts_mut(ptr, layout.num_items())
}

/// Capacity of every index slab at the current page size.
pub(crate) fn capacity() -> usize {
    layout().num_items()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_index_slab_is_empty() {
        let slab = push_index_slab(None).unwrap();
        unsafe {
            assert_eq!(slab.as_ref().in_use, 0);
            assert!(slab.as_ref().capacity > 0);
            assert!(free_counts_mut(slab).iter().all(|&c| c == 0));
            assert!(data_slabs_mut(slab).iter().all(|&p| p.is_null()));
            release_index_slab(slab);
        }
    }

    #[test]
    fn linking_preserves_previous_head() {
        let first = push_index_slab(None).unwrap();
        let second = push_index_slab(Some(first)).unwrap();
        unsafe {
            assert_eq!(second.as_ref().next, Some(first));
            release_index_slab(second);
            release_index_slab(first);
        }
    }
}
