//! Memory subsystem: the page mapper, the chunk layout schema built on top
//! of it, the bump arena, and the segregated-size-class block heap.

pub mod arena;
pub mod chunk;
pub mod heap;
pub mod pages;
pub mod util;

pub use chunk::{ChunkLayout, Field};
pub use heap::{BlockHeap, ShardedHeap};
pub use pages::{page_size, PageRun};
