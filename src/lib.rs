//! # `forge-rt` — runtime substrate for a data-oriented ECS
//!
//! Three tightly coupled subsystems: a segregated-size-class page heap, a
//! compile-time/runtime chunk layout schema for structure-of-arrays data,
//! and a bounded lock-free MPMC ring queue with a work-stealing job
//! scheduler built on top of it.
//!
//! ## Layout
//!
//! - [`mem::pages`] — OS page mapping (`mmap`/`VirtualAlloc`), the floor
//!   every other allocator in this crate bottoms out at.
//! - [`mem::chunk`] — packs a header plus N parallel arrays into one
//!   aligned chunk; used both by the block heap's index slabs and by
//!   client ECS code laying out component arrays.
//! - [`mem::arena`] — a bump allocator over linked pages, freed as a unit.
//! - [`mem::heap`] — the segregated-size-class block heap, the crate's
//!   general-purpose allocator.
//! - [`sync::queue`] — the bounded MPMC ring queue.
//! - [`job`] — the dependency-DAG job scheduler built on that queue.
//!
//! ## Example
//!
//! ```rust
//! use forge_rt::{JobSystem, JobSystemConfig};
//! use std::sync::Arc;
//!
//! let system = Arc::new(JobSystem::new(&JobSystemConfig { num_jobs: 64, num_workers: 2 }));
//! system.startup();
//! let a = system.schedule(1u32, |p, _| println!("job A saw {p}"), &[]);
//! let b = system.schedule(2u32, |p, _| println!("job B saw {p}"), &[a]);
//! system.wait(b).unwrap();
//! system.shutdown();
//! ```

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod job;
pub mod mem;
pub mod sync;

pub use config::{HeapConfig, JobSystemConfig};
pub use job::{JobId, JobInterface, JobSystem};
pub use mem::{BlockHeap, ChunkLayout, Field, PageRun, ShardedHeap};
pub use sync::MpmcQueue;
