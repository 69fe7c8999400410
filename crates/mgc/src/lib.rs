//! # MGC - Parallel Mark-and-Sweep Garbage Collector
//!
//! MGC is a stop-the-world, non-moving, mark-and-sweep collector over a
//! bitmap-indexed heap. Every cycle recomputes reachability from scratch:
//! no generations, no write barriers, no reference counts.
//!
//! ## Overview
//!
//! - **Bitmap index**: four bits per heap word (allocated, no-pointers /
//!   block boundary, marked, special) in a region growing down from the
//!   arena start; no object headers
//! - **Conservative scanning**: any word that lands inside an allocated
//!   block keeps that block alive, interior pointers included
//! - **Parallel mark**: roots are split over workers; pending objects sit
//!   in pooled work buffers with lock-free handoff between idle and busy
//!   workers
//! - **Parallel sweep**: one task per span, bulk-freed to the central lists
//! - **Finalizers**: unreachable objects with a finalizer survive one more
//!   cycle; a runner thread calls the finalizer outside the pause
//!
//! ## Quick Start
//!
//! ```rust
//! use mgc::{GcConfig, Runtime};
//!
//! fn main() -> Result<(), mgc::GcError> {
//!     let runtime = Runtime::new(GcConfig::for_testing())?;
//!     let mut mutator = runtime.attach();
//!
//!     // Keep `list` alive through the root stack
//!     let list = mutator.alloc(64)?;
//!     mutator.push_root(list);
//!     let node = mutator.alloc_noscan(32)?;
//!     mutator.write_slot(list, 0, node)?;
//!
//!     let outcome = mutator.collect(true)?;
//!     assert!(outcome.is_completed());
//!     assert_eq!(mutator.read_slot(list, 0)?, node);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Mutator Threads                      │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐               │
//! │  │ cache +  │  │ cache +  │  │ cache +  │  root stacks  │
//! │  │ stack    │  │ stack    │  │ stack    │  (segmented)  │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘               │
//! │       └─────── safepoint poll ────┘                     │
//! └───────────────────────────┼─────────────────────────────┘
//!                             │ stop the world
//! ┌───────────────────────────┼─────────────────────────────┐
//! │           Initiator (worker 0) + helpers 1..n           │
//! │                           ▼                             │
//! │  roots ─ParFor─> mark ─work buffers─> drain             │
//! │                           │                             │
//! │                           ▼                             │
//! │  spans ─ParFor─> sweep ─> free lists / free spans       │
//! │                           │                             │
//! │                           ▼                             │
//! │  finalizer queue ─────> runner thread (after restart)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Safety
//!
//! Objects are raw addresses. Callers must:
//!
//! 1. **Root what they keep**: a block reachable only from Rust locals is
//!    garbage at the next cycle
//! 2. **Publish before the next safepoint**: push a fresh object on the
//!    root stack (or store it in a rooted object) before calling `alloc`,
//!    `poll` or `blocking` again
//! 3. **Stay inside blocks**: use `write_slot` / `read_slot`, or keep raw
//!    accesses within the allocated size
//!
//! ### Thread Safety
//!
//! - `Runtime` and `Collector` are `Send + Sync`
//! - `Mutator` is bound to the thread that attached it

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod logging;
pub mod marker;
pub mod runtime;
pub mod stats;
pub mod sweep;
pub mod util;

pub use config::{GcConfig, GB, KB, MAX_GC_PROCS, MB};
pub use error::{GcError, Result};
pub use gc::{CollectOutcome, Collector, GcState, LockDepth, SkipReason};
pub use logging::{GcEvent, GcLogger};
pub use runtime::finalizer::FinalizerFn;
pub use runtime::{CallTrampoline, DirectCall, Mutator, Runtime};
pub use stats::{CycleStats, MemStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
