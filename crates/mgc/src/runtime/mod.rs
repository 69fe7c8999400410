//! Runtime Module - Collector Integration
//!
//! The facade a host program uses:
//! - [`Runtime`]: owns the collector, enables it, shuts it down on drop
//! - [`Mutator`]: one per thread touching the heap; allocates, keeps its
//!   roots on a managed stack and stops at safepoints
//!
//! ```text
//!  Runtime ──attach()──> Mutator ── alloc / push_root / write_slot
//!     │                     │
//!     └──── Arc<Collector> ─┘
//! ```
//!
//! A mutator only pauses inside [`Mutator::poll`], [`Mutator::alloc`],
//! [`Mutator::blocking`] and finalizer runs. Between an allocation and the
//! `push_root` that publishes it, no cycle can run on its behalf.

pub mod finalizer;
pub mod profile;
pub mod world;

pub use finalizer::{CallTrampoline, DirectCall, FinalizerFn};
pub use profile::{MemProfile, ProfileSnapshot};
pub use world::{ContextRole, ContextStatus, ExecutionContext, World};

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::gc::{CollectOutcome, Collector};
use crate::stats::{CycleStats, MemStats};
use crate::util::WORD;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Runtime - owner of one collector
pub struct Runtime {
    collector: Arc<Collector>,
}

impl Runtime {
    /// Create a runtime with finalizers called directly
    ///
    /// # Errors
    /// Invalid configuration or a failed arena reservation.
    pub fn new(config: GcConfig) -> Result<Self> {
        Self::with_trampoline(config, Box::new(DirectCall))
    }

    /// Create a runtime with a custom finalizer call path
    pub fn with_trampoline(config: GcConfig, trampoline: Box<dyn CallTrampoline>) -> Result<Self> {
        let collector = Collector::new(config, trampoline)?;
        collector.enable();
        Ok(Self { collector })
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Register the calling thread as a mutator
    pub fn attach(&self) -> Mutator {
        Mutator::new(Arc::clone(&self.collector))
    }

    /// See [`Collector::collect`]
    pub fn collect(&self, force: bool) -> Result<CollectOutcome> {
        self.collector.collect(force)
    }

    /// Consistent heap statistics; pauses the world briefly
    pub fn stats(&self) -> MemStats {
        self.collector.read_stats()
    }

    pub fn last_cycle(&self) -> Option<CycleStats> {
        self.collector.last_cycle()
    }

    /// Write a text dump of every span and allocated block to `out`
    pub fn dump_heap<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        self.collector.dump_heap(out)
    }

    /// Run queued finalizers on the calling thread
    ///
    /// Returns how many ran.
    pub fn run_finalizers(&self) -> usize {
        match self.collector.world().current() {
            Some(ctx) => finalizer::drain_pending(&self.collector, &ctx, &mut Vec::new()),
            None => self.attach().run_finalizers(),
        }
    }

    /// Return memory of spans idle for `idle_for` to the OS
    pub fn scavenge(&self, idle_for: Duration) -> usize {
        self.collector.scavenge(idle_for)
    }

    /// Stop the finalizer runner and helper threads
    pub fn shutdown(&self) {
        self.collector.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.collector.shutdown();
    }
}

/// A thread's handle on the collected heap
///
/// Bound to the thread that attached it.
pub struct Mutator {
    collector: Arc<Collector>,
    ctx: Arc<ExecutionContext>,
    frame: Vec<u8>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    fn new(collector: Arc<Collector>) -> Self {
        let ctx = collector.world().attach(ContextRole::Mutator);
        Self {
            collector,
            ctx,
            frame: Vec::new(),
            _not_send: PhantomData,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Allocate `size` zeroed bytes that may hold pointers
    ///
    /// May run a collection first, so earlier objects must already be
    /// reachable from a root.
    ///
    /// # Errors
    /// `OutOfMemory` when the arena is exhausted even after a collection.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        self.allocate(size, false)
    }

    /// Allocate `size` zeroed bytes the collector never scans
    pub fn alloc_noscan(&mut self, size: usize) -> Result<usize> {
        self.allocate(size, true)
    }

    fn allocate(&mut self, size: usize, no_pointers: bool) -> Result<usize> {
        let collector = &*self.collector;
        collector.world().poll(&self.ctx);
        if collector.heap().heap_alloc() >= collector.next_gc() {
            collector.collect(false)?;
        }

        let first = collector
            .heap()
            .alloc(&mut self.ctx.cache.lock(), size, no_pointers);
        match first {
            // No collection can make room for more than the whole arena.
            Err(GcError::OutOfMemory { .. }) if size <= collector.heap().arena().capacity() => {
                log::debug!("allocation of {} bytes failed; collecting", size);
                collector.collect(true)?;
                collector
                    .heap()
                    .alloc(&mut self.ctx.cache.lock(), size, no_pointers)
            }
            other => other,
        }
    }

    /// Push `v` on this thread's root stack
    pub fn push_root(&mut self, v: usize) {
        self.ctx.stack.lock().push(v);
    }

    pub fn pop_root(&mut self) -> Option<usize> {
        self.ctx.stack.lock().pop()
    }

    /// Root `n` counted from the top of the stack (0 = newest)
    pub fn get_root(&self, n: usize) -> Option<usize> {
        self.ctx.stack.lock().get(n)
    }

    /// Overwrite root `n`; false when the stack is shallower
    pub fn set_root(&mut self, n: usize, v: usize) -> bool {
        self.ctx.stack.lock().set(n, v)
    }

    pub fn root_depth(&self) -> usize {
        self.ctx.stack.lock().depth()
    }

    /// Address of word `index` of the block starting at `obj`
    fn slot_addr(&self, obj: usize, index: usize) -> Result<usize> {
        match self.collector.heap().lookup_object(obj) {
            Some((base, size)) if base == obj && index < size / WORD => Ok(obj + index * WORD),
            _ => Err(GcError::InvalidPointer {
                address: obj.wrapping_add(index.wrapping_mul(WORD)),
            }),
        }
    }

    /// Store `value` in word `index` of `obj`
    ///
    /// # Errors
    /// `InvalidPointer` unless `obj` starts an allocated block with at least
    /// `index + 1` words.
    pub fn write_slot(&mut self, obj: usize, index: usize, value: usize) -> Result<()> {
        let addr = self.slot_addr(obj, index)?;
        // SAFETY: in bounds of an allocated block; the world cannot be
        // stopped while this context is running.
        unsafe { std::ptr::write(addr as *mut usize, value) };
        Ok(())
    }

    /// Load word `index` of `obj`
    pub fn read_slot(&self, obj: usize, index: usize) -> Result<usize> {
        let addr = self.slot_addr(obj, index)?;
        // SAFETY: as in `write_slot`.
        Ok(unsafe { std::ptr::read(addr as *const usize) })
    }

    /// Safepoint
    pub fn poll(&self) {
        self.collector.world().poll(&self.ctx);
    }

    /// Run `f` without holding up collections
    ///
    /// `f` must not touch the collected heap or this mutator's roots.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.collector.world().blocking(&self.ctx, f)
    }

    /// See [`Collector::collect`]
    pub fn collect(&self, force: bool) -> Result<CollectOutcome> {
        self.collector.collect(force)
    }

    /// See [`Collector::set_finalizer`]
    pub fn set_finalizer(&self, obj: usize, func: FinalizerFn, nret: usize) -> Result<()> {
        self.collector.set_finalizer(obj, func, nret)
    }

    /// See [`Collector::remove_finalizer`]
    pub fn remove_finalizer(&self, obj: usize) -> bool {
        self.collector.remove_finalizer(obj)
    }

    /// Run queued finalizers on this thread; returns how many ran
    pub fn run_finalizers(&mut self) -> usize {
        finalizer::drain_pending(&self.collector, &self.ctx, &mut self.frame)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let heap = self.collector.heap();
        let ctx = &self.ctx;
        self.collector
            .world()
            .detach(ctx, || heap.release_cache(&mut ctx.cache.lock()));
    }
}
