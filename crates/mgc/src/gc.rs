//! GC Core Module - Collection Cycle Management
//!
//! The [`Collector`] owns every piece of collector state and runs the
//! stop-the-world cycle:
//!
//! ```text
//!  Idle ─> Pausing ─> Marking ─> Sweeping ─> (Finalizing) ─> Idle
//!           │           │           │             │
//!       stop world   roots +     parallel     wake/start
//!       flush caches parallel    sweep        finalizer runner
//!                    mark
//! ```
//!
//! One cycle token serializes everything that stops the world: cycles and
//! [`Collector::read_stats`]. A mutator waiting for the token is parked in
//! the `Waiting` state, so a cycle already in progress never waits for it.

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::heap::Heap;
use crate::logging::{GcEvent, GcLogger, GcPhase};
use crate::marker::gc_threads::{CycleJob, GcThreadPool};
use crate::marker::{self, MarkStats, MarkWorker, Root, RootSet, RootSources, WorkPool};
use crate::runtime::finalizer::{
    CallTrampoline, FinalizerEntry, FinalizerFn, FinalizerRunner, Finalizers,
};
use crate::runtime::profile::MemProfile;
use crate::runtime::world::{ContextStatus, ExecutionContext, World};
use crate::stats::{CycleStats, GcTimer, MemStats, PauseHistory, SizeClassStats};
use crate::sweep::{SpecialHandler, SweepStats, Sweeper};
use crate::util::BackoffStats;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// GC cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// No cycle in progress
    Idle,
    /// Stopping mutators
    Pausing,
    /// Enumerating roots and marking
    Marking,
    /// Reclaiming unmarked blocks
    Sweeping,
    /// Handing queued finalizers to the runner
    Finalizing,
}

/// Why a collection request was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The calling thread holds a [`LockDepth`] guard
    LocksHeld,
    /// The thread is panicking or the collector hit a fatal error
    Failing,
    /// Collection is disabled by a negative `gc_percent`
    Disabled,
    /// The collector has not been enabled yet, or was shut down
    NotEnabled,
}

/// Result of [`Collector::collect`]
#[derive(Debug, Clone)]
pub enum CollectOutcome {
    /// A full cycle ran
    Completed(CycleStats),
    /// Not forced and the heap has not reached the trigger
    BelowThreshold,
    Skipped(SkipReason),
}

impl CollectOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CollectOutcome::Completed(_))
    }

    pub fn cycle_stats(&self) -> Option<&CycleStats> {
        match self {
            CollectOutcome::Completed(stats) => Some(stats),
            _ => None,
        }
    }
}

thread_local! {
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the calling thread as holding a lock
///
/// Collection requests from a thread holding one are dropped: the cycle
/// could otherwise wait on a lock its own caller holds.
pub struct LockDepth {
    _not_send: PhantomData<*const ()>,
}

impl LockDepth {
    pub fn acquire() -> Self {
        LOCK_DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    /// True while the calling thread holds at least one guard
    pub fn held() -> bool {
        LOCK_DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for LockDepth {
    fn drop(&mut self) {
        LOCK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Restores a usable world if a cycle unwinds
struct FailGuard<'a> {
    collector: &'a Collector,
}

impl Drop for FailGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let c = self.collector;
            c.failing.store(true, Ordering::SeqCst);
            c.threads.retire();
            *c.state.lock() = GcState::Idle;
            if c.world.is_stopped() {
                c.world.start_the_world();
            }
        }
    }
}

/// The collector
///
/// ## Thread Safety
///
/// Shared by `Arc` between the runtime, the helper threads and the
/// finalizer runner. Everything that stops the world runs under the cycle
/// token.
pub struct Collector {
    config: GcConfig,
    heap: Heap,
    world: World,
    pool: WorkPool,
    threads: GcThreadPool,
    finalizers: Finalizers,
    profile: MemProfile,
    trampoline: Box<dyn CallTrampoline>,
    logger: GcLogger,
    globals: RwLock<Vec<Root>>,
    /// Root set reused across cycles
    roots: Mutex<RootSet>,
    cycle: Mutex<()>,
    state: Mutex<GcState>,
    next_gc: AtomicUsize,
    history: Mutex<PauseHistory>,
    last_cycle: Mutex<Option<CycleStats>>,
    runner: Mutex<Option<FinalizerRunner>>,
    enabled: AtomicBool,
    shut_down: AtomicBool,
    failing: AtomicBool,
    me: Weak<Collector>,
    /// Phase in which helpers panic on purpose
    #[cfg(test)]
    helper_fault: Mutex<Option<GcPhase>>,
}

impl Collector {
    /// Create a collector with its heap and world
    ///
    /// Collection stays off until [`Collector::enable`] is called.
    ///
    /// # Arguments
    /// * `config` - validated and cached for the collector's lifetime
    /// * `trampoline` - how queued finalizers are invoked
    ///
    /// # Errors
    /// `Configuration` for an invalid config, `HeapInitialization` when the
    /// arena cannot be reserved.
    pub fn new(config: GcConfig, trampoline: Box<dyn CallTrampoline>) -> Result<Arc<Self>> {
        config.validate()?;
        let heap = Heap::new(config.arena_size)?;
        let next_gc = config.initial_trigger;
        log::debug!(
            "collector created: arena {} bytes, gc_percent {}, {} workers max",
            config.arena_size,
            config.gc_percent,
            config.worker_limit()
        );

        Ok(Arc::new_cyclic(|me| Self {
            config,
            heap,
            world: World::new(),
            pool: WorkPool::new(),
            threads: GcThreadPool::new(),
            finalizers: Finalizers::new(),
            profile: MemProfile::new(),
            trampoline,
            logger: GcLogger::default(),
            globals: RwLock::new(Vec::new()),
            roots: Mutex::new(RootSet::new()),
            cycle: Mutex::new(()),
            state: Mutex::new(GcState::Idle),
            next_gc: AtomicUsize::new(next_gc),
            history: Mutex::new(PauseHistory::new()),
            last_cycle: Mutex::new(None),
            runner: Mutex::new(None),
            enabled: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            me: me.clone(),
            #[cfg(test)]
            helper_fault: Mutex::new(None),
        }))
    }

    /// Allow collections to run
    pub fn enable(&self) {
        if !self.shut_down.load(Ordering::Acquire) {
            self.enabled.store(true, Ordering::Release);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// True once a cycle unwound through a fatal error
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn finalizers(&self) -> &Finalizers {
        &self.finalizers
    }

    pub fn profile(&self) -> &MemProfile {
        &self.profile
    }

    pub fn logger(&self) -> &GcLogger {
        &self.logger
    }

    pub(crate) fn trampoline(&self) -> &dyn CallTrampoline {
        &*self.trampoline
    }

    pub fn state(&self) -> GcState {
        *self.state.lock()
    }

    /// `heap_alloc` value that triggers the next cycle
    pub fn next_gc(&self) -> usize {
        self.next_gc.load(Ordering::Acquire)
    }

    /// Statistics of the most recent cycle
    pub fn last_cycle(&self) -> Option<CycleStats> {
        self.last_cycle.lock().clone()
    }

    fn set_state(&self, state: GcState) {
        *self.state.lock() = state;
    }

    /// Why a request must be dropped before looking at the heap, if at all
    fn skip_reason(&self) -> Option<SkipReason> {
        if !self.is_enabled() {
            return Some(SkipReason::NotEnabled);
        }
        if LockDepth::held() {
            return Some(SkipReason::LocksHeld);
        }
        if std::thread::panicking() || self.is_failing() {
            return Some(SkipReason::Failing);
        }
        if !self.config.collection_enabled() {
            return Some(SkipReason::Disabled);
        }
        None
    }

    /// Take the cycle token
    ///
    /// An attached caller waits in the `Waiting` state so a cycle already
    /// holding the token can stop the world without it.
    fn acquire_token(&self, caller: Option<&ExecutionContext>) -> MutexGuard<'_, ()> {
        if let Some(guard) = self.cycle.try_lock() {
            return guard;
        }
        match caller {
            Some(ctx) => {
                self.world.enter_blocking(ctx, ContextStatus::Waiting);
                let guard = self.cycle.lock();
                self.world.exit_blocking(ctx);
                guard
            }
            None => self.cycle.lock(),
        }
    }

    /// Run a collection cycle
    ///
    /// Dropped without error when collection is not enabled, the calling
    /// thread holds a [`LockDepth`] guard, the collector is failing, or
    /// `gc_percent` is negative. Unless `force` is set, nothing happens
    /// while the heap is below the trigger.
    ///
    /// # Arguments
    /// * `force` - collect regardless of the trigger
    ///
    /// # Returns
    /// What the request did; [`CollectOutcome::Completed`] carries the
    /// cycle's statistics.
    ///
    /// # Errors
    /// `WorkerPanicked` if a helper thread died during the cycle. The
    /// collector is failing from then on.
    pub fn collect(&self, force: bool) -> Result<CollectOutcome> {
        self.pool.check_alignment();
        if let Some(reason) = self.skip_reason() {
            log::trace!("collection skipped: {:?}", reason);
            return Ok(CollectOutcome::Skipped(reason));
        }
        if !force && self.heap.heap_alloc() < self.next_gc() {
            return Ok(CollectOutcome::BelowThreshold);
        }

        let caller = self.world.current();
        let token = self.acquire_token(caller.as_deref());
        if let Some(reason) = self.skip_reason() {
            return Ok(CollectOutcome::Skipped(reason));
        }
        if !force && self.heap.heap_alloc() < self.next_gc() {
            return Ok(CollectOutcome::BelowThreshold);
        }

        let result = {
            let _guard = FailGuard { collector: self };
            self.run_cycle(caller.as_deref(), force)
        };
        drop(token);
        let stats = result?;

        if self.finalizers.queue.has_pending() {
            std::thread::yield_now();
        }
        if self.config.trace > 1 && !force {
            self.collect(true)?;
        }
        Ok(CollectOutcome::Completed(stats))
    }

    fn run_cycle(&self, caller: Option<&ExecutionContext>, force: bool) -> Result<CycleStats> {
        let mut timer = GcTimer::new();

        self.set_state(GcState::Pausing);
        self.world.stop_the_world(caller);
        self.flush_caches();
        let before = self.heap.snapshot();
        let cycle = self.history.lock().numgc() + 1;

        self.set_state(GcState::Marking);
        let nproc = self.start_workers();
        self.logger.log(GcEvent::CycleStart {
            cycle,
            forced: force,
            nproc,
            heap_alloc: before.heap_alloc,
        });
        self.pool.reset(nproc);
        let mut roots = std::mem::take(&mut *self.roots.lock());
        {
            let contexts = self.world.contexts();
            let globals = self.globals.read();
            RootSources {
                heap: &self.heap,
                globals: &globals,
                contexts: &contexts,
                caller,
                finalizers: &self.finalizers,
                debug_mark: self.config.debug_mark,
            }
            .enumerate(&mut roots);
        }
        let nroots = roots.len();
        let job = Arc::new(CycleJob::new(nproc, roots, self.heap.spans().snapshot()));
        if nproc > 1 {
            self.threads.publish(Arc::clone(&job));
        }

        let (mark, mut backoff) = self.mark_phase(&job, 0);
        if self.config.debug_mark {
            let missed = if job.is_aborted() {
                0
            } else {
                marker::debug_mark(&self.heap, job.roots.read().as_slice())
            };
            job.finish_debug_mark(missed);
            if missed > 0 {
                self.logger
                    .log(GcEvent::DebugMarkDiscrepancy { cycle, missed });
            }
        }
        let mark_ns = timer.split();
        self.logger.log(GcEvent::PhaseEnd {
            cycle,
            phase: GcPhase::Mark,
            duration_ms: mark_ns as f64 / 1e6,
        });

        self.set_state(GcState::Sweeping);
        // Marks are incomplete after an abort; sweeping would free live blocks.
        let (sweep, sweep_backoff) = if job.is_aborted() {
            (SweepStats::default(), BackoffStats::default())
        } else {
            self.sweep_phase(&job, 0)
        };
        backoff.merge(&sweep_backoff);
        let sweep_ns = timer.split();
        self.logger.log(GcEvent::PhaseEnd {
            cycle,
            phase: GcPhase::Sweep,
            duration_ms: sweep_ns as f64 / 1e6,
        });

        job.report(&mark, &sweep, &backoff);
        let helpers = job.wait_helpers();
        self.threads.retire();
        *self.roots.lock() = job.take_roots();
        if let Err(e) = helpers {
            self.failing.store(true, Ordering::SeqCst);
            self.set_state(GcState::Idle);
            self.world.start_the_world();
            log::error!("cycle {} abandoned: {}", cycle, e);
            return Err(e);
        }

        let totals = job.totals();
        totals.sweep.fold_into(&self.heap);
        let heap_alloc = self.heap.heap_alloc();
        let growth = heap_alloc as u128 * self.config.gc_percent.max(0) as u128 / 100;
        let next_gc = heap_alloc.saturating_add(growth.min(usize::MAX as u128) as usize);
        self.next_gc.store(next_gc, Ordering::Release);

        if totals.sweep.finalizers_queued > 0 {
            self.logger.log(GcEvent::FinalizersQueued {
                cycle,
                count: totals.sweep.finalizers_queued,
            });
        }
        if self.finalizers.queue.has_pending() {
            self.set_state(GcState::Finalizing);
            self.kick_runner();
        }

        let after = self.heap.snapshot();
        let pause_ns = timer.elapsed_ns();
        self.history.lock().record(pause_ns, Utc::now());
        self.profile.cycle();

        let markfor = job.markfor.steal_stats();
        let sweepfor = job.sweepfor.steal_stats();
        let yields = {
            let mut y = totals.mark.backoff;
            y.merge(&totals.parfor);
            y
        };
        let stats = CycleStats {
            cycle,
            forced: force,
            nproc,
            roots: nroots,
            mark_ns,
            sweep_ns,
            rest_ns: pause_ns.saturating_sub(mark_ns + sweep_ns),
            pause_ns,
            heap_before: before.heap_alloc,
            heap_after: after.heap_alloc,
            objects_before: before.nmalloc.saturating_sub(before.nfree),
            objects_after: after.nmalloc.saturating_sub(after.nfree),
            nmalloc: after.nmalloc,
            nfree: after.nfree,
            freed_objects: totals.sweep.freed_objects,
            freed_bytes: totals.sweep.freed_bytes,
            spans_swept: totals.sweep.nspan,
            nhandoff: totals.mark.nhandoff,
            nhandoffcnt: totals.mark.nhandoffcnt,
            nsteal: markfor.nsteal + sweepfor.nsteal,
            nstealcnt: markfor.nstealcnt + sweepfor.nstealcnt,
            nprocyield: yields.nprocyield,
            nosyield: yields.nosyield,
            nsleep: yields.nsleep,
            finalizers_queued: totals.sweep.finalizers_queued,
            debug_missed: job.debug_missed(),
            spurious_marks: totals.sweep.spurious_marks,
            next_gc,
        };
        if self.config.trace > 0 {
            log::info!(target: crate::logging::LOG_TARGET, "{}", stats.trace_line());
        }
        self.logger.log(GcEvent::CycleEnd {
            cycle,
            pause_ms: pause_ns as f64 / 1e6,
            freed_bytes: stats.freed_bytes,
            heap_alloc,
            next_gc,
        });
        *self.last_cycle.lock() = Some(stats.clone());

        self.set_state(GcState::Idle);
        self.world.start_the_world();
        Ok(stats)
    }

    /// Return every context's cached free objects to the heap
    fn flush_caches(&self) {
        for ctx in self.world.contexts() {
            self.heap.release_cache(&mut ctx.cache.lock());
        }
        self.heap.release_internal_cache();
    }

    /// Workers for this cycle, starting helpers as needed
    fn start_workers(&self) -> usize {
        let want = self.config.worker_limit();
        if want <= 1 {
            return 1;
        }
        match self.me.upgrade() {
            Some(me) => 1 + self.threads.ensure(want - 1, &me).min(want - 1),
            None => 1,
        }
    }

    fn kick_runner(&self) {
        if !self.config.finalizers || !self.is_enabled() {
            return;
        }
        let mut runner = self.runner.lock();
        if let Some(runner) = runner.as_ref() {
            runner.wake();
            return;
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        match FinalizerRunner::spawn(me) {
            Ok(started) => *runner = Some(started),
            Err(e) => log::warn!("finalizers stay queued: {}", e),
        }
    }

    fn mark_phase(&self, job: &CycleJob, tid: usize) -> (MarkStats, BackoffStats) {
        let mut worker = MarkWorker::new(&self.heap, &self.pool, job.nproc, self.config.handoff_min);
        let mut backoff = BackoffStats::default();
        {
            let roots = job.roots.read();
            let roots = roots.as_slice();
            job.markfor
                .run(tid, |i| worker.mark_root(&roots[i]), &mut backoff);
        }
        #[cfg(test)]
        self.inject_helper_fault(tid, GcPhase::Mark);
        worker.drain();
        (worker.stats(), backoff)
    }

    fn sweep_phase(&self, job: &CycleJob, tid: usize) -> (SweepStats, BackoffStats) {
        let mut sweeper = Sweeper::new(&self.heap, self, self.config.debug_mark);
        let mut backoff = BackoffStats::default();
        #[cfg(test)]
        self.inject_helper_fault(tid, GcPhase::Sweep);
        job.sweepfor
            .run(tid, |i| sweeper.sweep_span(&job.spans[i]), &mut backoff);
        (sweeper.into_stats(), backoff)
    }

    /// Body of helper `tid` for one cycle
    pub(crate) fn gc_helper(&self, job: &CycleJob, tid: usize) {
        let _done = job.helper_guard(&self.pool);
        let (mark, mut backoff) = self.mark_phase(job, tid);
        if self.config.debug_mark {
            job.wait_debug_mark();
        }
        let (sweep, sweep_backoff) = self.sweep_phase(job, tid);
        backoff.merge(&sweep_backoff);
        job.report(&mark, &sweep, &backoff);
    }

    #[cfg(test)]
    fn inject_helper_fault(&self, tid: usize, phase: GcPhase) {
        if tid != 0 && *self.helper_fault.lock() == Some(phase) {
            panic!("helper {} failed during {:?}", tid, phase);
        }
    }

    /// Consistent statistics snapshot
    ///
    /// Stops the world briefly, so it waits for any cycle in progress.
    pub fn read_stats(&self) -> MemStats {
        let caller = self.world.current();
        let token = self.acquire_token(caller.as_deref());
        self.world.stop_the_world(caller.as_deref());
        self.flush_caches();
        let snap = self.heap.snapshot();
        let mut stats = MemStats {
            heap_alloc: snap.heap_alloc,
            heap_sys: snap.heap_sys,
            heap_inuse: snap.heap_inuse,
            heap_released: snap.heap_released,
            heap_objects: snap.nmalloc.saturating_sub(snap.nfree),
            nmalloc: snap.nmalloc,
            nfree: snap.nfree,
            next_gc: self.next_gc(),
            enable_gc: self.is_enabled() && self.config.collection_enabled(),
            by_size: snap
                .by_size
                .iter()
                .map(|&(size, nmalloc, nfree)| SizeClassStats {
                    size,
                    nmalloc,
                    nfree,
                })
                .collect(),
            ..Default::default()
        };
        self.history.lock().fill(&mut stats);
        self.world.start_the_world();
        drop(token);
        stats
    }

    /// Write a heap dump (see [`Heap::dump`]) with the world stopped
    pub fn dump_heap<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        let caller = self.world.current();
        let token = self.acquire_token(caller.as_deref());
        self.world.stop_the_world(caller.as_deref());
        self.flush_caches();
        let result = self.heap.dump(out);
        self.world.start_the_world();
        drop(token);
        result
    }

    /// Give idle span memory back to the OS
    ///
    /// Returns the bytes released.
    pub fn scavenge(&self, idle_for: Duration) -> usize {
        let released = self.heap.scavenge(idle_for);
        if released > 0 {
            self.logger.log(GcEvent::Scavenge {
                released_bytes: released,
            });
        }
        released
    }

    // ------------------------------------------------------------------
    // Bitmap operations for allocator-adjacent code
    // ------------------------------------------------------------------

    /// Record a freshly allocated block
    pub fn mark_allocated(&self, v: usize, size: usize, no_pointers: bool) {
        self.heap.bitmap().mark_allocated(v, size, no_pointers, false);
    }

    /// Record a block returned outside the sweeper
    pub fn mark_freed(&self, v: usize, size: usize) {
        self.heap.bitmap().mark_freed(v, size, false);
    }

    /// Give a newly carved span `n` free blocks of `size` bytes
    pub fn mark_span(&self, v: usize, size: usize, n: usize, leftover: bool) {
        self.heap.bitmap().mark_span(v, size, n, leftover);
    }

    /// Clear the bits of a span being returned
    pub fn unmark_span(&self, v: usize, len: usize) {
        self.heap.bitmap().unmark_span(v, len);
    }

    /// Whether the block at `v` needs finalizer or profiling attention
    ///
    /// Always true while the mark verification pass owns the bit.
    pub fn is_special(&self, v: usize) -> bool {
        self.config.debug_mark || self.heap.bitmap().is_special(v)
    }

    pub fn set_special(&self, v: usize) {
        if !self.config.debug_mark {
            self.heap.bitmap().set_special(v, true);
        }
    }

    // ------------------------------------------------------------------
    // Finalizers, profiling, global roots
    // ------------------------------------------------------------------

    /// Base and size of the allocated block starting exactly at `obj`
    fn object_at(&self, obj: usize) -> Result<(usize, usize)> {
        match self.heap.lookup_object(obj) {
            Some((base, size)) if base == obj => Ok((base, size)),
            _ => Err(GcError::InvalidPointer { address: obj }),
        }
    }

    /// Run `func(obj)` once `obj` becomes unreachable
    ///
    /// `nret` reserves return space in the call frame. The object and
    /// everything it references stay allocated until the call has run.
    ///
    /// # Errors
    /// `InvalidPointer` unless `obj` is the start of an allocated block;
    /// `FinalizerAlreadySet` when it already has one.
    pub fn set_finalizer(&self, obj: usize, func: FinalizerFn, nret: usize) -> Result<()> {
        self.object_at(obj)?;
        self.finalizers.table.add(obj, FinalizerEntry { func, nret })?;
        self.set_special(obj);
        Ok(())
    }

    /// Cancel the finalizer of `obj`; false when none was registered
    pub fn remove_finalizer(&self, obj: usize) -> bool {
        if !self.finalizers.table.remove(obj) {
            return false;
        }
        if !self.config.debug_mark && !self.profile.contains(obj) {
            self.heap.bitmap().set_special(obj, false);
        }
        true
    }

    /// Track `obj` in the memory profile until it dies
    ///
    /// # Errors
    /// `InvalidPointer` unless `obj` is the start of an allocated block.
    pub fn profile_object(&self, obj: usize) -> Result<()> {
        let (base, size) = self.object_at(obj)?;
        if self.profile.record_alloc(base, size) {
            self.set_special(base);
        }
        Ok(())
    }

    /// Scan `[ptr, ptr + len)` as a root every cycle
    ///
    /// # Safety
    /// The region must stay readable until it is unregistered or the
    /// collector is dropped.
    pub unsafe fn register_global(&self, ptr: usize, len: usize) {
        self.globals.write().push(Root { ptr, len });
    }

    /// Stop scanning the region registered at `ptr`
    pub fn unregister_global(&self, ptr: usize) -> bool {
        let mut globals = self.globals.write();
        let before = globals.len();
        globals.retain(|g| g.ptr != ptr);
        globals.len() != before
    }

    /// Stop the finalizer runner and the helper threads
    ///
    /// Collections requested afterwards are dropped. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.enabled.store(false, Ordering::Release);

        // Wait out a cycle in progress; later ones see the flag.
        let caller = self.world.current();
        drop(self.acquire_token(caller.as_deref()));

        let runner = self.runner.lock().take();
        if let Some(mut runner) = runner {
            match caller.as_deref() {
                Some(ctx) => self.world.blocking(ctx, || runner.shutdown()),
                None => runner.shutdown(),
            }
        }
        self.threads.shutdown();
        log::debug!("collector shut down");
    }
}

impl SpecialHandler for Collector {
    fn handle_special(&self, obj: usize, size: usize) -> bool {
        self.finalizers.handle_special(
            obj,
            size,
            self.heap.bitmap(),
            &self.profile,
            self.config.debug_mark,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::finalizer::DirectCall;
    use crate::runtime::world::ContextRole;
    use crate::util::WORD;

    fn collector(config: GcConfig) -> Arc<Collector> {
        let c = Collector::new(config, Box::new(DirectCall)).unwrap();
        c.enable();
        c
    }

    #[test]
    fn test_not_enabled_until_enable() {
        let c = Collector::new(GcConfig::for_testing(), Box::new(DirectCall)).unwrap();
        assert!(matches!(
            c.collect(true).unwrap(),
            CollectOutcome::Skipped(SkipReason::NotEnabled)
        ));
        c.enable();
        assert!(c.collect(true).unwrap().is_completed());
        c.shutdown();
    }

    #[test]
    fn test_lock_depth_drops_request() {
        let c = collector(GcConfig::for_testing());
        {
            let _lock = LockDepth::acquire();
            assert!(matches!(
                c.collect(true).unwrap(),
                CollectOutcome::Skipped(SkipReason::LocksHeld)
            ));
        }
        assert!(!LockDepth::held());
        assert!(c.collect(true).unwrap().is_completed());
        c.shutdown();
    }

    #[test]
    fn test_negative_percent_disables_collection() {
        let c = collector(GcConfig {
            gc_percent: -1,
            ..GcConfig::for_testing()
        });
        assert!(matches!(
            c.collect(true).unwrap(),
            CollectOutcome::Skipped(SkipReason::Disabled)
        ));
        assert!(!c.read_stats().enable_gc);
        c.shutdown();
    }

    #[test]
    fn test_unforced_request_below_trigger_is_noop() {
        let c = collector(GcConfig::for_testing());
        assert!(matches!(
            c.collect(false).unwrap(),
            CollectOutcome::BelowThreshold
        ));
        assert_eq!(c.read_stats().numgc, 0);
        c.shutdown();
    }

    #[test]
    fn test_global_root_keeps_object_alive() {
        // Arrange
        let c = collector(GcConfig::for_testing());
        let ctx = c.world().attach(ContextRole::Mutator);
        let (kept, lost) = {
            let mut cache = ctx.cache.lock();
            let kept = c.heap().alloc(&mut cache, 64, false).unwrap();
            let lost = c.heap().alloc(&mut cache, 64, false).unwrap();
            (kept, lost)
        };
        let global = Box::new([kept]);
        unsafe { c.register_global(global.as_ptr() as usize, WORD) };

        // Act
        let outcome = c.collect(true).unwrap();

        // Assert
        let stats = outcome.cycle_stats().unwrap();
        assert_eq!(stats.freed_objects, 1);
        assert!(c.heap().is_allocated(kept));
        assert!(!c.heap().is_allocated(lost));
        assert_eq!(c.state(), GcState::Idle);

        assert!(c.unregister_global(global.as_ptr() as usize));
        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        c.shutdown();
    }

    #[test]
    fn test_set_finalizer_requires_block_start() {
        let c = collector(GcConfig::for_testing());
        let ctx = c.world().attach(ContextRole::Mutator);
        let obj = c.heap().alloc(&mut ctx.cache.lock(), 32, false).unwrap();

        assert!(matches!(
            c.set_finalizer(obj + 8, |_| {}, 0),
            Err(GcError::InvalidPointer { .. })
        ));
        c.set_finalizer(obj, |_| {}, 0).unwrap();
        assert!(c.is_special(obj));
        assert!(matches!(
            c.set_finalizer(obj, |_| {}, 0),
            Err(GcError::FinalizerAlreadySet { .. })
        ));
        assert!(c.remove_finalizer(obj));
        assert!(!c.is_special(obj));

        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        c.shutdown();
    }

    #[test]
    fn test_profiled_object_keeps_special_after_finalizer_removed() {
        let c = collector(GcConfig::for_testing());
        let ctx = c.world().attach(ContextRole::Mutator);
        let obj = c.heap().alloc(&mut ctx.cache.lock(), 32, false).unwrap();

        c.profile_object(obj).unwrap();
        c.set_finalizer(obj, |_| {}, 0).unwrap();
        c.remove_finalizer(obj);
        assert!(c.is_special(obj));

        // Unreachable: the profile records the free.
        c.collect(true).unwrap();
        assert!(!c.profile().contains(obj));
        assert_eq!(c.profile().snapshot().frees, 1);

        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        c.shutdown();
    }

    #[test]
    fn test_debug_mode_special_is_always_true() {
        let c = collector(GcConfig {
            debug_mark: true,
            ..GcConfig::for_testing()
        });
        let ctx = c.world().attach(ContextRole::Mutator);
        let obj = c.heap().alloc(&mut ctx.cache.lock(), 32, false).unwrap();
        assert!(c.is_special(obj));
        c.set_special(obj);
        assert!(!c.heap().bitmap().is_special(obj));

        let stats = c.collect(true).unwrap().cycle_stats().cloned().unwrap();
        assert_eq!(stats.debug_missed, 0);
        assert_eq!(stats.spurious_marks, 0);

        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        c.shutdown();
    }

    /// Run a forced cycle in which helper 1 panics during `phase`
    ///
    /// Returns the result together with a block nothing references, or
    /// `None` on a single-CPU host where the cycle has no helpers.
    fn cycle_with_helper_panic(
        phase: GcPhase,
    ) -> Option<(Arc<Collector>, Result<CollectOutcome>, usize)> {
        if num_cpus::get() < 2 {
            return None;
        }
        let c = collector(GcConfig {
            gc_threads: Some(2),
            ..GcConfig::for_testing()
        });
        let ctx = c.world().attach(ContextRole::Mutator);
        let lost = {
            let mut cache = ctx.cache.lock();
            for _ in 0..1000 {
                c.heap().alloc(&mut cache, 64, false).unwrap();
            }
            c.heap().alloc(&mut cache, 64, false).unwrap()
        };
        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        *c.helper_fault.lock() = Some(phase);

        let (tx, rx) = std::sync::mpsc::channel();
        let initiator = Arc::clone(&c);
        std::thread::spawn(move || {
            let _ = tx.send(initiator.collect(true));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("initiator still waiting for a dead helper");
        Some((c, result, lost))
    }

    #[test]
    fn test_helper_panic_during_mark_abandons_cycle() {
        let (c, result, lost) = match cycle_with_helper_panic(GcPhase::Mark) {
            Some(run) => run,
            None => return,
        };

        assert!(matches!(result, Err(GcError::WorkerPanicked(_))));
        assert!(c.is_failing());
        assert!(!c.world().is_stopped());
        assert_eq!(c.state(), GcState::Idle);
        // Marking never finished, so nothing was swept.
        assert!(c.heap().is_allocated(lost));
        assert_eq!(c.read_stats().numgc, 0);
        assert!(matches!(
            c.collect(true).unwrap(),
            CollectOutcome::Skipped(SkipReason::Failing)
        ));
        c.shutdown();
    }

    #[test]
    fn test_helper_panic_during_sweep_abandons_cycle() {
        let (c, result, _) = match cycle_with_helper_panic(GcPhase::Sweep) {
            Some(run) => run,
            None => return,
        };

        assert!(matches!(result, Err(GcError::WorkerPanicked(_))));
        assert!(c.is_failing());
        assert!(!c.world().is_stopped());
        assert_eq!(c.state(), GcState::Idle);
        assert!(matches!(
            c.collect(false).unwrap(),
            CollectOutcome::Skipped(SkipReason::Failing)
        ));
        c.shutdown();
    }

    #[test]
    fn test_dump_heap_reflects_last_cycle() {
        let c = collector(GcConfig::for_testing());
        let ctx = c.world().attach(ContextRole::Mutator);
        let (kept, lost) = {
            let mut cache = ctx.cache.lock();
            let kept = c.heap().alloc(&mut cache, 64, false).unwrap();
            let lost = c.heap().alloc(&mut cache, 64, false).unwrap();
            (kept, lost)
        };
        let global = Box::new([kept]);
        unsafe { c.register_global(global.as_ptr() as usize, WORD) };
        c.collect(true).unwrap();

        let mut out = Vec::new();
        c.dump_heap(&mut out).unwrap();
        let dump = String::from_utf8(out).unwrap();

        assert!(dump.contains(&format!("\n  {:#x} 64\n", kept)));
        assert!(!dump.contains(&format!("  {:#x} 64", lost)));
        // Marks never outlive the sweep.
        assert!(!dump.contains(" marked"));
        assert!(!c.world().is_stopped());

        assert!(c.unregister_global(global.as_ptr() as usize));
        c.world().detach(&ctx, || c.heap().release_cache(&mut ctx.cache.lock()));
        c.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_disables() {
        let c = collector(GcConfig::for_testing());
        c.collect(true).unwrap();
        c.shutdown();
        c.shutdown();
        assert!(matches!(
            c.collect(true).unwrap(),
            CollectOutcome::Skipped(SkipReason::NotEnabled)
        ));
        c.enable();
        assert!(!c.is_enabled());
    }
}
