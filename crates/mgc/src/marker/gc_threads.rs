//! GC Threads - Persistent Collector Helpers
//!
//! Helpers are started lazily, one per extra worker a cycle wants, and
//! live until the collector shuts down. Each registers as a `GcHelper`
//! context: the pause protocol never waits for it and the root enumerator
//! skips it.
//!
//! Per cycle the initiator publishes a [`CycleJob`]. Helper `i` (ids start
//! at 1; the initiator is worker 0) joins if `i < job.nproc`:
//!
//! ```text
//!  initiator: mark roots ─ drain ─ [debug mark] ─ sweep ──────── wait alldone
//!  helper i:  mark roots ─ drain ─ [wait debug] ─ sweep ─ ndone += 1
//! ```
//!
//! The last helper to finish wakes the initiator. A helper that unwinds
//! aborts the job: the work pool and both partitions release whoever waits
//! on them, the initiator skips the sweep if marking was cut short, and the
//! cycle ends in `WorkerPanicked`.

use crate::error::{GcError, Result};
use crate::gc::Collector;
use crate::heap::Span;
use crate::marker::parfor::ParFor;
use crate::marker::roots::RootSet;
use crate::marker::workbuf::WorkPool;
use crate::marker::MarkStats;
use crate::runtime::world::ContextRole;
use crate::sweep::SweepStats;
use crate::util::BackoffStats;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Counters gathered from every worker of a cycle
#[derive(Debug, Default, Clone)]
pub struct JobTotals {
    pub mark: MarkStats,
    pub sweep: SweepStats,
    /// Backoff spent inside the parallel partitions
    pub parfor: BackoffStats,
}

/// Work of one collection cycle, shared by the initiator and helpers
pub struct CycleJob {
    pub nproc: usize,
    pub roots: RwLock<RootSet>,
    pub markfor: ParFor,
    pub sweepfor: ParFor,
    pub spans: Vec<Arc<Span>>,
    debug_mark_done: AtomicBool,
    debug_missed: AtomicU64,
    ndone: AtomicUsize,
    alldone: Mutex<bool>,
    alldone_cond: Condvar,
    panicked: AtomicBool,
    totals: Mutex<JobTotals>,
}

impl CycleJob {
    pub fn new(nproc: usize, roots: RootSet, spans: Vec<Arc<Span>>) -> Self {
        Self {
            nproc,
            markfor: ParFor::new(nproc, roots.len(), false),
            sweepfor: ParFor::new(nproc, spans.len(), true),
            roots: RwLock::new(roots),
            spans,
            debug_mark_done: AtomicBool::new(false),
            debug_missed: AtomicU64::new(0),
            ndone: AtomicUsize::new(0),
            alldone: Mutex::new(nproc <= 1),
            alldone_cond: Condvar::new(),
            panicked: AtomicBool::new(false),
            totals: Mutex::new(JobTotals::default()),
        }
    }

    /// Called by the initiator once the verification pass is over
    pub fn finish_debug_mark(&self, missed: u64) {
        self.debug_missed.store(missed, Ordering::Relaxed);
        self.debug_mark_done.store(true, Ordering::Release);
    }

    /// Helpers must not sweep while the verification pass still reads bits
    pub fn wait_debug_mark(&self) {
        while !self.debug_mark_done.load(Ordering::Acquire) && !self.is_aborted() {
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    pub fn debug_missed(&self) -> u64 {
        self.debug_missed.load(Ordering::Relaxed)
    }

    /// Fold one worker's counters into the job totals
    pub fn report(&self, mark: &MarkStats, sweep: &SweepStats, parfor: &BackoffStats) {
        let mut totals = self.totals.lock();
        totals.mark.merge(mark);
        totals.sweep.merge(sweep);
        totals.parfor.merge(parfor);
    }

    pub fn totals(&self) -> JobTotals {
        self.totals.lock().clone()
    }

    /// Guard a helper holds while working; dropping it (even by unwinding)
    /// counts the helper as done
    pub fn helper_guard<'a>(&'a self, pool: &'a WorkPool) -> HelperGuard<'a> {
        HelperGuard { job: self, pool }
    }

    /// Abandon the cycle and release every worker still waiting in it
    pub fn abort(&self, pool: &WorkPool) {
        self.panicked.store(true, Ordering::Release);
        pool.abort();
        self.markfor.abort();
        self.sweepfor.abort();
    }

    /// True once a helper unwound; marks may be incomplete
    pub fn is_aborted(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    fn helper_done(&self) {
        if self.ndone.fetch_add(1, Ordering::AcqRel) + 1 == self.nproc - 1 {
            *self.alldone.lock() = true;
            self.alldone_cond.notify_all();
        }
    }

    /// Block until every helper has finished
    ///
    /// # Errors
    /// `WorkerPanicked` if a helper unwound out of the cycle.
    pub fn wait_helpers(&self) -> Result<()> {
        let mut done = self.alldone.lock();
        while !*done {
            self.alldone_cond.wait(&mut done);
        }
        drop(done);
        if self.is_aborted() {
            return Err(GcError::WorkerPanicked(
                "collector helper unwound during a cycle".to_string(),
            ));
        }
        Ok(())
    }

    /// Hand the root set back for reuse
    pub fn take_roots(&self) -> RootSet {
        std::mem::take(&mut *self.roots.write())
    }
}

/// See [`CycleJob::helper_guard`]
pub struct HelperGuard<'a> {
    job: &'a CycleJob,
    pool: &'a WorkPool,
}

impl Drop for HelperGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!("collector helper unwound; abandoning the cycle");
            self.job.abort(self.pool);
        }
        self.job.helper_done();
    }
}

struct PoolState {
    generation: u64,
    job: Option<Arc<CycleJob>>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Persistent helper threads
pub struct GcThreadPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GcThreadPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    generation: 0,
                    job: None,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Helper threads started so far
    pub fn helpers(&self) -> usize {
        self.handles.lock().len()
    }

    /// Start helpers until `n` exist; returns how many are available
    pub(crate) fn ensure(&self, n: usize, collector: &Arc<Collector>) -> usize {
        let mut handles = self.handles.lock();
        while handles.len() < n {
            let id = handles.len() + 1;
            let generation = self.shared.state.lock().generation;
            let shared = Arc::clone(&self.shared);
            let collector = Arc::clone(collector);
            let spawned = std::thread::Builder::new()
                .name(format!("mgc-worker-{}", id))
                .spawn(move || helper_loop(shared, collector, id, generation));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    log::warn!("could not start collector helper {}: {}", id, e);
                    break;
                }
            }
        }
        handles.len()
    }

    /// Wake the helpers for `job`
    pub(crate) fn publish(&self, job: Arc<CycleJob>) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.job = Some(job);
        self.shared.cond.notify_all();
    }

    /// Forget the finished job
    pub(crate) fn retire(&self) {
        self.shared.state.lock().job = None;
    }

    /// Stop and join every helper
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("collector helper panicked");
            }
        }
    }
}

impl Default for GcThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

fn helper_loop(shared: Arc<PoolShared>, collector: Arc<Collector>, id: usize, mut seen: u64) {
    let world = collector.world();
    let ctx = world.attach(ContextRole::GcHelper);
    log::trace!("collector helper {} started", id);

    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    break None;
                }
                if state.generation != seen {
                    seen = state.generation;
                    if let Some(job) = state.job.clone() {
                        break Some(job);
                    }
                }
                shared.cond.wait(&mut state);
            }
        };
        let job = match job {
            Some(job) => job,
            None => break,
        };
        if id < job.nproc {
            collector.gc_helper(&job, id);
        }
    }

    world.detach(&ctx, || {});
    log::trace!("collector helper {} stopped", id);
}
