//! Finalizer - Deferred Cleanup of Unreachable Objects
//!
//! Registration puts an entry in the [`FinalizerTable`] and sets the
//! object's Special bit. When the sweeper finds such an object unmarked it
//! calls [`Finalizers::handle_special`], which moves the entry into a
//! [`FinalizerRecord`] on the pending queue and keeps the object allocated.
//! The records are roots for the next cycle, so the object (and everything
//! it references) stays alive until its finalizer has run.
//!
//! ```text
//!  set_finalizer ──> table ──sweep──> pending blocks ──runner──> free blocks
//!                                          │                         │
//!                                          └── roots while queued ───┘
//! ```
//!
//! The runner is an ordinary mutator context: it parks in the `Waiting`
//! state when nothing is pending and stops at safepoints between calls.

use super::world::{ContextRole, ContextStatus, ExecutionContext};
use crate::error::{GcError, Result};
use crate::gc::Collector;
use crate::heap::PAGE_SIZE;
use crate::marker::bitmap::BitmapIndex;
use crate::runtime::profile::MemProfile;
use crate::util::WORD;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Finalizer entry point; receives the object address
pub type FinalizerFn = fn(usize);

/// Registered finalizer of one object
#[derive(Debug, Clone, Copy)]
pub struct FinalizerEntry {
    pub func: FinalizerFn,
    /// Bytes of return space the call frame reserves after the argument
    pub nret: usize,
}

/// Object address → finalizer
#[derive(Default)]
pub struct FinalizerTable {
    entries: Mutex<IndexMap<usize, FinalizerEntry>>,
}

impl FinalizerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` for `obj`
    ///
    /// # Errors
    /// `FinalizerAlreadySet` when `obj` already has one.
    pub fn add(&self, obj: usize, entry: FinalizerEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&obj) {
            return Err(GcError::FinalizerAlreadySet { address: obj });
        }
        entries.insert(obj, entry);
        Ok(())
    }

    /// Drop the registration of `obj`; false when there was none
    pub fn remove(&self, obj: usize) -> bool {
        self.entries.lock().shift_remove(&obj).is_some()
    }

    /// Remove and return the registration of `obj`
    pub fn take(&self, obj: usize) -> Option<FinalizerEntry> {
        self.entries.lock().shift_remove(&obj)
    }

    pub fn contains(&self, obj: usize) -> bool {
        self.entries.lock().contains_key(&obj)
    }

    /// Registered objects, in registration order
    pub fn objects(&self) -> Vec<usize> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One queued finalizer call
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizerRecord {
    pub func: Option<FinalizerFn>,
    pub arg: usize,
    pub nret: usize,
}

/// Records per block: one page worth
pub const RECORDS_PER_BLOCK: usize = PAGE_SIZE / std::mem::size_of::<FinalizerRecord>();

struct FinBlock {
    records: Box<[FinalizerRecord]>,
    cnt: usize,
}

impl FinBlock {
    fn new() -> Self {
        Self {
            records: vec![FinalizerRecord::default(); RECORDS_PER_BLOCK].into_boxed_slice(),
            cnt: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Every block ever allocated; indices are stable
    all: Vec<FinBlock>,
    /// Blocks waiting for the runner; the last one receives new records
    pending: Vec<usize>,
    free: Vec<usize>,
    queued: u64,
}

/// Pending finalizer calls, grouped in page-sized blocks
#[derive(Default)]
pub struct FinalizerQueue {
    state: Mutex<QueueState>,
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call, opening a new block when the current one is full
    pub fn push(&self, record: FinalizerRecord) {
        let mut state = self.state.lock();
        let current = state
            .pending
            .last()
            .copied()
            .filter(|&b| state.all[b].cnt < RECORDS_PER_BLOCK);
        let head = match current {
            Some(b) => b,
            None => {
                let b = match state.free.pop() {
                    Some(b) => b,
                    None => {
                        state.all.push(FinBlock::new());
                        state.all.len() - 1
                    }
                };
                state.pending.push(b);
                b
            }
        };
        let block = &mut state.all[head];
        block.records[block.cnt] = record;
        block.cnt += 1;
        state.queued += 1;
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Calls waiting to run
    pub fn pending_len(&self) -> usize {
        let state = self.state.lock();
        state.pending.iter().map(|&b| state.all[b].cnt).sum()
    }

    /// Calls ever queued
    pub fn queued_total(&self) -> u64 {
        self.state.lock().queued
    }

    /// Blocks allocated so far
    pub fn blocks(&self) -> usize {
        self.state.lock().all.len()
    }

    /// Detach the pending list, oldest block first
    fn take_pending(&self) -> Vec<usize> {
        std::mem::take(&mut self.state.lock().pending)
    }

    fn record(&self, block: usize, i: usize) -> Option<FinalizerRecord> {
        let state = self.state.lock();
        let b = &state.all[block];
        if i < b.cnt {
            Some(b.records[i])
        } else {
            None
        }
    }

    fn clear_record(&self, block: usize, i: usize) {
        self.state.lock().all[block].records[i] = FinalizerRecord::default();
    }

    fn recycle(&self, block: usize) {
        let mut state = self.state.lock();
        state.all[block].cnt = 0;
        state.free.push(block);
    }

    /// `(address, length)` of the used records of every non-empty block
    pub fn block_roots(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        state
            .all
            .iter()
            .filter(|b| b.cnt > 0)
            .map(|b| {
                (
                    b.records.as_ptr() as usize,
                    b.cnt * std::mem::size_of::<FinalizerRecord>(),
                )
            })
            .collect()
    }
}

/// Table plus queue
#[derive(Default)]
pub struct Finalizers {
    pub table: FinalizerTable,
    pub queue: FinalizerQueue,
}

impl Finalizers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an unreachable Special block to the finalizer machinery
    ///
    /// Returns true when a finalizer was queued and the block must stay
    /// allocated this cycle. Otherwise the Special bit is dropped, any
    /// profiling record is closed and the sweeper may reclaim the block.
    pub fn handle_special(
        &self,
        obj: usize,
        size: usize,
        bitmap: &BitmapIndex,
        profile: &MemProfile,
        debug_mark: bool,
    ) -> bool {
        match self.table.take(obj) {
            Some(entry) => {
                self.queue.push(FinalizerRecord {
                    func: Some(entry.func),
                    arg: obj,
                    nret: entry.nret,
                });
                true
            }
            None => {
                if !debug_mark {
                    bitmap.set_special(obj, false);
                }
                profile.record_free(obj, size);
                false
            }
        }
    }
}

/// Invokes a finalizer with a packed argument frame
///
/// The frame holds the argument word followed by `nret` bytes of return
/// space.
pub trait CallTrampoline: Send + Sync {
    fn call(&self, func: FinalizerFn, frame: &mut [u8]);
}

/// Calls the function directly with the argument word
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectCall;

impl CallTrampoline for DirectCall {
    fn call(&self, func: FinalizerFn, frame: &mut [u8]) {
        let mut arg = [0u8; WORD];
        arg.copy_from_slice(&frame[..WORD]);
        func(usize::from_ne_bytes(arg));
    }
}

/// Run every pending call on the calling context
///
/// Returns the number of finalizers run.
pub(crate) fn drain_pending(
    collector: &Collector,
    ctx: &ExecutionContext,
    frame: &mut Vec<u8>,
) -> usize {
    let queue = &collector.finalizers().queue;
    let world = collector.world();
    let mut ran = 0;
    for block in queue.take_pending() {
        let mut i = 0;
        while let Some(record) = queue.record(block, i) {
            world.poll(ctx);
            if let Some(func) = record.func {
                let framesz = WORD + record.nret;
                if frame.len() < framesz {
                    frame.resize(framesz * 2, 0);
                }
                frame[..WORD].copy_from_slice(&record.arg.to_ne_bytes());
                frame[WORD..framesz].fill(0);
                collector.trampoline().call(func, &mut frame[..framesz]);
                ran += 1;
            }
            queue.clear_record(block, i);
            i += 1;
        }
        queue.recycle(block);
    }
    ran
}

#[derive(Default)]
struct SignalState {
    wake: bool,
    shutdown: bool,
}

#[derive(Default)]
struct RunnerSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl RunnerSignal {
    /// Block until woken; true on shutdown
    fn park(&self) -> bool {
        let mut state = self.state.lock();
        while !state.wake && !state.shutdown {
            self.cond.wait(&mut state);
        }
        state.wake = false;
        state.shutdown
    }
}

/// Dedicated thread running queued finalizers
pub struct FinalizerRunner {
    signal: Arc<RunnerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl FinalizerRunner {
    /// Start the runner thread
    pub(crate) fn spawn(collector: Arc<Collector>) -> Result<Self> {
        let signal = Arc::new(RunnerSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("mgc-finalizer".to_string())
            .spawn(move || run(collector, thread_signal))
            .map_err(|e| GcError::HeapInitialization(format!("finalizer thread: {}", e)))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Wake the runner if it is parked
    pub fn wake(&self) {
        self.signal.state.lock().wake = true;
        self.signal.cond.notify_one();
    }

    /// Stop the runner and wait for it to exit
    pub fn shutdown(&mut self) {
        self.signal.state.lock().shutdown = true;
        self.signal.cond.notify_one();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("finalizer runner panicked");
            }
        }
    }
}

impl Drop for FinalizerRunner {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn run(collector: Arc<Collector>, signal: Arc<RunnerSignal>) {
    let world = collector.world();
    let ctx = world.attach(ContextRole::Mutator);
    let mut frame = Vec::new();
    log::debug!("finalizer runner started");

    loop {
        world.poll(&ctx);
        let ran = drain_pending(&collector, &ctx, &mut frame);
        if ran > 0 {
            log::debug!("ran {} finalizers", ran);
            if let Err(e) = collector.collect(true) {
                log::warn!("collection after finalizers failed: {}", e);
            }
            continue;
        }

        world.enter_blocking(&ctx, ContextStatus::Waiting);
        let shutdown = signal.park();
        world.exit_blocking(&ctx);
        if shutdown {
            break;
        }
    }

    world.detach(&ctx, || collector.heap().release_cache(&mut ctx.cache.lock()));
    log::debug!("finalizer runner stopped");
}
