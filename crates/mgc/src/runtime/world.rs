//! World - Execution Contexts and the Pause Protocol
//!
//! Every thread that touches the collected heap registers an
//! [`ExecutionContext`]. A collector stops the world before marking and
//! restarts it after sweeping:
//!
//! ```text
//!            stop_the_world               poll()
//!  Running ─────────────────> PauseRequested ─────> Paused
//!     ^                                               │
//!     └──────────────── start_the_world ──────────────┘
//!
//!  Running ──blocking()──> Syscall / Waiting ──return──> Running
//!                          (counts as stopped;      (waits while the
//!                           stack is frozen)         world is stopped)
//! ```
//!
//! All transitions happen under one scheduler lock; `poll` only reads the
//! context's status on its fast path. Collector helper threads register
//! with [`ContextRole::GcHelper`] and are never asked to pause.
//!
//! Each context owns a [`ManagedStack`]: a chain of fixed-size segments
//! that holds the context's root slots. The collector scans the live part
//! of every segment conservatively.

use crate::heap::LocalCache;
use crate::util::WORD;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Words per managed stack segment
pub const STACK_SEGMENT_WORDS: usize = 512;

/// How far below its segment's guard a stack pointer may legally sit
pub const STACK_GUARD: usize = 256;

static NEXT_WORLD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Contexts attached by this thread, keyed by world id
    static CURRENT: RefCell<Vec<(u64, Arc<ExecutionContext>)>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextStatus {
    Running = 0,
    PauseRequested = 1,
    Paused = 2,
    /// Inside a blocking region; the stack is frozen at the snapshot
    Syscall = 3,
    /// Parked waiting for work
    Waiting = 4,
    Dead = 5,
}

impl ContextStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContextStatus::Running,
            1 => ContextStatus::PauseRequested,
            2 => ContextStatus::Paused,
            3 => ContextStatus::Syscall,
            4 => ContextStatus::Waiting,
            _ => ContextStatus::Dead,
        }
    }

    /// Still able to mutate the heap
    pub fn is_running(self) -> bool {
        matches!(self, ContextStatus::Running | ContextStatus::PauseRequested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Mutator,
    /// Collector helper: holds no roots and never pauses
    GcHelper,
}

/// One segment of a managed stack. Grows downward from `base` to `guard`.
pub struct StackSegment {
    mem: Box<[usize]>,
    sp: usize,
}

impl StackSegment {
    fn new(words: usize) -> Self {
        let mem = vec![0usize; words].into_boxed_slice();
        let base = mem.as_ptr() as usize + words * WORD;
        Self { mem, sp: base }
    }

    /// Lowest usable address
    #[inline]
    pub fn guard(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    /// One past the highest slot
    #[inline]
    pub fn base(&self) -> usize {
        self.guard() + self.mem.len() * WORD
    }

    /// Address of the most recently pushed slot
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    #[inline]
    fn slot_index(&self, addr: usize) -> usize {
        (addr - self.guard()) / WORD
    }

    #[cfg(test)]
    pub(crate) fn set_sp_for_test(&mut self, sp: usize) {
        self.sp = sp;
    }
}

/// Live part of one segment as seen by the root enumerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub sp: usize,
    pub guard: usize,
    pub base: usize,
}

/// Stack state recorded when a context enters a blocking region
#[derive(Debug, Clone, Copy)]
pub struct StackSnapshot {
    pub segments: usize,
    pub sp: usize,
}

/// Segmented stack of root slots
pub struct ManagedStack {
    segments: Vec<StackSegment>,
    segment_words: usize,
    depth: usize,
}

impl ManagedStack {
    pub fn new(segment_words: usize) -> Self {
        Self {
            segments: vec![StackSegment::new(segment_words)],
            segment_words,
            depth: 0,
        }
    }

    /// Slots in use
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn top(&mut self) -> &mut StackSegment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    pub fn push(&mut self, value: usize) {
        if self.top().sp == self.top().guard() {
            self.segments.push(StackSegment::new(self.segment_words));
        }
        let seg = self.top();
        seg.sp -= WORD;
        let i = seg.slot_index(seg.sp);
        seg.mem[i] = value;
        self.depth += 1;
    }

    pub fn pop(&mut self) -> Option<usize> {
        if self.depth == 0 {
            return None;
        }
        if self.top().sp == self.top().base() {
            self.segments.pop();
        }
        let seg = self.top();
        let i = seg.slot_index(seg.sp);
        let value = std::mem::take(&mut seg.mem[i]);
        seg.sp += WORD;
        self.depth -= 1;
        Some(value)
    }

    /// Locate slot `n` counted from the top (0 = most recent)
    fn locate(&self, n: usize) -> Option<(usize, usize)> {
        if n >= self.depth {
            return None;
        }
        let mut remaining = n;
        for (si, seg) in self.segments.iter().enumerate().rev() {
            let live = (seg.base() - seg.sp) / WORD;
            if remaining < live {
                return Some((si, seg.slot_index(seg.sp) + remaining));
            }
            remaining -= live;
        }
        None
    }

    pub fn get(&self, n: usize) -> Option<usize> {
        let (si, i) = self.locate(n)?;
        Some(self.segments[si].mem[i])
    }

    /// Overwrite slot `n` from the top; false when out of range
    pub fn set(&mut self, n: usize, value: usize) -> bool {
        match self.locate(n) {
            Some((si, i)) => {
                self.segments[si].mem[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            segments: self.segments.len(),
            sp: self.segments[self.segments.len() - 1].sp,
        }
    }

    /// Live ranges, newest segment first, starting from `snapshot` if given
    pub fn ranges(&self, snapshot: Option<StackSnapshot>) -> Vec<StackRange> {
        let (count, top_sp) = match snapshot {
            Some(s) => (s.segments.min(self.segments.len()), Some(s.sp)),
            None => (self.segments.len(), None),
        };
        self.segments[..count]
            .iter()
            .rev()
            .enumerate()
            .map(|(i, seg)| StackRange {
                sp: if i == 0 { top_sp.unwrap_or(seg.sp) } else { seg.sp },
                guard: seg.guard(),
                base: seg.base(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn top_segment_for_test(&mut self) -> &mut StackSegment {
        self.top()
    }
}

/// A registered thread
pub struct ExecutionContext {
    id: u64,
    world_id: u64,
    role: ContextRole,
    status: AtomicU8,
    pub(crate) stack: Mutex<ManagedStack>,
    snapshot: Mutex<Option<StackSnapshot>>,
    pub(crate) cache: Mutex<LocalCache>,
}

impl ExecutionContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    #[inline]
    pub fn status(&self) -> ContextStatus {
        ContextStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ContextStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Stack snapshot taken when the context entered a blocking region
    pub fn syscall_snapshot(&self) -> Option<StackSnapshot> {
        *self.snapshot.lock()
    }

    /// Live stack ranges the collector must scan
    pub fn stack_ranges(&self) -> Vec<StackRange> {
        let snapshot = self.syscall_snapshot();
        self.stack.lock().ranges(snapshot)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

struct Sched {
    stopping: bool,
    contexts: Vec<Arc<ExecutionContext>>,
    next_id: u64,
}

/// Registry of execution contexts plus the stop/start protocol
pub struct World {
    id: u64,
    sched: Mutex<Sched>,
    cond: Condvar,
    segment_words: usize,
}

impl World {
    pub fn new() -> Self {
        Self::with_segment_words(STACK_SEGMENT_WORDS)
    }

    pub fn with_segment_words(segment_words: usize) -> Self {
        Self {
            id: NEXT_WORLD.fetch_add(1, Ordering::Relaxed),
            sched: Mutex::new(Sched {
                stopping: false,
                contexts: Vec::new(),
                next_id: 1,
            }),
            cond: Condvar::new(),
            segment_words: segment_words.max(1),
        }
    }

    /// Register the calling thread
    ///
    /// A mutator attaching while the world is stopped waits for the restart.
    pub fn attach(&self, role: ContextRole) -> Arc<ExecutionContext> {
        let mut sched = self.sched.lock();
        let status = match role {
            ContextRole::GcHelper => ContextStatus::Waiting,
            ContextRole::Mutator => {
                while sched.stopping {
                    self.cond.wait(&mut sched);
                }
                ContextStatus::Running
            }
        };
        let ctx = Arc::new(ExecutionContext {
            id: sched.next_id,
            world_id: self.id,
            role,
            status: AtomicU8::new(status as u8),
            stack: Mutex::new(ManagedStack::new(self.segment_words)),
            snapshot: Mutex::new(None),
            cache: Mutex::new(LocalCache::new()),
        });
        sched.next_id += 1;
        sched.contexts.push(Arc::clone(&ctx));
        drop(sched);

        if role == ContextRole::Mutator {
            CURRENT.with(|c| c.borrow_mut().push((self.id, Arc::clone(&ctx))));
        }
        log::trace!("context {} attached ({:?})", ctx.id, role);
        ctx
    }

    /// Unregister `ctx`, running `on_exit` while no pause can be in progress
    pub fn detach<F: FnOnce()>(&self, ctx: &Arc<ExecutionContext>, on_exit: F) {
        let mut sched = self.sched.lock();
        while sched.stopping && ctx.role == ContextRole::Mutator {
            ctx.set_status(ContextStatus::Paused);
            self.cond.notify_all();
            self.cond.wait(&mut sched);
        }
        on_exit();
        ctx.set_status(ContextStatus::Dead);
        sched.contexts.retain(|c| !Arc::ptr_eq(c, ctx));
        self.cond.notify_all();
        drop(sched);

        if ctx.world_id == self.id {
            CURRENT.with(|c| c.borrow_mut().retain(|(_, c)| !Arc::ptr_eq(c, ctx)));
        }
        log::trace!("context {} detached", ctx.id);
    }

    /// Context the calling thread attached to this world, if any
    pub fn current(&self) -> Option<Arc<ExecutionContext>> {
        CURRENT.with(|c| {
            c.borrow()
                .iter()
                .rev()
                .find(|(world, _)| *world == self.id)
                .map(|(_, ctx)| Arc::clone(ctx))
        })
    }

    /// Registered contexts, including helpers
    pub fn contexts(&self) -> Vec<Arc<ExecutionContext>> {
        self.sched.lock().contexts.clone()
    }

    /// Safepoint: park here while a pause is requested
    #[inline]
    pub fn poll(&self, ctx: &ExecutionContext) {
        if ctx.status() == ContextStatus::PauseRequested {
            self.park_for_pause(ctx);
        }
    }

    #[cold]
    fn park_for_pause(&self, ctx: &ExecutionContext) {
        let mut sched = self.sched.lock();
        if sched.stopping {
            ctx.set_status(ContextStatus::Paused);
            self.cond.notify_all();
            while sched.stopping {
                self.cond.wait(&mut sched);
            }
        }
        ctx.set_status(ContextStatus::Running);
    }

    /// Ask every running mutator except `caller` to pause and wait until
    /// none is running
    pub fn stop_the_world(&self, caller: Option<&ExecutionContext>) {
        let mut sched = self.sched.lock();
        if sched.stopping {
            crate::fatal!("stop_the_world: world already stopping");
        }
        sched.stopping = true;

        let is_caller = |c: &ExecutionContext| caller.is_some_and(|me| std::ptr::eq(me, c));
        for ctx in &sched.contexts {
            if ctx.role == ContextRole::Mutator
                && !is_caller(ctx)
                && ctx.status() == ContextStatus::Running
            {
                ctx.set_status(ContextStatus::PauseRequested);
            }
        }

        loop {
            let running = sched.contexts.iter().any(|ctx| {
                ctx.role == ContextRole::Mutator && !is_caller(ctx) && ctx.status().is_running()
            });
            if !running {
                break;
            }
            self.cond.wait(&mut sched);
        }
    }

    /// Resume every paused mutator
    pub fn start_the_world(&self) {
        let mut sched = self.sched.lock();
        sched.stopping = false;
        for ctx in &sched.contexts {
            if ctx.status() == ContextStatus::PauseRequested {
                ctx.set_status(ContextStatus::Running);
            }
        }
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.sched.lock().stopping
    }

    /// Leave the running state for `status` (Syscall or Waiting)
    pub fn enter_blocking(&self, ctx: &ExecutionContext, status: ContextStatus) {
        debug_assert!(matches!(
            status,
            ContextStatus::Syscall | ContextStatus::Waiting
        ));
        let snapshot = ctx.stack.lock().snapshot();
        let _sched = self.sched.lock();
        *ctx.snapshot.lock() = Some(snapshot);
        ctx.set_status(status);
        self.cond.notify_all();
    }

    /// Return to running, waiting out any pause in progress
    pub fn exit_blocking(&self, ctx: &ExecutionContext) {
        let mut sched = self.sched.lock();
        while sched.stopping {
            self.cond.wait(&mut sched);
        }
        *ctx.snapshot.lock() = None;
        ctx.set_status(ContextStatus::Running);
    }

    /// Run `f` outside the running state
    ///
    /// `f` must not touch the collected heap or the context's stack.
    pub fn blocking<R>(&self, ctx: &ExecutionContext, f: impl FnOnce() -> R) -> R {
        self.enter_blocking(ctx, ContextStatus::Syscall);
        let result = f();
        self.exit_blocking(ctx);
        result
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[test]
    fn test_managed_stack_grows_across_segments() {
        let mut stack = ManagedStack::new(4);
        for v in 1..=10 {
            stack.push(v);
        }
        assert_eq!(stack.depth(), 10);
        assert_eq!(stack.segment_count(), 3);
        assert_eq!(stack.get(0), Some(10));
        assert_eq!(stack.get(9), Some(1));
        assert!(stack.set(5, 55));
        assert_eq!(stack.get(5), Some(55));

        let ranges = stack.ranges(None);
        assert_eq!(ranges.len(), 3);
        let live: usize = ranges.iter().map(|r| (r.base - r.sp) / WORD).sum();
        assert_eq!(live, 10);

        for expected in (1..=10).rev() {
            let v = stack.pop().unwrap();
            if expected == 5 {
                assert_eq!(v, 55);
            } else {
                assert_eq!(v, expected);
            }
        }
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.segment_count(), 1);
    }

    #[test]
    fn test_snapshot_limits_ranges() {
        let mut stack = ManagedStack::new(4);
        for v in 0..6 {
            stack.push(v);
        }
        let snap = stack.snapshot();
        let ranges = stack.ranges(Some(snap));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].sp, snap.sp);
    }

    #[test]
    fn test_stop_waits_for_running_mutator() {
        let world = Arc::new(World::new());
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));

        let handle = {
            let world = Arc::clone(&world);
            let stop = Arc::clone(&stop);
            let polls = Arc::clone(&polls);
            std::thread::spawn(move || {
                let ctx = world.attach(ContextRole::Mutator);
                while !stop.load(Ordering::Acquire) {
                    world.poll(&ctx);
                    polls.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_micros(50));
                }
                world.detach(&ctx, || {});
            })
        };

        while polls.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        world.stop_the_world(None);
        let frozen = polls.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(polls.load(Ordering::Relaxed), frozen);
        assert!(world
            .contexts()
            .iter()
            .all(|c| c.status() == ContextStatus::Paused));
        world.start_the_world();

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(world.contexts().is_empty());
    }

    #[test]
    fn test_blocking_context_counts_as_stopped() {
        let world = World::new();
        let ctx = world.attach(ContextRole::Mutator);
        ctx.stack.lock().push(0xdead);

        world.enter_blocking(&ctx, ContextStatus::Syscall);
        world.stop_the_world(None);
        assert_eq!(ctx.status(), ContextStatus::Syscall);
        assert!(ctx.syscall_snapshot().is_some());
        assert_eq!(ctx.stack_ranges().len(), 1);
        world.start_the_world();
        world.exit_blocking(&ctx);

        assert_eq!(ctx.status(), ContextStatus::Running);
        assert!(ctx.syscall_snapshot().is_none());
        world.detach(&ctx, || {});
    }

    #[test]
    fn test_current_is_per_world() {
        let a = World::new();
        let b = World::new();
        let ca = a.attach(ContextRole::Mutator);
        assert!(b.current().is_none());
        let cb = b.attach(ContextRole::Mutator);
        assert!(Arc::ptr_eq(&a.current().unwrap(), &ca));
        assert!(Arc::ptr_eq(&b.current().unwrap(), &cb));
        a.detach(&ca, || {});
        assert!(a.current().is_none());
        b.detach(&cb, || {});
    }

    #[test]
    fn test_caller_is_not_waited_for() {
        let world = World::new();
        let me = world.attach(ContextRole::Mutator);
        world.stop_the_world(Some(&me));
        assert_eq!(me.status(), ContextStatus::Running);
        world.start_the_world();
        world.detach(&me, || {});
    }
}
