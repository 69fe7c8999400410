//! Stats Module - Collector Statistics
//!
//! Two views:
//! - [`MemStats`]: heap-wide snapshot, read with the world stopped so every
//!   counter comes from the same instant
//! - [`CycleStats`]: what one cycle did (phase times, heap before/after,
//!   work-sharing counters)
//!
//! Both serialize with serde for tooling.

pub mod timer;

pub use timer::GcTimer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pause history length
pub const PAUSE_HISTORY: usize = 256;

/// Allocation counts of one size class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassStats {
    /// Element size; 0 aggregates large objects
    pub size: usize,
    pub nmalloc: u64,
    pub nfree: u64,
}

/// Heap and collector statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemStats {
    /// Bytes in allocated blocks
    pub heap_alloc: usize,
    /// Bytes of arena and bitmap obtained so far
    pub heap_sys: usize,
    /// Bytes in in-use spans
    pub heap_inuse: usize,
    /// Bytes returned to the OS
    pub heap_released: usize,
    /// Allocated blocks
    pub heap_objects: u64,
    pub nmalloc: u64,
    pub nfree: u64,
    /// `heap_alloc` value that triggers the next cycle
    pub next_gc: usize,
    pub last_gc: Option<DateTime<Utc>>,
    pub pause_total_ns: u64,
    /// Recent pauses, most recent at `(numgc + 255) % 256`
    pub pause_ns: Vec<u64>,
    pub numgc: u32,
    pub enable_gc: bool,
    pub by_size: Vec<SizeClassStats>,
}

impl MemStats {
    /// Pause of the most recent cycle
    pub fn last_pause_ns(&self) -> Option<u64> {
        if self.numgc == 0 {
            return None;
        }
        let i = (self.numgc as usize + PAUSE_HISTORY - 1) % PAUSE_HISTORY;
        self.pause_ns.get(i).copied()
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    /// Cycle number, starting at 1
    pub cycle: u32,
    pub forced: bool,
    /// Workers that took part
    pub nproc: usize,
    pub roots: usize,
    pub mark_ns: u64,
    pub sweep_ns: u64,
    /// Pause time outside mark and sweep
    pub rest_ns: u64,
    pub pause_ns: u64,
    pub heap_before: usize,
    pub heap_after: usize,
    pub objects_before: u64,
    pub objects_after: u64,
    pub nmalloc: u64,
    pub nfree: u64,
    pub freed_objects: u64,
    pub freed_bytes: u64,
    pub spans_swept: u64,
    pub nhandoff: u64,
    pub nhandoffcnt: u64,
    pub nsteal: u64,
    pub nstealcnt: u64,
    pub nprocyield: u64,
    pub nosyield: u64,
    pub nsleep: u64,
    pub finalizers_queued: u64,
    /// Reachable blocks the parallel pass missed (verification pass only)
    pub debug_missed: u64,
    /// Marked blocks the verification pass never reached
    pub spurious_marks: u64,
    pub next_gc: usize,
}

impl CycleStats {
    /// Summary line in the classic trace format
    pub fn trace_line(&self) -> String {
        format!(
            "gc{}({}): {}+{}+{} ms, {} -> {} MB {} -> {} ({}-{}) objects, \
             {}({}) handoff, {}({}) steal, {}/{}/{} yields",
            self.cycle,
            self.nproc,
            self.mark_ns / 1_000_000,
            self.sweep_ns / 1_000_000,
            self.rest_ns / 1_000_000,
            self.heap_before >> 20,
            self.heap_after >> 20,
            self.objects_before,
            self.objects_after,
            self.nmalloc,
            self.nfree,
            self.nhandoff,
            self.nhandoffcnt,
            self.nsteal,
            self.nstealcnt,
            self.nprocyield,
            self.nosyield,
            self.nsleep,
        )
    }
}

/// Cycle count, pause ring and last cycle time
#[derive(Debug, Clone)]
pub struct PauseHistory {
    pause_ns: Vec<u64>,
    pause_total_ns: u64,
    numgc: u32,
    last_gc: Option<DateTime<Utc>>,
}

impl PauseHistory {
    pub fn new() -> Self {
        Self {
            pause_ns: vec![0; PAUSE_HISTORY],
            pause_total_ns: 0,
            numgc: 0,
            last_gc: None,
        }
    }

    /// Record a finished cycle; returns its number
    pub fn record(&mut self, pause_ns: u64, at: DateTime<Utc>) -> u32 {
        self.pause_ns[self.numgc as usize % PAUSE_HISTORY] = pause_ns;
        self.pause_total_ns += pause_ns;
        self.numgc += 1;
        self.last_gc = Some(at);
        self.numgc
    }

    pub fn numgc(&self) -> u32 {
        self.numgc
    }

    /// Copy the history into `stats`
    pub fn fill(&self, stats: &mut MemStats) {
        stats.pause_ns = self.pause_ns.clone();
        stats.pause_total_ns = self.pause_total_ns;
        stats.numgc = self.numgc;
        stats.last_gc = self.last_gc;
    }
}

impl Default for PauseHistory {
    fn default() -> Self {
        Self::new()
    }
}
