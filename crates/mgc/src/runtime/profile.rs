//! Memory Profile - Sampled Allocation Records
//!
//! Objects registered for profiling carry the Special bit, so the sweeper
//! reports their death through the finalizer path. Frees are counted as
//! "recent" until the end of the cycle that observed them, then folded into
//! the totals, so a snapshot never shows half a cycle.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Totals reported by [`MemProfile::snapshot`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    /// Profiled objects not yet seen dead
    pub live_objects: u64,
}

#[derive(Default)]
struct Counts {
    allocs: u64,
    frees: u64,
    alloc_bytes: u64,
    free_bytes: u64,
}

#[derive(Default)]
struct ProfileState {
    live: IndexMap<usize, usize>,
    totals: Counts,
    recent: Counts,
}

/// Profiling records keyed by object address
#[derive(Default)]
pub struct MemProfile {
    state: Mutex<ProfileState>,
}

impl MemProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `obj`; false if it is already tracked
    pub fn record_alloc(&self, obj: usize, size: usize) -> bool {
        let mut state = self.state.lock();
        if state.live.contains_key(&obj) {
            return false;
        }
        state.live.insert(obj, size);
        state.recent.allocs += 1;
        state.recent.alloc_bytes += size as u64;
        true
    }

    /// Note the death of `obj`; false if it was never profiled
    pub fn record_free(&self, obj: usize, size: usize) -> bool {
        let mut state = self.state.lock();
        if state.live.swap_remove(&obj).is_none() {
            return false;
        }
        state.recent.frees += 1;
        state.recent.free_bytes += size as u64;
        true
    }

    pub fn contains(&self, obj: usize) -> bool {
        self.state.lock().live.contains_key(&obj)
    }

    /// Fold this cycle's counts into the totals
    pub fn cycle(&self) {
        let mut state = self.state.lock();
        let recent = std::mem::take(&mut state.recent);
        state.totals.allocs += recent.allocs;
        state.totals.frees += recent.frees;
        state.totals.alloc_bytes += recent.alloc_bytes;
        state.totals.free_bytes += recent.free_bytes;
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let state = self.state.lock();
        ProfileSnapshot {
            allocs: state.totals.allocs,
            frees: state.totals.frees,
            alloc_bytes: state.totals.alloc_bytes,
            free_bytes: state.totals.free_bytes,
            live_objects: state.live.len() as u64,
        }
    }
}
