//! Parallel For - Index Range Partitioning with Stealing
//!
//! Splits `[0, n)` evenly across `nthr` workers. Each worker's remaining
//! range lives in one `AtomicU64` (`begin` low half, `end` high half), so
//! taking the next index is a single `fetch_add`. A worker that runs dry
//! steals the upper half of a random victim's range with a CAS.
//!
//! Termination: a worker that finds nothing to steal for a while declares
//! itself idle by bumping `done`; once every worker is idle the loop ends.
//! Without `wait`, a worker leaves as soon as stealing stops paying off and
//! leaves the tail to the owners of the remaining ranges. [`ParFor::abort`]
//! sends every worker home at its next index, finished or not.

use crate::util::BackoffStats;
use crossbeam::utils::CachePadded;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[inline]
fn pack(begin: u32, end: u32) -> u64 {
    begin as u64 | ((end as u64) << 32)
}

#[inline]
fn unpack(pos: u64) -> (u32, u32) {
    (pos as u32, (pos >> 32) as u32)
}

/// Steal counters summed over all workers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StealStats {
    pub nsteal: u64,
    pub nstealcnt: u64,
}

/// One parallel loop over `[0, n)`
pub struct ParFor {
    pos: Box<[CachePadded<AtomicU64>]>,
    nthr: usize,
    cnt: usize,
    wait: bool,
    done: AtomicUsize,
    aborted: AtomicBool,
    nsteal: AtomicU64,
    nstealcnt: AtomicU64,
}

impl ParFor {
    /// Partition `n` iterations over `nthr` workers
    pub fn new(nthr: usize, n: usize, wait: bool) -> Self {
        if nthr == 0 {
            crate::fatal!("parfor: zero workers");
        }
        if n >= u32::MAX as usize {
            crate::fatal!("parfor: {} iterations exceed range", n);
        }
        let pos = (0..nthr)
            .map(|i| {
                let begin = (n * i / nthr) as u32;
                let end = (n * (i + 1) / nthr) as u32;
                CachePadded::new(AtomicU64::new(pack(begin, end)))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            pos,
            nthr,
            cnt: n,
            wait,
            done: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            nsteal: AtomicU64::new(0),
            nstealcnt: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.nthr
    }

    pub fn len(&self) -> usize {
        self.cnt
    }

    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    pub fn steal_stats(&self) -> StealStats {
        StealStats {
            nsteal: self.nsteal.load(Ordering::Relaxed),
            nstealcnt: self.nstealcnt.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop early; a worker that died never reports itself done
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Run `body` for this worker's share of the indices, then help others
    pub fn run<F: FnMut(usize)>(&self, tid: usize, mut body: F, stats: &mut BackoffStats) {
        if tid >= self.nthr {
            crate::fatal!("parfor: worker {} of {}", tid, self.nthr);
        }
        if self.nthr == 1 {
            for i in 0..self.cnt {
                body(i);
            }
            return;
        }

        let me = &self.pos[tid];
        let mut rng = rand::thread_rng();
        loop {
            // Drain the local range.
            loop {
                if self.is_aborted() {
                    return;
                }
                let pos = me.fetch_add(1, Ordering::AcqRel);
                let (begin, end) = unpack(pos);
                if begin >= end {
                    break;
                }
                body(begin as usize);
            }

            // Out of local work: steal.
            let mut idle = false;
            let mut attempt = 0usize;
            loop {
                if self.is_aborted() {
                    return;
                }
                if attempt > self.nthr * 4 && !idle {
                    idle = true;
                    self.done.fetch_add(1, Ordering::AcqRel);
                }
                if self.done.load(Ordering::Acquire) + usize::from(!idle) == self.nthr {
                    if !idle {
                        self.done.fetch_add(1, Ordering::AcqRel);
                    }
                    return;
                }

                let mut victim = rng.gen_range(0..self.nthr - 1);
                if victim >= tid {
                    victim += 1;
                }
                let victim_pos = &self.pos[victim];
                let (mut begin, mut end);
                loop {
                    let pos = victim_pos.load(Ordering::Acquire);
                    (begin, end) = unpack(pos);
                    if begin.saturating_add(1) >= end {
                        begin = 0;
                        end = 0;
                        break;
                    }
                    if idle {
                        self.done.fetch_sub(1, Ordering::AcqRel);
                        idle = false;
                    }
                    let mid = begin + (end - begin) / 2;
                    if victim_pos
                        .compare_exchange(pos, pack(begin, mid), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        begin = mid;
                        break;
                    }
                }

                if begin < end {
                    if idle {
                        crate::fatal!("parfor: idle worker stole work");
                    }
                    me.store(pack(begin, end), Ordering::Release);
                    self.nsteal.fetch_add(1, Ordering::Relaxed);
                    self.nstealcnt
                        .fetch_add((end - begin) as u64, Ordering::Relaxed);
                    break;
                }

                if attempt < self.nthr {
                    // Try again right away.
                } else if attempt < 4 * self.nthr {
                    stats.nprocyield += 1;
                    for _ in 0..20 {
                        std::hint::spin_loop();
                    }
                } else if !self.wait {
                    if !idle {
                        self.done.fetch_add(1, Ordering::AcqRel);
                    }
                    return;
                } else if attempt < 6 * self.nthr {
                    stats.nosyield += 1;
                    std::thread::yield_now();
                } else {
                    stats.nsleep += 1;
                    std::thread::sleep(Duration::from_micros(1));
                }
                attempt += 1;
            }
        }
    }
}
