//! Test Utilities for the MGC Test Suite
//!
//! Fixtures and strict assertion helpers shared by the integration tests.
//! Objects in these tests are reachable only through mutator root stacks
//! and object slots, so reachability is exact: a block is either provably
//! live or provably garbage.
//!
//! ============================================================================
//! These utilities are designed to FIND BUGS: no tolerances in assertions.
//! ============================================================================

#![allow(dead_code)]

use mgc::{CollectOutcome, CycleStats, GcConfig, Mutator, Runtime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Maximum test duration before timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Words per node in generated graphs
pub const NODE_WORDS: usize = 4;

/// ============================================================================
/// GC FIXTURE
/// ============================================================================

/// Test fixture owning one runtime
///
/// The finalizer runner is off by default so tests drain finalizers
/// explicitly and deterministically.
pub struct GcFixture {
    pub runtime: Runtime,
    pub config: GcConfig,
}

impl GcFixture {
    /// Create fixture with test configuration
    ///
    /// **Bug this finds:** Configuration validation bugs, initialization failures
    pub fn with_defaults() -> Self {
        Self::with_config(GcConfig {
            finalizers: false,
            ..GcConfig::for_testing()
        })
    }

    /// Create fixture with a custom configuration
    pub fn with_config(config: GcConfig) -> Self {
        let runtime =
            Runtime::new(config.clone()).expect("runtime creation should succeed with valid config");
        Self { runtime, config }
    }

    /// Create fixture capped at `workers` collector workers
    pub fn with_workers(workers: usize) -> Self {
        Self::with_config(GcConfig {
            gc_threads: Some(workers),
            finalizers: false,
            ..GcConfig::for_testing()
        })
    }

    /// Attach the calling thread
    pub fn mutator(&self) -> Mutator {
        self.runtime.attach()
    }

    /// Completed cycles so far
    pub fn numgc(&self) -> u32 {
        self.runtime.stats().numgc
    }

    pub fn is_allocated(&self, obj: usize) -> bool {
        self.runtime.collector().heap().is_allocated(obj)
    }

    pub fn heap_alloc(&self) -> usize {
        self.runtime.collector().heap().heap_alloc()
    }
}

/// Run a forced cycle and return its statistics
///
/// **Bug this finds:** Forced requests dropped or skipped
pub fn force_gc(m: &Mutator) -> CycleStats {
    match m.collect(true).expect("forced collection should not fail") {
        CollectOutcome::Completed(stats) => stats,
        other => panic!("forced collection did not run: {:?}", other),
    }
}

/// ============================================================================
/// OBJECT GRAPHS
/// ============================================================================

/// Allocate a singly linked list of `len` nodes through slot 0
///
/// Returns the nodes, head first. The head is pushed on the root stack.
pub fn build_rooted_list(m: &mut Mutator, len: usize, size: usize) -> Vec<usize> {
    let head = m.alloc(size).expect("allocation should succeed");
    m.push_root(head);
    let mut nodes = vec![head];
    let mut prev = head;
    for _ in 1..len {
        let next = m.alloc(size).expect("allocation should succeed");
        m.write_slot(prev, 0, next).expect("slot 0 is in bounds");
        nodes.push(next);
        prev = next;
    }
    nodes
}

/// A random object graph built on a mutator
pub struct RandomGraph {
    pub nodes: Vec<usize>,
    /// Outgoing edges by node index
    pub edges: Vec<Vec<usize>>,
    /// Node indices pushed on the root stack
    pub roots: Vec<usize>,
}

impl RandomGraph {
    /// Build `n` nodes with up to `NODE_WORDS` random edges each
    ///
    /// Some edges are stored as interior pointers. Every node is rooted
    /// while the graph is built; only `nroots` stay rooted afterwards.
    pub fn build(m: &mut Mutator, seed: u64, n: usize, nroots: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let base_depth = m.root_depth();
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            let obj = m
                .alloc(NODE_WORDS * mgc::util::WORD)
                .expect("allocation should succeed");
            m.push_root(obj);
            nodes.push(obj);
        }

        let mut edges = vec![Vec::new(); n];
        for (i, node_edges) in edges.iter_mut().enumerate() {
            for slot in 0..NODE_WORDS {
                if rng.gen_bool(0.35) {
                    let j = rng.gen_range(0..n);
                    let value = if rng.gen_bool(0.25) {
                        nodes[j] + mgc::util::WORD * rng.gen_range(1..NODE_WORDS)
                    } else {
                        nodes[j]
                    };
                    m.write_slot(nodes[i], slot, value).expect("slot in bounds");
                    node_edges.push(j);
                }
            }
        }

        while m.root_depth() > base_depth {
            m.pop_root();
        }
        let roots: Vec<usize> = (0..nroots.min(n)).map(|_| rng.gen_range(0..n)).collect();
        for &r in &roots {
            m.push_root(nodes[r]);
        }

        Self {
            nodes,
            edges,
            roots,
        }
    }

    /// Indices reachable from the roots
    pub fn reachable(&self) -> HashSet<usize> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if !seen.insert(i) {
                continue;
            }
            queue.extend(self.edges[i].iter().copied());
        }
        seen
    }
}

/// ============================================================================
/// ASSERTIONS
/// ============================================================================

/// Assert a block is still allocated
///
/// **Bug this finds:** Live object reclaimed (soundness violation)
pub fn assert_alive(fixture: &GcFixture, obj: usize, context: &str) {
    assert!(
        fixture.is_allocated(obj),
        "{}: live object {:#x} was reclaimed",
        context,
        obj
    );
}

/// Assert a block was reclaimed
///
/// **Bug this finds:** Garbage retained (completeness violation)
pub fn assert_freed(fixture: &GcFixture, obj: usize, context: &str) {
    assert!(
        !fixture.is_allocated(obj),
        "{}: garbage object {:#x} is still allocated",
        context,
        obj
    );
}

/// Poll `cond` until it holds or the timeout expires
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
