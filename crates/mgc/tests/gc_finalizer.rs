//! GC Finalizer Tests - Deferred Reclamation
//!
//! These tests verify that:
//! - An unreachable object with a finalizer survives one more cycle
//! - Everything it references survives with it
//! - The finalizer runs exactly once, outside the pause
//! - Removing a finalizer makes the object ordinary garbage again
//!
//! Fixtures run with the finalizer thread off and drain the queue
//! explicitly, except where the runner itself is under test.
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC FINALIZER BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{assert_alive, assert_freed, force_gc, wait_until, GcFixture, TEST_TIMEOUT};
use mgc::runtime::CallTrampoline;
use mgc::util::WORD;
use mgc::{FinalizerFn, GcConfig, GcError, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// ============================================================================
/// DEFERRAL TESTS
/// ============================================================================

static DEFERRED_CALLS: AtomicUsize = AtomicUsize::new(0);
static DEFERRED_ARG: AtomicUsize = AtomicUsize::new(0);

fn record_deferred(obj: usize) {
    DEFERRED_ARG.store(obj, Ordering::SeqCst);
    DEFERRED_CALLS.fetch_add(1, Ordering::SeqCst);
}

/// Finalizable object and its child across three cycles
///
/// **Bug this finds:** Finalizable object freed before its finalizer runs,
/// children freed out from under it, finalizer run twice
/// **Invariant verified:** Queued at cycle 1, called once with the object,
/// freed at the next cycle
#[test]
fn test_finalizer_defers_reclamation_by_one_cycle() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let obj = m.alloc(64).expect("alloc");
    m.push_root(obj);
    let child = m.alloc(32).expect("alloc child");
    m.write_slot(obj, 1, child).expect("link");
    m.set_finalizer(obj, record_deferred, 0).expect("register");
    m.pop_root();

    // Act - first cycle finds it unreachable
    let first = force_gc(&m);

    // Assert - kept, queued, not yet called
    assert_eq!(first.finalizers_queued, 1);
    assert_eq!(first.freed_objects, 0, "finalizable object or child freed");
    assert_alive(&fixture, obj, "queued object");
    assert_alive(&fixture, child, "child of queued object");
    assert_eq!(DEFERRED_CALLS.load(Ordering::SeqCst), 0, "ran inside the pause");

    // Act - drain
    let ran = m.run_finalizers();

    // Assert
    assert_eq!(ran, 1);
    assert_eq!(DEFERRED_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(DEFERRED_ARG.load(Ordering::SeqCst), obj);

    // Act - next cycle
    let second = force_gc(&m);

    // Assert - both gone, nothing queued again
    assert_eq!(second.finalizers_queued, 0);
    assert_freed(&fixture, obj, "finalized object");
    assert_freed(&fixture, child, "child of finalized object");
    assert_eq!(m.run_finalizers(), 0);
    assert_eq!(DEFERRED_CALLS.load(Ordering::SeqCst), 1, "finalizer ran twice");
}

static REACHABLE_CALLS: AtomicUsize = AtomicUsize::new(0);

fn record_reachable(_: usize) {
    REACHABLE_CALLS.fetch_add(1, Ordering::SeqCst);
}

/// Reachable finalizable object
///
/// **Bug this finds:** Special bit treated as unreachable
/// **Invariant verified:** A reachable object is never queued
#[test]
fn test_reachable_object_is_not_finalized() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let obj = m.alloc(48).expect("alloc");
    m.push_root(obj);
    m.set_finalizer(obj, record_reachable, 0).expect("register");

    // Act
    let stats = force_gc(&m);
    let ran = m.run_finalizers();

    // Assert
    assert_eq!(stats.finalizers_queued, 0);
    assert_eq!(ran, 0);
    assert_eq!(REACHABLE_CALLS.load(Ordering::SeqCst), 0);
    assert_alive(&fixture, obj, "rooted finalizable object");
    assert!(fixture.runtime.collector().is_special(obj));
}

static REMOVED_CALLS: AtomicUsize = AtomicUsize::new(0);

fn record_removed(_: usize) {
    REMOVED_CALLS.fetch_add(1, Ordering::SeqCst);
}

/// Finalizer cancelled before the object dies
///
/// **Bug this finds:** Stale Special bit keeping garbage alive
/// **Invariant verified:** Without a finalizer the object is freed at once
#[test]
fn test_removed_finalizer_allows_immediate_reclaim() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let obj = m.alloc(64).expect("alloc");
    m.set_finalizer(obj, record_removed, 0).expect("register");

    // Act
    assert!(m.remove_finalizer(obj));
    assert!(!m.remove_finalizer(obj), "second removal reported success");
    let stats = force_gc(&m);

    // Assert
    assert_eq!(stats.finalizers_queued, 0);
    assert_freed(&fixture, obj, "object whose finalizer was removed");
    assert_eq!(m.run_finalizers(), 0);
    assert_eq!(REMOVED_CALLS.load(Ordering::SeqCst), 0);
}

fn noop(_: usize) {}

/// Registration errors
///
/// **Bug this finds:** Finalizers attached to interior or freed addresses
/// **Invariant verified:** Only block starts accept one finalizer each
#[test]
fn test_registration_is_validated() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let obj = m.alloc(64).expect("alloc");
    m.push_root(obj);

    // Act / Assert
    assert!(matches!(
        m.set_finalizer(obj + WORD, noop, 0),
        Err(GcError::InvalidPointer { .. })
    ));
    m.set_finalizer(obj, noop, 0).expect("first registration");
    assert!(matches!(
        m.set_finalizer(obj, noop, 0),
        Err(GcError::FinalizerAlreadySet { .. })
    ));
    assert!(matches!(
        m.set_finalizer(0x10, noop, 0),
        Err(GcError::InvalidPointer { .. })
    ));
}

/// ============================================================================
/// QUEUE TESTS
/// ============================================================================

static MANY_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_many(_: usize) {
    MANY_CALLS.fetch_add(1, Ordering::SeqCst);
}

/// More finalizers than fit in one queue block
///
/// **Bug this finds:** Records lost when the queue grows a block, later
/// blocks not scanned as roots
/// **Invariant verified:** Every queued object survives until drained
#[test]
fn test_queue_spanning_blocks_keeps_every_object() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let mut objs = Vec::new();
    for _ in 0..600 {
        let obj = m.alloc(32).expect("alloc");
        m.push_root(obj);
        m.set_finalizer(obj, count_many, 0).expect("register");
        objs.push(obj);
    }
    for _ in 0..objs.len() {
        m.pop_root();
    }

    // Act
    let first = force_gc(&m);
    let blocks = fixture.runtime.collector().finalizers().queue.blocks();
    let second = force_gc(&m);

    // Assert - still queued across an extra cycle
    assert_eq!(first.finalizers_queued, 600);
    assert!(blocks > 1, "600 records fit in {} block", blocks);
    assert_eq!(second.finalizers_queued, 0);
    assert_eq!(second.freed_objects, 0, "queued objects freed before running");
    for &obj in &objs {
        assert_alive(&fixture, obj, "queued object after a second cycle");
    }

    // Act
    let ran = m.run_finalizers();
    let third = force_gc(&m);

    // Assert
    assert_eq!(ran, 600);
    assert_eq!(MANY_CALLS.load(Ordering::SeqCst), 600);
    assert_eq!(third.freed_objects, 600);
}

/// Records frames handed to the trampoline
struct RecordingTrampoline {
    frames: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl CallTrampoline for RecordingTrampoline {
    fn call(&self, func: FinalizerFn, frame: &mut [u8]) {
        let mut arg = [0u8; WORD];
        arg.copy_from_slice(&frame[..WORD]);
        let arg = usize::from_ne_bytes(arg);
        self.frames
            .lock()
            .expect("frames lock")
            .push((arg, frame.len()));
        func(arg);
    }
}

/// Return space reserved after the argument
///
/// **Bug this finds:** Frame sized without the return area
/// **Invariant verified:** Frame length is one word plus `nret`
#[test]
fn test_trampoline_frame_includes_return_space() {
    // Arrange
    let frames = Arc::new(Mutex::new(Vec::new()));
    let runtime = Runtime::with_trampoline(
        GcConfig {
            finalizers: false,
            ..GcConfig::for_testing()
        },
        Box::new(RecordingTrampoline {
            frames: Arc::clone(&frames),
        }),
    )
    .expect("runtime");
    let mut m = runtime.attach();
    let small = m.alloc(16).expect("alloc");
    let wide = m.alloc(16).expect("alloc");
    m.set_finalizer(small, noop, 0).expect("register");
    m.set_finalizer(wide, noop, 24).expect("register");

    // Act
    force_gc(&m);
    let ran = m.run_finalizers();

    // Assert
    assert_eq!(ran, 2);
    let mut seen = frames.lock().expect("frames lock").clone();
    seen.sort();
    let mut expected = vec![(small, WORD), (wide, WORD + 24)];
    expected.sort();
    assert_eq!(seen, expected);
}

/// ============================================================================
/// RUNNER THREAD TESTS
/// ============================================================================

static RUNNER_CALLS: AtomicUsize = AtomicUsize::new(0);

fn record_runner(_: usize) {
    RUNNER_CALLS.fetch_add(1, Ordering::SeqCst);
}

/// Finalizer thread drains the queue after the world restarts
///
/// **Bug this finds:** Runner never woken, runner deadlocked against a
/// cycle it triggered
/// **Invariant verified:** Queued finalizers run without an explicit drain
#[test]
fn test_runner_thread_runs_queued_finalizers() {
    // Arrange
    let fixture = GcFixture::with_config(GcConfig {
        finalizers: true,
        ..GcConfig::for_testing()
    });
    let mut m = fixture.mutator();
    let obj = m.alloc(64).expect("alloc");
    m.set_finalizer(obj, record_runner, 0).expect("register");

    // Act
    force_gc(&m);
    let ran = m.blocking(|| {
        wait_until(TEST_TIMEOUT, || RUNNER_CALLS.load(Ordering::SeqCst) == 1)
    });

    // Assert
    assert!(ran, "finalizer thread never ran the finalizer");
    assert!(
        m.blocking(|| wait_until(TEST_TIMEOUT, || !fixture.is_allocated(obj))),
        "object not reclaimed by the collection after finalization"
    );
    assert_eq!(RUNNER_CALLS.load(Ordering::SeqCst), 1);
}

/// ============================================================================
/// PROFILING TESTS
/// ============================================================================

/// Profiled object dying
///
/// **Bug this finds:** Profile records leaked for dead objects
/// **Invariant verified:** Death is counted once the cycle completes
#[test]
fn test_profiled_object_death_is_recorded() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    let obj = m.alloc(128).expect("alloc");
    fixture
        .runtime
        .collector()
        .profile_object(obj)
        .expect("profile");
    let profile = fixture.runtime.collector().profile();

    // Act
    let stats = force_gc(&m);

    // Assert - profiled objects are not deferred
    assert_eq!(stats.finalizers_queued, 0);
    assert_freed(&fixture, obj, "profiled object");
    let snapshot = profile.snapshot();
    assert_eq!(snapshot.allocs, 1);
    assert_eq!(snapshot.frees, 1);
    assert_eq!(snapshot.free_bytes, 128);
    assert_eq!(snapshot.live_objects, 0);
}
