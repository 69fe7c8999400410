//! GC Trigger Tests - Pacing and Request Filtering
//!
//! These tests verify that:
//! - Unforced requests below the trigger are no-ops
//! - The trigger after a cycle is `live + live * gc_percent / 100`
//! - Allocation crossing the trigger starts a cycle by itself
//! - Disabled collection and held locks drop requests, forced or not
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC PACING BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{build_rooted_list, force_gc, GcFixture};
use mgc::{CollectOutcome, GcConfig, LockDepth, SkipReason, KB};

fn config_with(gc_percent: i32, initial_trigger: usize) -> GcConfig {
    GcConfig {
        gc_percent,
        initial_trigger,
        finalizers: false,
        ..GcConfig::for_testing()
    }
}

/// ============================================================================
/// THRESHOLD TESTS
/// ============================================================================

/// Fresh heap far below the initial trigger
///
/// **Bug this finds:** Unforced requests ignoring the trigger
/// **Invariant verified:** Below the trigger nothing runs
#[test]
fn test_unforced_request_below_trigger_is_noop() {
    // Arrange
    let fixture = GcFixture::with_defaults();
    let mut m = fixture.mutator();
    m.alloc(1024).expect("alloc");

    // Act
    let outcome = m.collect(false).expect("collect");

    // Assert
    assert!(matches!(outcome, CollectOutcome::BelowThreshold));
    assert_eq!(fixture.numgc(), 0);
    assert_eq!(fixture.runtime.collector().next_gc(), fixture.config.initial_trigger);
}

/// Ratio 100: the heap may double before the next cycle
///
/// **Bug this finds:** Wrong trigger formula, triggers checked against
/// the wrong counter
/// **Invariant verified:** No cycle below 2x live; a cycle at 2x live
#[test]
fn test_trigger_at_double_the_live_heap() {
    // Arrange - 256KB live
    let fixture = GcFixture::with_config(config_with(100, 4 * 1024 * KB));
    let mut m = fixture.mutator();
    build_rooted_list(&mut m, 1024, 256);
    let stats = force_gc(&m);
    let live = fixture.heap_alloc();
    assert_eq!(stats.next_gc, 2 * live);
    assert_eq!(fixture.runtime.collector().next_gc(), 2 * live);
    let numgc = fixture.numgc();

    // Act - grow garbage up to the trigger
    let mut garbage = 0u64;
    while fixture.heap_alloc() < fixture.runtime.collector().next_gc() {
        if garbage == 100 {
            assert!(
                matches!(
                    m.collect(false).expect("collect"),
                    CollectOutcome::BelowThreshold
                ),
                "cycle ran below the trigger"
            );
        }
        m.alloc(64).expect("garbage");
        garbage += 1;
    }

    // Assert - allocation alone did not collect before crossing
    assert_eq!(fixture.numgc(), numgc);
    let outcome = m.collect(false).expect("collect");
    let stats = outcome.cycle_stats().cloned().expect("cycle at the trigger");
    assert!(!stats.forced);
    assert_eq!(stats.freed_objects, garbage);
    assert_eq!(fixture.heap_alloc(), live);
}

/// Ratio 50
///
/// **Bug this finds:** Ratio applied as a fixed factor
/// **Invariant verified:** `next_gc = live + live * 50 / 100`
#[test]
fn test_trigger_follows_gc_percent() {
    // Arrange
    let fixture = GcFixture::with_config(config_with(50, 4 * 1024 * KB));
    let mut m = fixture.mutator();
    build_rooted_list(&mut m, 777, 96);

    // Act
    let stats = force_gc(&m);

    // Assert
    let live = stats.heap_after;
    assert_eq!(live, 777 * 96);
    assert_eq!(stats.next_gc, live + live * 50 / 100);
    assert_eq!(fixture.runtime.stats().next_gc, stats.next_gc);
}

/// Allocation loop with a small trigger
///
/// **Bug this finds:** Allocation never checking the trigger, unbounded
/// heap growth under garbage churn
/// **Invariant verified:** Cycles start from allocation and keep the heap
/// near the pacing target
#[test]
fn test_allocation_triggers_collection() {
    // Arrange - 128KB live, 64KB initial trigger
    let fixture = GcFixture::with_config(config_with(100, 64 * KB));
    let mut m = fixture.mutator();
    build_rooted_list(&mut m, 512, 256);

    // Act - 4MB of garbage
    for _ in 0..(4 * 1024 * KB / 128) {
        m.alloc(128).expect("garbage");
    }

    // Assert
    let stats = fixture.runtime.stats();
    assert!(stats.numgc >= 8, "only {} cycles for 4MB of churn", stats.numgc);
    assert!(
        stats.heap_alloc <= stats.next_gc + 128,
        "heap {} overshot the trigger {}",
        stats.heap_alloc,
        stats.next_gc
    );
    assert!(stats.pause_total_ns > 0);
    assert!(stats.last_pause_ns().is_some());
}

/// Trace level 2 doubles every triggered cycle
///
/// **Bug this finds:** Verification cycle skipped or run recursively forever
/// **Invariant verified:** One unforced request runs exactly two cycles
#[test]
fn test_trace_level_two_runs_second_cycle() {
    // Arrange
    let fixture = GcFixture::with_config(GcConfig {
        trace: 2,
        ..config_with(100, 64 * KB)
    });
    let mut m = fixture.mutator();
    build_rooted_list(&mut m, 64, 64);
    while fixture.heap_alloc() < fixture.runtime.collector().next_gc() {
        m.alloc(256).expect("garbage");
    }
    let numgc = fixture.numgc();

    // Act
    let outcome = m.collect(false).expect("collect");

    // Assert
    assert!(outcome.is_completed());
    assert_eq!(fixture.numgc(), numgc + 2);
    let last = fixture.runtime.last_cycle().expect("last cycle");
    assert!(last.forced, "second cycle must be the forced one");
    assert_eq!(last.freed_objects, 0);
}

/// ============================================================================
/// REQUEST FILTER TESTS
/// ============================================================================

/// Negative ratio
///
/// **Bug this finds:** Forced requests bypassing a disabled collector
/// **Invariant verified:** With `gc_percent < 0` no cycle ever runs
#[test]
fn test_negative_percent_disables_everything() {
    // Arrange
    let fixture = GcFixture::with_config(config_with(-1, 64 * KB));
    let mut m = fixture.mutator();

    // Act - well past the trigger
    for _ in 0..1024 {
        m.alloc(1024).expect("alloc");
    }
    let forced = m.collect(true).expect("collect");

    // Assert
    assert!(matches!(
        forced,
        CollectOutcome::Skipped(SkipReason::Disabled)
    ));
    let stats = fixture.runtime.stats();
    assert_eq!(stats.numgc, 0);
    assert!(!stats.enable_gc);
    assert_eq!(stats.heap_alloc, 1024 * 1024);
}

/// Allocation while the thread holds runtime locks
///
/// **Bug this finds:** Cycle started from inside a locked region
/// **Invariant verified:** Requests under a lock guard are dropped
#[test]
fn test_lock_depth_drops_requests() {
    // Arrange
    let fixture = GcFixture::with_config(config_with(100, 64 * KB));
    let mut m = fixture.mutator();

    // Act
    let outcome = {
        let _locks = LockDepth::acquire();
        for _ in 0..1024 {
            m.alloc(256).expect("alloc");
        }
        m.collect(true).expect("collect")
    };

    // Assert
    assert!(matches!(
        outcome,
        CollectOutcome::Skipped(SkipReason::LocksHeld)
    ));
    assert_eq!(fixture.numgc(), 0);
    assert!(m.collect(true).expect("collect").is_completed());
}
