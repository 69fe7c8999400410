//! GC Logging and Tracing
//!
//! Structured events for collector activity, emitted through the `log`
//! facade under the `mgc` target. The crate never installs a logger; the
//! embedding application decides where events go.
//!
//! Log Levels:
//! - WARN: debug-mark discrepancies
//! - INFO: per-cycle trace lines (when `trace > 0`)
//! - DEBUG: cycle start/end, phases, finalizer and scavenger activity

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Target all collector events are logged under
pub const LOG_TARGET: &str = "mgc";

/// Collector phase reported by [`GcEvent::PhaseEnd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcPhase {
    Mark,
    Sweep,
}

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// Cycle started; the world is stopped
    CycleStart {
        cycle: u32,
        forced: bool,
        nproc: usize,
        heap_alloc: usize,
    },

    /// Phase completed
    PhaseEnd {
        cycle: u32,
        phase: GcPhase,
        duration_ms: f64,
    },

    /// Cycle completed; the world is about to restart
    CycleEnd {
        cycle: u32,
        pause_ms: f64,
        freed_bytes: u64,
        heap_alloc: usize,
        next_gc: usize,
    },

    /// Unreachable objects kept alive for their finalizers
    FinalizersQueued { cycle: u32, count: u64 },

    /// Reachable blocks the parallel mark missed
    DebugMarkDiscrepancy { cycle: u32, missed: u64 },

    /// Idle span memory returned to the OS
    Scavenge { released_bytes: usize },
}

impl GcEvent {
    /// Level the event is emitted at
    pub fn level(&self) -> log::Level {
        match self {
            GcEvent::DebugMarkDiscrepancy { .. } => log::Level::Warn,
            _ => log::Level::Debug,
        }
    }

    /// Human-readable form
    pub fn human(&self) -> String {
        match self {
            GcEvent::CycleStart {
                cycle,
                forced,
                nproc,
                heap_alloc,
            } => format!(
                "[GC] Cycle {} started ({} workers, {} bytes allocated{})",
                cycle,
                nproc,
                heap_alloc,
                if *forced { ", forced" } else { "" }
            ),
            GcEvent::PhaseEnd {
                cycle,
                phase,
                duration_ms,
            } => format!(
                "[GC] Cycle {}: {:?} phase completed ({:.2}ms)",
                cycle, phase, duration_ms
            ),
            GcEvent::CycleEnd {
                cycle,
                pause_ms,
                freed_bytes,
                heap_alloc,
                next_gc,
            } => format!(
                "[GC] Cycle {} completed ({:.2}ms, freed {} bytes, heap {} bytes, next at {})",
                cycle, pause_ms, freed_bytes, heap_alloc, next_gc
            ),
            GcEvent::FinalizersQueued { cycle, count } => {
                format!("[GC] Cycle {}: {} finalizers queued", cycle, count)
            }
            GcEvent::DebugMarkDiscrepancy { cycle, missed } => format!(
                "[GC] Cycle {}: debug mark found {} unmarked reachable blocks",
                cycle, missed
            ),
            GcEvent::Scavenge { released_bytes } => {
                format!("[GC] Scavenger released {} bytes", released_bytes)
            }
        }
    }

    /// JSON form
    pub fn json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => format!("{{\"type\":\"encode_error\",\"error\":{:?}}}", e.to_string()),
        }
    }
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Most verbose level emitted
    pub level: log::Level,

    /// Emit JSON instead of human-readable lines
    pub json: bool,

    /// Events kept for [`GcLogger::recent_events`]
    pub history: usize,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: log::Level::Trace,
            json: false,
            history: 64,
        }
    }
}

/// GC Logger - centralized logging for collector events
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<VecDeque<(DateTime<Utc>, GcEvent)>>,
    enabled: AtomicBool,
}

impl GcLogger {
    /// Create new GC logger
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.history)),
            config,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }
        let level = event.level();
        if level > self.config.level {
            return;
        }

        if log::log_enabled!(target: LOG_TARGET, level) {
            let line = if self.config.json {
                event.json()
            } else {
                event.human()
            };
            log::log!(target: LOG_TARGET, level, "{}", line);
        }

        if self.config.history > 0 {
            let mut events = self.events.lock();
            if events.len() == self.config.history {
                events.pop_front();
            }
            events.push_back((Utc::now(), event));
        }
    }

    /// Most recent events, oldest first
    pub fn recent_events(&self) -> Vec<GcEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Drop the event history
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}
