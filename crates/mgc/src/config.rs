//! Configuration Module - Collector Tuning Parameters
//!
//! The configuration is read once when a [`Runtime`](crate::Runtime) is
//! built and cached for the lifetime of the collector. Environment
//! overrides use the `MGC_` prefix:
//!
//! | Variable        | Field        | Notes                               |
//! |-----------------|--------------|-------------------------------------|
//! | `MGC_GCPERCENT` | `gc_percent` | integer, or `off` to disable        |
//! | `MGC_TRACE`     | `trace`      | 0 = quiet, 1 = summary, 2 = doubled |
//! | `MGC_THREADS`   | `gc_threads` | upper bound on collector workers    |
//! | `MGC_DEBUGMARK` | `debug_mark` | `1` enables the verification pass   |

use thiserror::Error;

/// Kilobyte
pub const KB: usize = 1024;
/// Megabyte
pub const MB: usize = 1024 * KB;
/// Gigabyte
pub const GB: usize = 1024 * MB;

/// Hard upper bound on workers participating in one cycle.
pub const MAX_GC_PROCS: usize = 8;

/// Main configuration for the collector
///
/// # Examples
///
/// ```rust
/// use mgc::GcConfig;
///
/// let config = GcConfig {
///     gc_percent: 50,
///     gc_threads: Some(2),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Heap growth allowed between cycles, in percent of the live heap
    ///
    /// After a cycle the next trigger is
    /// `heap_alloc + heap_alloc * gc_percent / 100`.
    /// A negative value disables collection entirely.
    ///
    /// Default: 100
    pub gc_percent: i32,

    /// Trace verbosity
    ///
    /// `1` logs a summary line per cycle, `2` additionally runs a second
    /// forced cycle after every triggered one.
    ///
    /// Default: 0
    pub trace: u32,

    /// Upper bound on collector workers
    ///
    /// If None, uses the available parallelism. Always clamped to
    /// [`MAX_GC_PROCS`].
    ///
    /// Default: Auto-detect
    pub gc_threads: Option<usize>,

    /// Run every cycle on the initiating thread only
    ///
    /// Default: false
    pub deterministic: bool,

    /// Bytes of address space reserved for the heap arena
    ///
    /// The mark bitmap (`arena_size / 16` bytes on 64-bit) is reserved in
    /// front of it.
    ///
    /// Default: 256MB
    pub arena_size: usize,

    /// Allocation volume that triggers the first cycle
    ///
    /// Default: 4MB
    pub initial_trigger: usize,

    /// Minimum objects a worker keeps before it donates half its buffer
    ///
    /// Default: 4
    pub handoff_min: usize,

    /// Run the single-threaded mark verification pass after marking
    ///
    /// Expensive. While enabled, the Special bit is borrowed as a second
    /// mark bit and every unreachable block is routed through finalizer
    /// handling.
    ///
    /// Default: false
    pub debug_mark: bool,

    /// Allow the finalizer runner thread to be started
    ///
    /// When false, queued finalizers stay pending until
    /// [`Runtime::run_finalizers`](crate::Runtime::run_finalizers) drains
    /// them on the calling thread.
    ///
    /// Default: true
    pub finalizers: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_percent: 100,
            trace: 0,
            gc_threads: None,
            deterministic: false,
            arena_size: 256 * MB,
            initial_trigger: 4 * MB,
            handoff_min: 4,
            debug_mark: false,
            finalizers: true,
        }
    }
}

impl GcConfig {
    /// Small arena and a fixed worker count, used by tests and benches
    pub fn for_testing() -> Self {
        Self {
            arena_size: 64 * MB,
            gc_threads: Some(2),
            ..Default::default()
        }
    }

    /// Validate configuration
    ///
    /// # Returns
    /// `Ok(())` if valid, `Err(ConfigError)` with the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = crate::heap::PAGE_SIZE;
        if self.arena_size < 16 * page {
            return Err(ConfigError::ArenaTooSmall {
                size: self.arena_size,
                min: 16 * page,
            });
        }
        if self.arena_size % page != 0 {
            return Err(ConfigError::Unaligned {
                field: "arena_size",
                value: self.arena_size,
                align: page,
            });
        }
        if self.initial_trigger == 0 {
            return Err(ConfigError::InvalidValue {
                field: "initial_trigger",
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(threads) = self.gc_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "gc_threads",
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.handoff_min >= crate::marker::workbuf::WORKBUF_CAPACITY / 2 {
            return Err(ConfigError::InvalidValue {
                field: "handoff_min",
                reason: format!(
                    "must be below half a work buffer ({})",
                    crate::marker::workbuf::WORKBUF_CAPACITY / 2
                ),
            });
        }
        Ok(())
    }

    /// Defaults overridden by `MGC_*` environment variables
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("MGC_GCPERCENT") {
            match parse_gc_percent(&value) {
                Some(percent) => config.gc_percent = percent,
                None => log::warn!("ignoring MGC_GCPERCENT={:?}", value),
            }
        }
        if let Ok(value) = std::env::var("MGC_TRACE") {
            match value.trim().parse() {
                Ok(level) => config.trace = level,
                Err(_) => log::warn!("ignoring MGC_TRACE={:?}", value),
            }
        }
        if let Ok(value) = std::env::var("MGC_THREADS") {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.gc_threads = Some(n),
                _ => log::warn!("ignoring MGC_THREADS={:?}", value),
            }
        }
        if let Ok(value) = std::env::var("MGC_DEBUGMARK") {
            config.debug_mark = value.trim() == "1";
        }

        config
    }

    /// Collection is disabled by a negative percentage
    pub fn collection_enabled(&self) -> bool {
        self.gc_percent >= 0
    }

    /// Number of workers a cycle may use on this machine
    pub fn worker_limit(&self) -> usize {
        if self.deterministic {
            return 1;
        }
        let cpus = num_cpus::get().max(1);
        self.gc_threads
            .unwrap_or(cpus)
            .min(cpus)
            .clamp(1, MAX_GC_PROCS)
    }
}

/// `off` disables collection; anything else must be an integer.
fn parse_gc_percent(value: &str) -> Option<i32> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") {
        return Some(-1);
    }
    value.parse().ok()
}

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("arena size {size} is below the minimum of {min} bytes")]
    ArenaTooSmall { size: usize, min: usize },

    #[error("{field} = {value} is not a multiple of {align}")]
    Unaligned {
        field: &'static str,
        value: usize,
        align: usize,
    },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
