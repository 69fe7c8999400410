//! Error Module - MGC Error Types
//!
//! Two kinds of failure exist in the collector:
//!
//! ## Recoverable errors
//! Returned as [`GcError`] through [`Result`]: allocation failure, invalid
//! arguments to the registration entry points, configuration problems.
//!
//! ## Fatal errors
//! Internal invariant violations (a running context found while the world
//! is stopped, a stack pointer outside its segment, a bitmap access outside
//! the arena, ...). These abort the process path through [`throw`] or the
//! [`fatal!`](crate::fatal) macro; they are never returned.

use thiserror::Error;

/// Main error type for MGC operations
///
/// # Examples
///
/// ```rust
/// use mgc::error::GcError;
///
/// fn handle_error(err: GcError) {
///     match err {
///         GcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         _ => eprintln!("Other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum GcError {
    /// Out of memory - arena exhausted
    ///
    /// **When returned:** Allocation request needs more pages than remain in
    /// the reserved arena and no free span of the right size exists.
    ///
    /// **Recovery strategy:** Collect, drop references, retry
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Heap initialization failed
    ///
    /// **When returned:** Arena reservation or page geometry check fails
    ///
    /// **Recovery strategy:** Cannot recover - terminate gracefully
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Address does not name the start of an allocated block
    ///
    /// **When returned:** Finalizer or profiling registration with an
    /// interior pointer, a pointer outside the arena or a freed block
    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    /// A finalizer is already registered for this object
    #[error("Finalizer already set for object {address:#x}")]
    FinalizerAlreadySet { address: usize },

    /// Configuration error
    ///
    /// **When returned:** `GcConfig::validate` rejects a value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A collector helper or finalizer thread died
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    /// Invalid state
    ///
    /// **When returned:** Operation attempted in the wrong collector state,
    /// for example allocating after the runtime was shut down
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl GcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. }
                | GcError::InvalidPointer { .. }
                | GcError::FinalizerAlreadySet { .. }
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            GcError::InvalidState { .. } | GcError::WorkerPanicked(_)
        )
    }
}

impl From<crate::config::ConfigError> for GcError {
    fn from(err: crate::config::ConfigError) -> Self {
        GcError::Configuration(err.to_string())
    }
}

/// Result type alias for MGC operations
pub type Result<T> = std::result::Result<T, GcError>;

/// Abort on an internal invariant violation.
///
/// Logs the message and panics with a `fatal error:` prefix. A collector
/// whose cycle unwinds through this marks itself failing and drops every
/// later collection request.
#[cold]
#[inline(never)]
pub fn throw(msg: &str) -> ! {
    log::error!("fatal error: {}", msg);
    panic!("fatal error: {}", msg);
}

/// Abort with a formatted fatal error message
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::throw(&format!($($arg)*))
    };
}

/// Assert an internal invariant, aborting through [`throw`] when it fails
#[macro_export]
macro_rules! assert_context {
    ($cond:expr, $context:expr) => {
        if !$cond {
            $crate::error::throw($context);
        }
    };
    ($cond:expr, $context:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::error::throw(&format!($context, $($arg)*));
        }
    };
}
