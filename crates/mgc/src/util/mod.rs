//! Util Module - Shared Utilities

pub mod alignment;
pub mod backoff;

pub use alignment::Alignment;
pub use backoff::{Backoff, BackoffStats};

/// Size of a machine word in bytes
pub const WORD: usize = std::mem::size_of::<usize>();

/// Nanoseconds since the first call in this process.
///
/// Never returns 0, so 0 can mean "unset" in timestamp fields.
pub fn nanotime() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64 + 1
}
