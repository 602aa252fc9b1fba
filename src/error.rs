//! Error types of the heap and the fatal-error path.
//!
//! Allocation failures are never reported through these types: hot paths return a null pointer
//! and let the caller escalate (TLAB -> belt -> collection). What remains are construction
//! errors, which are ordinary `Result`s, and broken invariants, which abort the process.

use std::fmt;

use backtrace::Backtrace;
use thiserror::Error;

/// Configuration values that cannot be used to build a heap.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heap size {size} is below the minimum of {min} bytes")]
    HeapTooSmall { size: usize, min: usize },
    #[error("incompatible minimum and maximum heap sizes specified (initial {initial}, max {max})")]
    IncompatibleHeapSizes { initial: usize, max: usize },
    #[error("TLAB size {size} must be word aligned and at least {min} bytes")]
    BadTlabSize { size: usize, min: usize },
    #[error("TLAB refill threshold of {0}% is not a percentage")]
    BadRefillThreshold(usize),
    #[error("immortal region must not be empty")]
    EmptyImmortalRegion,
    #[error("belt frame percentages add up to {0}%")]
    BadBeltLayout(usize),
}

/// Errors raised while constructing a heap.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not reserve {size} bytes of virtual memory: {source}")]
    Reservation {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("could not start {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for heap construction.
pub type HeapResult<T> = Result<T, HeapError>;

/// Reports a broken heap invariant and terminates the process.
///
/// No unwinding is attempted: once an invariant of the allocator is broken no further heap
/// operation is safe, including the destructors that unwinding would run.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal heap error: {}", args);
    eprintln!("fatal heap error: {}", args);
    eprintln!("{:?}", Backtrace::new());
    std::process::abort();
}
