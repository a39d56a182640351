//! Error types for marking and pacing.
//!
//! Invariant violations (marking a forwarded object, scanning an unmarked one,
//! out-of-range chunks) are not represented here: they are programming defects
//! and panic in debug builds.

use thiserror::Error;

/// Errors surfaced by the marking engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarkError {
    /// The shared overflow store is full and the configured policy does not
    /// allow it to grow. Marking cannot continue without dropping work.
    #[error("mark queue exhausted: overflow store is full ({capacity} tasks)")]
    QueueExhausted {
        /// Capacity of the overflow store at the time of the failed push.
        capacity: usize,
    },

    /// A configuration value was rejected.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The array-marking stride must be non-zero.
    #[error("array marking stride must be non-zero")]
    ZeroStride,

    /// At least one marking worker is required.
    #[error("marking needs at least one worker")]
    NoWorkers,

    /// The local queue capacity must be a power of two of at least 2.
    #[error("local queue capacity must be a power of two >= 2, got {0}")]
    BadQueueCapacity(usize),

    /// A bounded overflow policy was given zero capacity.
    #[error("bounded overflow store needs a non-zero capacity")]
    ZeroOverflowCapacity,

    /// Live-data counters need a flush threshold of at least one word.
    #[error("live data flush threshold must be non-zero")]
    ZeroFlushThreshold,

    /// A percentage knob was outside `0..=100`.
    #[error("{name} must be within 0..=100, got {value}")]
    BadPercent {
        /// Name of the offending knob.
        name: &'static str,
        /// Rejected value.
        value: usize,
    },

    /// The pacing surcharge must be a finite multiplier of at least 1.
    #[error("pacing surcharge must be finite and >= 1.0, got {0}")]
    BadSurcharge(f64),

    /// The progress history needs at least one sample.
    #[error("pacing history length must be non-zero")]
    ZeroHistory,
}

/// Result alias used throughout the marking code.
pub type MarkResult<T> = Result<T, MarkError>;
