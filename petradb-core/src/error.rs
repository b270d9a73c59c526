// src/error.rs
// Crate-wide error type and Result alias

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PetraError>;

/// Errors surfaced by the index scanning core.
///
/// Bound and plan errors are deterministic and never retried; an interrupted
/// operation must be resubmitted as a fresh query. Stale cursor positions are
/// not errors at all - they are repaired transparently by `check_location`.
#[derive(Debug, Error)]
pub enum PetraError {
    /// Intersecting the constraints on one field produced an empty interval
    /// (e.g. `field = 1` combined with `field >= 2`).
    #[error("unsatisfiable bounds on field '{0}'")]
    UnsatisfiableBound(String),

    /// A query plan was requested against an empty key pattern.
    #[error("empty key pattern")]
    EmptyKeyPattern,

    /// The running operation was asked to stop via its cancellation token.
    #[error("operation interrupted")]
    Interrupted,

    /// Index structure misuse (bad bucket handle, malformed entry).
    #[error("index error: {0}")]
    IndexError(String),
}
