//! Failure modes surfaced at the public API boundary.
//!
//! The hot per-frame solve loop stays allocation- and branch-minimal;
//! recoverable failures are reported where the caller can act on them:
//! when registering tires, building collision geometry, or allocating
//! from the memory pool.

use thiserror::Error;

/// Errors reported by the solver's public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// A fixed-capacity bound of the solver was reached.
    ///
    /// The per-vehicle row and body arrays are statically sized; adding more
    /// tires than the solver supports is rejected instead of growing storage.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// The input geometry does not span enough dimensions for the requested
    /// operation, e.g. a convex hull over fewer than 4 affinely independent
    /// points.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),

    /// The constraint system cannot be solved reliably, e.g. a chassis with
    /// zero mass or a non-dynamic chassis body.
    #[error("ill-conditioned system: {0}")]
    IllConditionedSystem(&'static str),

    /// A handle did not resolve to a live object.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// The underlying system allocator failed to provide memory.
    #[error("out of memory: allocation of {0} bytes failed")]
    OutOfMemory(usize),
}
