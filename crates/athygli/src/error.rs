//! Common error types for athygli.

use thiserror::Error;

/// Errors surfaced by the attention dispatch layer.
///
/// Capability-probe failures are deliberately absent: they are recovered
/// internally by degrading to the portable backend and are never returned
/// to the caller.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Input tensors violate the dimensional contract. Raised at forward
    /// entry before any kernel is invoked.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// A computation context was reused, produced by a different dispatcher,
    /// or otherwise not in the state backward requires. Programmer error.
    #[error("invalid computation context: {0}")]
    InvalidContext(&'static str),

    /// A selected backend failed during execution. Propagated unmodified;
    /// never triggers a switch to the other backend mid-computation.
    #[error("attention kernel execution failed: {0}")]
    KernelRuntime(#[source] anyhow::Error),

    /// The fused backend was requested explicitly but no usable device exists.
    #[error("fused attention kernel is not available on this host")]
    FusedUnavailable,
}

/// Result type for athygli operations.
pub type AttentionResult<T> = Result<T, AttentionError>;
