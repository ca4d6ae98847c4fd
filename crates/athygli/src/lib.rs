//! Capability-aware attention kernel dispatch.
//!
//! This crate decides, once per process, whether a fused GPU attention
//! kernel is usable and otherwise substitutes a portable CPU implementation
//! that is mathematically equivalent for both the forward evaluation and
//! the gradient computation. Callers see one synchronous API and cannot
//! tell the backends apart except through the [`Backend`] tag and speed.
//!
//! ```no_run
//! use athygli::{AttentionDispatcher, AttentionInputs};
//! use ndarray::Array4;
//!
//! let dispatcher = AttentionDispatcher::new();
//! let inputs = AttentionInputs::new(
//!     Array4::zeros((1, 4, 8, 16)), // queries  [batch, heads, seq_q, dim]
//!     Array4::zeros((1, 4, 8, 16)), // keys     [batch, heads, seq_k, dim]
//!     Array4::zeros((1, 4, 8, 16)), // values   [batch, heads, seq_k, dim_v]
//! );
//!
//! let (output, mut context) = dispatcher.forward(&inputs)?;
//! let grad_output = Array4::ones(output.dim());
//! let grads = dispatcher.backward(&mut context, &grad_output)?;
//! # Ok::<(), athygli::AttentionError>(())
//! ```

pub mod activations;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod fused;
pub mod gpu_ops;
pub mod inputs;
pub mod probe;
pub mod traits;
pub mod utils;

pub use crate::{
    cpu::attention::PortableAttentionKernel,
    dispatch::{AttentionContext, AttentionDispatcher},
    error::{AttentionError, AttentionResult},
    fused::FusedAttentionKernel,
    inputs::{AttentionDims, AttentionGradients, AttentionInputs},
    probe::CapabilityProbe,
    traits::{AttentionKernel, Backend},
};
pub use gpu_ops::context::WgpuContext;
