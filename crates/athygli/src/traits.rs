//! Backend selection types and the kernel strategy interface.

use std::fmt;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::cpu::attention::PortableSaved;
use crate::error::{AttentionError, AttentionResult};
use crate::fused::FusedSaved;
use crate::inputs::{AttentionDims, AttentionGradients, AttentionInputs};

/// Which concrete kernel executes a computation.
///
/// Chosen once per dispatcher from the capability probe; recorded in every
/// computation context so backward always runs on the backend that ran
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Fused WebGPU kernel.
    Fused,
    /// Portable CPU reference implementation.
    Portable,
}

impl Backend {
    pub fn is_fused(&self) -> bool {
        matches!(self, Backend::Fused)
    }

    pub fn is_portable(&self) -> bool {
        matches!(self, Backend::Portable)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Fused => write!(f, "fused"),
            Backend::Portable => write!(f, "portable"),
        }
    }
}

/// State a forward pass retains for its backward pass.
///
/// The portable variant keeps the normalized weight matrix on the host; the
/// fused variant keeps an opaque set of device-resident buffers. Callers
/// never construct or inspect this directly.
#[derive(Debug)]
pub enum Saved {
    Portable(PortableSaved),
    Fused(FusedSaved),
}

impl Saved {
    pub(crate) fn backend(&self) -> Backend {
        match self {
            Saved::Portable(_) => Backend::Portable,
            Saved::Fused(_) => Backend::Fused,
        }
    }
}

/// The strategy interface both kernels implement.
///
/// `forward` receives dimensions already validated by the dispatcher.
/// `backward` consumes the saved state; handing a kernel the other
/// backend's state is an `InvalidContext` error, which the dispatcher's
/// tag routing makes unreachable from safe callers.
pub trait AttentionKernel {
    fn backend(&self) -> Backend;

    fn forward(
        &self,
        inputs: &AttentionInputs,
        dims: &AttentionDims,
    ) -> AttentionResult<(Array4<f32>, Saved)>;

    fn backward(
        &self,
        saved: Saved,
        grad_output: &Array4<f32>,
    ) -> AttentionResult<AttentionGradients>;
}

pub(crate) fn wrong_saved_state(expected: Backend) -> AttentionError {
    match expected {
        Backend::Fused => {
            AttentionError::InvalidContext("saved state does not belong to the fused kernel")
        }
        Backend::Portable => {
            AttentionError::InvalidContext("saved state does not belong to the portable kernel")
        }
    }
}
