//! Backend selection and forward/backward routing.
//!
//! A dispatcher picks its backend once, at construction, from the
//! capability probe. Every forward call stamps the context it returns with
//! the backend that produced it; backward routes on that stamp, never on
//! the probe or the dispatcher's current state, so a forward/backward pair
//! can never straddle two kernels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::Array4;

use crate::cpu::attention::PortableAttentionKernel;
use crate::error::{AttentionError, AttentionResult};
use crate::fused::FusedAttentionKernel;
use crate::gpu_ops::WgpuContext;
use crate::inputs::{AttentionDims, AttentionGradients, AttentionInputs};
use crate::probe::{self, CapabilityProbe};
use crate::traits::{AttentionKernel, Backend, Saved};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Links one forward computation to its backward computation.
///
/// Created by [`AttentionDispatcher::forward`], consumed by
/// [`AttentionDispatcher::backward`]. The only legal lifecycle is
/// Created → Consumed; a second backward, or a backward through a different
/// dispatcher, fails with `InvalidContext`.
#[derive(Debug)]
pub struct AttentionContext {
    backend: Backend,
    dispatcher: u64,
    dims: AttentionDims,
    saved: Option<Saved>,
}

impl AttentionContext {
    /// The backend that ran the forward pass and will run backward.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// True once backward has consumed this context.
    pub fn is_consumed(&self) -> bool {
        self.saved.is_none()
    }
}

/// Public entry point of the attention dispatch layer.
pub struct AttentionDispatcher {
    id: u64,
    backend: Backend,
    portable: PortableAttentionKernel,
    fused: Option<FusedAttentionKernel>,
}

impl AttentionDispatcher {
    /// Selects the backend from the process-wide capability probe.
    pub fn new() -> Self {
        Self::with_probe(probe::global())
    }

    /// Selects the backend from a caller-supplied probe. Intended for tests
    /// that need probe state independent of the process-wide one.
    pub fn with_probe(probe: &CapabilityProbe) -> Self {
        match probe.context() {
            Some(context) => Self::from_fused(FusedAttentionKernel::new(context)),
            None => Self::portable(),
        }
    }

    /// Forces the portable backend, bypassing the probe.
    pub fn portable() -> Self {
        Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            backend: Backend::Portable,
            portable: PortableAttentionKernel::new(),
            fused: None,
        }
    }

    /// Forces the fused backend on the process-wide probe's device,
    /// bypassing the probe's fallback: errors instead of degrading when no
    /// device is usable.
    pub fn fused() -> AttentionResult<Self> {
        match probe::global().context() {
            Some(context) => Ok(Self::from_fused(FusedAttentionKernel::new(context))),
            None => Err(AttentionError::FusedUnavailable),
        }
    }

    /// Forces the fused backend on an explicit device context, with no
    /// probe involved at all.
    pub fn with_context(context: Arc<WgpuContext>) -> Self {
        Self::from_fused(FusedAttentionKernel::new(context))
    }

    fn from_fused(fused: FusedAttentionKernel) -> Self {
        Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            backend: Backend::Fused,
            portable: PortableAttentionKernel::new(),
            fused: Some(fused),
        }
    }

    /// The backend this dispatcher stamps on new computations.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Validates the inputs, runs the selected kernel's forward pass and
    /// returns the output together with the context backward will need.
    pub fn forward(
        &self,
        inputs: &AttentionInputs,
    ) -> AttentionResult<(Array4<f32>, AttentionContext)> {
        let dims = inputs.validate()?;
        let kernel = self.kernel_for(self.backend)?;
        let (output, saved) = kernel.forward(inputs, &dims)?;

        let context = AttentionContext {
            backend: self.backend,
            dispatcher: self.id,
            dims,
            saved: Some(saved),
        };
        Ok((output, context))
    }

    /// Runs the backward pass on the backend recorded in `context` at
    /// forward time. Consumes the context's saved state.
    pub fn backward(
        &self,
        context: &mut AttentionContext,
        grad_output: &Array4<f32>,
    ) -> AttentionResult<AttentionGradients> {
        if context.dispatcher != self.id {
            return Err(AttentionError::InvalidContext(
                "context was produced by a different dispatcher",
            ));
        }
        if context.is_consumed() {
            return Err(AttentionError::InvalidContext(
                "context was already consumed by a previous backward call",
            ));
        }

        let expected = context.dims.output_shape();
        if grad_output.dim() != expected {
            return Err(AttentionError::ShapeMismatch {
                expected: format!("grad_output shape {:?}", expected),
                got: format!("{:?}", grad_output.shape()),
            });
        }

        // Route by the backend recorded at forward time, not self.backend:
        // the pairing must hold even if the two could ever disagree.
        let kernel = self.kernel_for(context.backend)?;
        let saved = context
            .saved
            .take()
            .expect("checked non-consumed above");
        kernel.backward(saved, grad_output)
    }

    fn kernel_for(&self, backend: Backend) -> AttentionResult<&dyn AttentionKernel> {
        match backend {
            Backend::Portable => Ok(&self.portable),
            Backend::Fused => self
                .fused
                .as_ref()
                .map(|k| k as &dyn AttentionKernel)
                .ok_or(AttentionError::InvalidContext(
                    "context records the fused backend but this dispatcher has no fused kernel",
                )),
        }
    }
}

impl Default for AttentionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
