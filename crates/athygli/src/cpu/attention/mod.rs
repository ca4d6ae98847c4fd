//! Portable softmax-attention kernel: reference forward and backward.
//!
//! Runs on any host. The fused GPU kernel must agree with this
//! implementation to single-precision tolerance on both passes.

use ndarray::{Array4, Axis};

use crate::activations::softmax_4d_inplace;
use crate::error::AttentionResult;
use crate::inputs::{AttentionDims, AttentionGradients, AttentionInputs};
use crate::traits::{wrong_saved_state, AttentionKernel, Backend, Saved};
use crate::utils::linear_algebra::{matmul_4d, transpose_last_two};

/// Intermediates the portable backward pass needs.
#[derive(Debug)]
pub struct PortableSaved {
    pub(crate) weights: Array4<f32>,
    pub(crate) query: Array4<f32>,
    pub(crate) key: Array4<f32>,
    pub(crate) value: Array4<f32>,
    pub(crate) scale: f32,
}

/// Reference implementation using generic tensor arithmetic.
#[derive(Debug, Default)]
pub struct PortableAttentionKernel;

impl PortableAttentionKernel {
    pub fn new() -> Self {
        Self
    }

    /// `W = softmax(scale * Q Kᵗ + bias)`, `O = W V`.
    ///
    /// Softmax subtracts the row maximum before exponentiating; rows whose
    /// logits are all `-inf` come out as zero weight rows, so fully masked
    /// queries produce zero output instead of NaN.
    pub(crate) fn forward_impl(
        &self,
        inputs: &AttentionInputs,
        dims: &AttentionDims,
    ) -> (Array4<f32>, PortableSaved) {
        let scale = dims.scale();

        let kt = transpose_last_two(&inputs.key);
        let mut logits = matmul_4d(&inputs.query, &kt);
        logits *= scale;

        if let Some(bias) = &inputs.bias {
            let broadcast = bias
                .broadcast(dims.score_shape())
                .expect("bias broadcast checked at validation");
            logits += &broadcast;
        }

        softmax_4d_inplace(&mut logits);
        let weights = logits;

        let output = matmul_4d(&weights, &inputs.value);

        let saved = PortableSaved {
            weights,
            query: inputs.query.clone(),
            key: inputs.key.clone(),
            value: inputs.value.clone(),
            scale,
        };
        (output, saved)
    }

    /// Softmax-Jacobian backward:
    ///
    /// ```text
    /// dV = Wᵗ dO
    /// dW = dO Vᵗ
    /// dL = W ⊙ (dW − rowsum(dW ⊙ W))
    /// dQ = scale · dL K
    /// dK = scale · dLᵗ Q
    /// ```
    ///
    /// A fully masked row has `W = 0`, so `dL` and every gradient
    /// contribution from that row are exactly zero.
    pub(crate) fn backward_impl(
        &self,
        saved: &PortableSaved,
        grad_output: &Array4<f32>,
    ) -> AttentionGradients {
        let wt = transpose_last_two(&saved.weights);
        let grad_value = matmul_4d(&wt, grad_output);

        let vt = transpose_last_two(&saved.value);
        let grad_weights = matmul_4d(grad_output, &vt);

        let inner = (&grad_weights * &saved.weights)
            .sum_axis(Axis(3))
            .insert_axis(Axis(3));
        let grad_logits = &saved.weights * &(&grad_weights - &inner);

        let mut grad_query = matmul_4d(&grad_logits, &saved.key);
        grad_query *= saved.scale;

        let dlt = transpose_last_two(&grad_logits);
        let mut grad_key = matmul_4d(&dlt, &saved.query);
        grad_key *= saved.scale;

        AttentionGradients {
            query: grad_query,
            key: grad_key,
            value: grad_value,
        }
    }
}

impl AttentionKernel for PortableAttentionKernel {
    fn backend(&self) -> Backend {
        Backend::Portable
    }

    fn forward(
        &self,
        inputs: &AttentionInputs,
        dims: &AttentionDims,
    ) -> AttentionResult<(Array4<f32>, Saved)> {
        let (output, saved) = self.forward_impl(inputs, dims);
        Ok((output, Saved::Portable(saved)))
    }

    fn backward(
        &self,
        saved: Saved,
        grad_output: &Array4<f32>,
    ) -> AttentionResult<AttentionGradients> {
        match saved {
            Saved::Portable(saved) => Ok(self.backward_impl(&saved, grad_output)),
            Saved::Fused(_) => Err(wrong_saved_state(Backend::Portable)),
        }
    }
}
