//! Boundary adapter around the fused GPU attention kernel.
//!
//! Presents the same synchronous forward/backward contract as the portable
//! kernel: upload, dispatch, read back. Only constructed after the
//! capability probe has produced a device; any failure past that point
//! surfaces as `KernelRuntime` and is never recovered by switching backends
//! mid-computation.

use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array3, Array4};

use crate::error::{AttentionError, AttentionResult};
use crate::gpu_ops::fused::GpuFusedAttention;
use crate::gpu_ops::{GpuTensor, WgpuContext};
use crate::inputs::{AttentionDims, AttentionGradients, AttentionInputs};
use crate::traits::{wrong_saved_state, AttentionKernel, Backend, Saved};

/// WGSL assumes no infinities, so masked (`-inf`) bias entries travel to the
/// device as this finite sentinel. The forward shader treats rows whose
/// maximum stays below -1e30 as fully masked.
const MASK_SENTINEL: f32 = -3.0e38;

/// Device-resident state retained between forward and backward: the opaque
/// handle of the fused path.
#[derive(Debug)]
pub struct FusedSaved {
    pub(crate) query: GpuTensor,
    pub(crate) key: GpuTensor,
    pub(crate) value: GpuTensor,
    pub(crate) bias: GpuTensor,
    pub(crate) has_bias: bool,
    pub(crate) output: GpuTensor,
    pub(crate) row_max: GpuTensor,
    pub(crate) row_sum: GpuTensor,
    pub(crate) dims: AttentionDims,
}

/// The fused accelerator backend.
pub struct FusedAttentionKernel {
    context: Arc<WgpuContext>,
    op: GpuFusedAttention,
}

impl FusedAttentionKernel {
    pub fn new(context: Arc<WgpuContext>) -> Self {
        let op = GpuFusedAttention::new(&context);
        Self { context, op }
    }

    fn forward_impl(
        &self,
        inputs: &AttentionInputs,
        dims: &AttentionDims,
    ) -> Result<(Array4<f32>, FusedSaved)> {
        let query = GpuTensor::from_ndarray(&self.context, &inputs.query)?;
        let key = GpuTensor::from_ndarray(&self.context, &inputs.key)?;
        let value = GpuTensor::from_ndarray(&self.context, &inputs.value)?;

        let has_bias = inputs.bias.is_some();
        let bias = match &inputs.bias {
            Some(bias) => {
                let full = bias
                    .broadcast(dims.score_shape())
                    .expect("bias broadcast checked at validation")
                    .mapv(|x| if x == f32::NEG_INFINITY { MASK_SENTINEL } else { x });
                GpuTensor::from_ndarray(&self.context, &full)?
            }
            None => GpuTensor::from_ndarray(&self.context, &Array3::<f32>::zeros((1, 1, 1)))?,
        };

        let (b, h, sq, dv) = dims.output_shape();
        let output = GpuTensor::zeros(&self.context, vec![b, h, sq, dv], "attention output");
        let row_max = GpuTensor::zeros(&self.context, vec![b, h, sq], "attention row max");
        let row_sum = GpuTensor::zeros(&self.context, vec![b, h, sq], "attention row sum");

        self.op.write_uniforms(dims, has_bias);
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fused attention fwd"),
            });
        self.op.encode_forward(
            &mut encoder,
            dims,
            &query,
            &key,
            &value,
            &bias,
            &output,
            &row_max,
            &row_sum,
        );
        self.context.queue.submit(Some(encoder.finish()));

        let host_output = pollster::block_on(output.to_ndarray_4d())?;

        let saved = FusedSaved {
            query,
            key,
            value,
            bias,
            has_bias,
            output,
            row_max,
            row_sum,
            dims: *dims,
        };
        Ok((host_output, saved))
    }

    fn backward_impl(
        &self,
        saved: &FusedSaved,
        grad_output: &Array4<f32>,
    ) -> Result<AttentionGradients> {
        let dims = &saved.dims;
        let grad_out = GpuTensor::from_ndarray(&self.context, grad_output)?;

        let delta = GpuTensor::zeros(
            &self.context,
            vec![dims.batch, dims.heads, dims.seq_q],
            "attention delta",
        );
        let dq = GpuTensor::zeros(&self.context, saved.query.shape().to_vec(), "grad query");
        let dk = GpuTensor::zeros(&self.context, saved.key.shape().to_vec(), "grad key");
        let dv = GpuTensor::zeros(&self.context, saved.value.shape().to_vec(), "grad value");

        self.op.write_uniforms(dims, saved.has_bias);
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fused attention bwd"),
            });
        self.op.encode_backward(
            &mut encoder,
            dims,
            &saved.query,
            &saved.key,
            &saved.value,
            &saved.bias,
            &saved.output,
            &grad_out,
            &saved.row_max,
            &saved.row_sum,
            &delta,
            &dq,
            &dk,
            &dv,
        );
        self.context.queue.submit(Some(encoder.finish()));

        let query = pollster::block_on(dq.to_ndarray_4d())?;
        let key = pollster::block_on(dk.to_ndarray_4d())?;
        let value = pollster::block_on(dv.to_ndarray_4d())?;

        Ok(AttentionGradients { query, key, value })
    }
}

impl AttentionKernel for FusedAttentionKernel {
    fn backend(&self) -> Backend {
        Backend::Fused
    }

    fn forward(
        &self,
        inputs: &AttentionInputs,
        dims: &AttentionDims,
    ) -> AttentionResult<(Array4<f32>, Saved)> {
        let (output, saved) = self
            .forward_impl(inputs, dims)
            .map_err(AttentionError::KernelRuntime)?;
        Ok((output, Saved::Fused(saved)))
    }

    fn backward(
        &self,
        saved: Saved,
        grad_output: &Array4<f32>,
    ) -> AttentionResult<AttentionGradients> {
        match saved {
            Saved::Fused(saved) => self
                .backward_impl(&saved, grad_output)
                .map_err(AttentionError::KernelRuntime),
            Saved::Portable(_) => Err(wrong_saved_state(Backend::Fused)),
        }
    }
}
