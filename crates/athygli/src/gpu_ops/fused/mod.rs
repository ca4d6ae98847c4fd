//! Fused masked-softmax attention pipelines.
//!
//! Forward runs in a single dispatch (one thread per query row); backward
//! runs in two dispatches: a query pass that also produces the
//! `delta = rowsum(dO ⊙ O)` buffer, then a key/value pass that consumes it.
//! The softmax weight matrix is never materialized on the device; it is
//! recomputed from the saved row statistics.

use std::sync::Arc;

use wgpu::{BindGroupLayout, Buffer, CommandEncoder, ComputePipeline};

use crate::gpu_ops::{GpuTensor, WgpuContext};
use crate::inputs::AttentionDims;

/// Matches the `Params` struct of the WGSL shaders.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FusedUniforms {
    batch: u32,
    heads: u32,
    seq_q: u32,
    seq_k: u32,
    head_dim: u32,
    value_dim: u32,
    has_bias: u32,
    scale: f32,
}

impl FusedUniforms {
    fn new(dims: &AttentionDims, has_bias: bool) -> Self {
        Self {
            batch: dims.batch as u32,
            heads: dims.heads as u32,
            seq_q: dims.seq_q as u32,
            seq_k: dims.seq_k as u32,
            head_dim: dims.head_dim as u32,
            value_dim: dims.value_dim as u32,
            has_bias: has_bias as u32,
            scale: dims.scale(),
        }
    }
}

const WORKGROUP_SIZE: u32 = 64;

/// GPU kernel for fused attention forward and backward.
pub struct GpuFusedAttention {
    pipeline_fwd: Arc<ComputePipeline>,
    pipeline_bwd_query: Arc<ComputePipeline>,
    pipeline_bwd_kv: Arc<ComputePipeline>,

    fwd_layout: Arc<BindGroupLayout>,
    bwd_layout: Arc<BindGroupLayout>,
    uniform_buffer: Buffer,
    context: Arc<WgpuContext>,
}

impl GpuFusedAttention {
    /// Compiles all three pipelines up front.
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let fwd_layout = create_bind_group_layout(&context.device, "Fused Attention Fwd", 4, 3);
        let bwd_layout = create_bind_group_layout(&context.device, "Fused Attention Bwd", 8, 4);

        let shader_fwd = context
            .device
            .create_shader_module(wgpu::include_wgsl!("./attention_fwd.wgsl"));
        let shader_bwd_query = context
            .device
            .create_shader_module(wgpu::include_wgsl!("./attention_bwd_query.wgsl"));
        let shader_bwd_kv = context
            .device
            .create_shader_module(wgpu::include_wgsl!("./attention_bwd_kv.wgsl"));

        let pipeline_fwd = create_pipeline(
            &context.device,
            &fwd_layout,
            &shader_fwd,
            "Fused Attention Fwd",
        );
        let pipeline_bwd_query = create_pipeline(
            &context.device,
            &bwd_layout,
            &shader_bwd_query,
            "Fused Attention Bwd Query",
        );
        let pipeline_bwd_kv = create_pipeline(
            &context.device,
            &bwd_layout,
            &shader_bwd_kv,
            "Fused Attention Bwd KV",
        );

        let uniform_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fused Attention Uniforms"),
            size: std::mem::size_of::<FusedUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            pipeline_fwd: Arc::new(pipeline_fwd),
            pipeline_bwd_query: Arc::new(pipeline_bwd_query),
            pipeline_bwd_kv: Arc::new(pipeline_bwd_kv),
            fwd_layout: Arc::new(fwd_layout),
            bwd_layout: Arc::new(bwd_layout),
            uniform_buffer,
            context: context.clone(),
        }
    }

    /// Uploads the uniform parameters for the next submission.
    pub fn write_uniforms(&self, dims: &AttentionDims, has_bias: bool) {
        let uniforms = FusedUniforms::new(dims, has_bias);
        self.context
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    /// Records the forward dispatch.
    ///
    /// Buffer order: `q, k, v, bias` read-only; `out, row_max, row_sum`
    /// written.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_forward(
        &self,
        encoder: &mut CommandEncoder,
        dims: &AttentionDims,
        q: &GpuTensor,
        k: &GpuTensor,
        v: &GpuTensor,
        bias: &GpuTensor,
        out: &GpuTensor,
        row_max: &GpuTensor,
        row_sum: &GpuTensor,
    ) {
        let buffers = [
            q.buffer(),
            k.buffer(),
            v.buffer(),
            bias.buffer(),
            out.buffer(),
            row_max.buffer(),
            row_sum.buffer(),
        ];
        let bind_group = self.bind_group(&self.fwd_layout, "Fused Attention Fwd", &buffers);

        let rows = (dims.batch * dims.heads * dims.seq_q) as u32;
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("fused attention fwd"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline_fwd);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(rows.div_ceil(WORKGROUP_SIZE), 1, 1);
    }

    /// Records both backward dispatches. The query pass writes `delta`
    /// before the key/value pass reads it; the two compute passes are
    /// ordered by the encoder.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_backward(
        &self,
        encoder: &mut CommandEncoder,
        dims: &AttentionDims,
        q: &GpuTensor,
        k: &GpuTensor,
        v: &GpuTensor,
        bias: &GpuTensor,
        out: &GpuTensor,
        grad_out: &GpuTensor,
        row_max: &GpuTensor,
        row_sum: &GpuTensor,
        delta: &GpuTensor,
        dq: &GpuTensor,
        dk: &GpuTensor,
        dv: &GpuTensor,
    ) {
        let buffers = [
            q.buffer(),
            k.buffer(),
            v.buffer(),
            bias.buffer(),
            out.buffer(),
            grad_out.buffer(),
            row_max.buffer(),
            row_sum.buffer(),
            delta.buffer(),
            dq.buffer(),
            dk.buffer(),
            dv.buffer(),
        ];
        let bind_group = self.bind_group(&self.bwd_layout, "Fused Attention Bwd", &buffers);

        let query_rows = (dims.batch * dims.heads * dims.seq_q) as u32;
        let kv_rows = (dims.batch * dims.heads * dims.seq_k) as u32;

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fused attention bwd query"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline_bwd_query);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(query_rows.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fused attention bwd kv"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline_bwd_kv);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(kv_rows.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
    }

    fn bind_group(
        &self,
        layout: &BindGroupLayout,
        label: &str,
        buffers: &[&Buffer],
    ) -> wgpu::BindGroup {
        let mut entries = Vec::with_capacity(buffers.len() + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: self.uniform_buffer.as_entire_binding(),
        });
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        self.context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &entries,
            })
    }
}

// --- Helpers ---

/// Uniforms at binding 0, `read_only` read-only storage buffers, then
/// `read_write` writable storage buffers.
fn create_bind_group_layout(
    device: &wgpu::Device,
    label: &str,
    read_only: u32,
    read_write: u32,
) -> BindGroupLayout {
    let mut entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }];
    for i in 0..(read_only + read_write) {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: i + 1,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: i < read_only,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &BindGroupLayout,
    module: &wgpu::ShaderModule,
    label: &str,
) -> ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{} Layout", label)),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}
