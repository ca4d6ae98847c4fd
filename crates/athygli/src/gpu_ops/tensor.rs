use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{Array, Array4, Dimension};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::gpu_ops::WgpuContext;

/// A GPU-backed f32 tensor: a storage buffer plus its logical shape.
///
/// Cheap to clone; the underlying buffer is reference counted.
#[derive(Clone, Debug)]
pub struct GpuTensor {
    buffer: Arc<Buffer>,
    shape: Vec<usize>,
    context: Arc<WgpuContext>,
}

impl GpuTensor {
    /// Uploads a host tensor. The data is made contiguous before copying.
    pub fn from_ndarray<D: Dimension>(
        context: &Arc<WgpuContext>,
        arr: &Array<f32, D>,
    ) -> Result<Self> {
        let data = arr.as_standard_layout();
        let slice = data
            .as_slice()
            .ok_or_else(|| anyhow!("tensor data is not contiguous after layout conversion"))?;

        let buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("athygli tensor"),
                contents: bytemuck::cast_slice(slice),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            });

        Ok(Self {
            buffer: Arc::new(buffer),
            shape: arr.shape().to_vec(),
            context: context.clone(),
        })
    }

    /// Creates a zero-filled device tensor of the given shape.
    pub fn zeros(context: &Arc<WgpuContext>, shape: Vec<usize>, label: &str) -> Self {
        let len: usize = shape.iter().product::<usize>().max(1);
        let buffer = context.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        Self {
            buffer: Arc::new(buffer),
            shape,
            context: context.clone(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Reads the tensor back to the host as a 4D array.
    pub async fn to_ndarray_4d(&self) -> Result<Array4<f32>> {
        anyhow::ensure!(self.rank() == 4, "tensor rank is not 4");
        let raw_data = self.read_raw_data().await?;
        let data_slice: &[f32] = bytemuck::cast_slice(&raw_data);
        Ok(Array4::from_shape_vec(
            (self.shape[0], self.shape[1], self.shape[2], self.shape[3]),
            data_slice.to_vec(),
        )?)
    }

    /// Copies the buffer into a staging buffer, maps it, and returns the raw
    /// bytes. Blocks on device completion.
    pub async fn read_raw_data(&self) -> Result<Vec<u8>> {
        let device = &self.context.device;
        let queue = &self.context.queue;
        let buffer_size = self.buffer.size();

        let staging_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("staging readback buffer"),
            size: buffer_size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback encoder"),
        });
        encoder.copy_buffer_to_buffer(self.buffer(), 0, &staging_buffer, 0, buffer_size);
        queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        device
            .poll(wgpu::PollType::wait())
            .map_err(|e| anyhow!("device poll failed: {e:?}"))?;

        rx.receive()
            .await
            .ok_or(anyhow!("GPU readback channel closed"))??;

        let data = buffer_slice.get_mapped_range().to_vec();
        staging_buffer.unmap();

        Ok(data)
    }
}
