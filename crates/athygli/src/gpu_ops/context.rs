use std::sync::Arc;

use anyhow::Result;
use wgpu::{
    Adapter, DeviceDescriptor, Features, Instance, InstanceDescriptor, PowerPreference,
    RequestAdapterOptions,
};

/// Handle to the WebGPU device running the fused kernels.
#[derive(Debug)]
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter: Adapter,
}

impl WgpuContext {
    pub async fn new() -> Result<Arc<Self>> {
        Self::with_config(GpuConfig::default()).await
    }

    pub async fn with_config(config: GpuConfig) -> Result<Arc<Self>> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        log::info!(
            "adapter: {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type
        );
        log::debug!(
            "adapter limits: max_buffer={:.2}GB, max_binding={:.2}GB",
            adapter_limits.max_buffer_size as f64 / 1_073_741_824.0,
            adapter_limits.max_storage_buffer_binding_size as f64 / 1_073_741_824.0
        );

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("athygli_gpu"),
                required_features: Features::empty(),
                required_limits: adapter_limits,
                ..Default::default()
            })
            .await?;

        log::debug!("device initialized");

        Ok(Arc::new(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
        }))
    }

    pub fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }
}

#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub power_preference: PowerPreference,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
        }
    }
}
