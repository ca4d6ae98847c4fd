pub mod context;
pub mod fused;
pub mod tensor;

pub use context::WgpuContext;
pub use tensor::GpuTensor;
