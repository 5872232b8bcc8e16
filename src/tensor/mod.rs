//! Tensor views over host and device buffers.

mod device;
mod dtype;
mod host;
mod shape;

pub use device::DeviceTensor;
pub use dtype::DType;
pub use host::HostTensor;
pub use shape::Shape;
