//! Layer capability surface.
//!
//! A layer is a shape-checked description of one kernel application:
//! it reports its output shape for a given input, exposes its host-side
//! parameters for the graph to upload, sizes its own launch geometry, and
//! issues the kernel against already-bound device buffers. Layers hold no
//! device state; the graph owns placement and scheduling.

mod activation;
mod conv;
mod dense;
mod pooling;

use crate::device::{BufferView, Device, DeviceError, DeviceProps, StreamId};
use crate::error::ShapeMismatchInfo;
use crate::kernels::LaunchConfig;
use crate::tensor::{HostTensor, Shape};

pub use activation::ReLULayer;
pub use conv::Conv2DLayer;
pub use dense::DenseLayer;
pub use pooling::MaxPoolLayer;

/// Bound operands for one forward invocation. `params` follows the order
/// of [`Layer::parameters`].
pub struct Launch<'a, D: Device> {
    pub device: &'a D,
    pub stream: StreamId,
    pub cfg: &'a LaunchConfig,
    pub input: &'a BufferView<D::Buffer>,
    pub output: &'a BufferView<D::Buffer>,
    pub params: &'a [BufferView<D::Buffer>],
}

/// One graph-composable operation.
pub trait Layer<D: Device>: Send + Sync {
    /// Stable name used in plans, traces and errors.
    fn label(&self) -> &'static str;

    /// Output shape for `input`, or the conflict when the layer cannot
    /// accept it.
    fn output_shape(&self, input: &Shape) -> Result<Shape, ShapeMismatchInfo>;

    /// Host-side parameter tensors in binding order. Uploaded once at
    /// compile time.
    fn parameters(&self) -> Vec<&HostTensor> {
        Vec::new()
    }

    /// Launch geometry for the already-inferred output shape. Pure; called
    /// at compile time.
    fn plan_launch(&self, output: &Shape, props: &DeviceProps) -> LaunchConfig;

    /// Issues the kernel into `launch.stream`. Enqueue only; completion is
    /// observed through stream synchronization.
    fn forward(&self, launch: &Launch<'_, D>) -> Result<(), DeviceError>;
}
