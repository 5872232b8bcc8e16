//! Elementwise activations.

use crate::device::{Device, DeviceError, DeviceProps};
use crate::error::ShapeMismatchInfo;
use crate::kernels::{KernelOp, LaunchConfig};
use crate::tensor::Shape;

use super::{Launch, Layer};

const RELU_BLOCK: usize = 256;

/// Elementwise `max(x, 0)`. Shape-preserving, no parameters.
#[derive(Default)]
pub struct ReLULayer;

impl ReLULayer {
    pub fn new() -> Self {
        ReLULayer
    }
}

impl<D: Device> Layer<D> for ReLULayer {
    fn label(&self) -> &'static str {
        "relu"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, ShapeMismatchInfo> {
        Ok(input.clone())
    }

    fn plan_launch(&self, output: &Shape, _props: &DeviceProps) -> LaunchConfig {
        LaunchConfig::auto_1d(output.num_elements(), RELU_BLOCK)
    }

    fn forward(&self, launch: &Launch<'_, D>) -> Result<(), DeviceError> {
        launch.device.launch(
            launch.stream,
            &KernelOp::Relu,
            launch.cfg,
            std::slice::from_ref(launch.input),
            launch.output,
        )
    }
}
