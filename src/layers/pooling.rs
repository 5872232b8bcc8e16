//! Spatial pooling layers.

use anyhow::{ensure, Result};

use crate::device::{Device, DeviceError, DeviceProps};
use crate::error::ShapeMismatchInfo;
use crate::kernels::{KernelOp, LaunchConfig, Pool2dSpec};
use crate::tensor::Shape;

use super::{Launch, Layer};

/// MaxPool2D with a square window and no padding. Trailing rows and
/// columns that do not fill a window are dropped by the output formula.
pub struct MaxPoolLayer {
    spec: Pool2dSpec,
}

impl MaxPoolLayer {
    pub fn new(window: usize, stride: usize) -> Result<Self> {
        ensure!(window > 0, "max pool window must be positive");
        ensure!(stride > 0, "max pool stride must be positive");
        Ok(MaxPoolLayer {
            spec: Pool2dSpec { window, stride },
        })
    }

    pub fn spec(&self) -> &Pool2dSpec {
        &self.spec
    }
}

impl<D: Device> Layer<D> for MaxPoolLayer {
    fn label(&self) -> &'static str {
        "max_pool2d"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, ShapeMismatchInfo> {
        let dims = input.dims();
        if dims.len() != 3 {
            return Err(ShapeMismatchInfo::new("[C, H, W]", input.to_string()));
        }
        match self.spec.out_hw(dims[1], dims[2]) {
            Some((oh, ow)) => Ok(Shape::new([dims[0], oh, ow])),
            None => Err(ShapeMismatchInfo::new(
                format!(
                    "at least [{}, {}, {}]",
                    dims[0], self.spec.window, self.spec.window
                ),
                input.to_string(),
            )),
        }
    }

    fn plan_launch(&self, output: &Shape, _props: &DeviceProps) -> LaunchConfig {
        let dims = output.dims();
        LaunchConfig::auto_2d(dims[0], dims[1], dims[2])
    }

    fn forward(&self, launch: &Launch<'_, D>) -> Result<(), DeviceError> {
        launch.device.launch(
            launch.stream,
            &KernelOp::MaxPool2d(self.spec),
            launch.cfg,
            std::slice::from_ref(launch.input),
            launch.output,
        )
    }
}
