//! 2D convolution layer.

use anyhow::{ensure, Result};

use crate::device::{Device, DeviceError, DeviceProps};
use crate::error::ShapeMismatchInfo;
use crate::kernels::{plan_conv_tile, Conv2dSpec, KernelOp, LaunchConfig};
use crate::tensor::{DType, HostTensor, Shape};

use super::{Launch, Layer};

/// Conv2D over channels-first `[C_in, H, W]` inputs with a square kernel,
/// symmetric zero padding and uniform stride.
pub struct Conv2DLayer {
    weight: HostTensor,
    bias: Option<HostTensor>,
    spec: Conv2dSpec,
}

impl Conv2DLayer {
    /// Builds the layer from a `[C_out, C_in, K, K]` weight tensor and an
    /// optional `[C_out]` bias.
    pub fn new(
        weight: HostTensor,
        bias: Option<HostTensor>,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        ensure!(
            weight.dtype() == DType::F32,
            "conv2d weights must be f32, got {}",
            weight.dtype()
        );
        let dims = weight.shape().dims();
        ensure!(
            dims.len() == 4,
            "conv2d weight must be [C_out, C_in, K, K], got {}",
            weight.shape()
        );
        ensure!(
            dims[2] == dims[3],
            "conv2d kernel must be square, got {}x{}",
            dims[2],
            dims[3]
        );
        ensure!(dims[0] > 0 && dims[1] > 0, "conv2d needs at least one channel");
        ensure!(dims[2] > 0, "conv2d kernel size must be positive");
        ensure!(stride > 0, "conv2d stride must be positive");
        if let Some(bias) = &bias {
            ensure!(
                bias.dtype() == DType::F32,
                "conv2d bias must be f32, got {}",
                bias.dtype()
            );
            ensure!(
                bias.shape().num_elements() == dims[0],
                "conv2d bias {} does not match {} output channels",
                bias.shape(),
                dims[0]
            );
        }
        let spec = Conv2dSpec {
            in_channels: dims[1],
            out_channels: dims[0],
            kernel: dims[2],
            stride,
            padding,
        };
        Ok(Conv2DLayer { weight, bias, spec })
    }

    pub fn spec(&self) -> &Conv2dSpec {
        &self.spec
    }
}

impl<D: Device> Layer<D> for Conv2DLayer {
    fn label(&self) -> &'static str {
        "conv2d"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, ShapeMismatchInfo> {
        let dims = input.dims();
        if dims.len() != 3 {
            return Err(ShapeMismatchInfo::new(
                format!("[{}, H, W]", self.spec.in_channels),
                input.to_string(),
            ));
        }
        if dims[0] != self.spec.in_channels {
            let expected = Shape::new([self.spec.in_channels, dims[1], dims[2]]);
            return Err(ShapeMismatchInfo::new(
                expected.to_string(),
                input.to_string(),
            ));
        }
        match self.spec.out_hw(dims[1], dims[2]) {
            Some((oh, ow)) => Ok(Shape::new([self.spec.out_channels, oh, ow])),
            None => {
                // The padded input cannot hold one kernel window.
                let min = self
                    .spec
                    .kernel
                    .saturating_sub(2 * self.spec.padding)
                    .max(1);
                Err(ShapeMismatchInfo::new(
                    format!("at least [{}, {min}, {min}]", self.spec.in_channels),
                    input.to_string(),
                ))
            }
        }
    }

    fn parameters(&self) -> Vec<&HostTensor> {
        match &self.bias {
            Some(bias) => vec![&self.weight, bias],
            None => vec![&self.weight],
        }
    }

    fn plan_launch(&self, output: &Shape, props: &DeviceProps) -> LaunchConfig {
        let tile = plan_conv_tile(
            self.spec.kernel,
            self.spec.stride,
            self.spec.in_channels,
            props.shared_memory_per_group,
        );
        let dims = output.dims();
        LaunchConfig::for_conv(self.spec.out_channels, dims[1], dims[2], &tile)
    }

    fn forward(&self, launch: &Launch<'_, D>) -> Result<(), DeviceError> {
        let mut inputs = Vec::with_capacity(1 + launch.params.len());
        inputs.push(launch.input.clone());
        inputs.extend(launch.params.iter().cloned());
        launch.device.launch(
            launch.stream,
            &KernelOp::Conv2d(self.spec),
            launch.cfg,
            &inputs,
            launch.output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(c_out: usize, c_in: usize, k: usize, stride: usize, padding: usize) -> Conv2DLayer {
        let weight = HostTensor::zeros(Shape::new([c_out, c_in, k, k]), DType::F32);
        Conv2DLayer::new(weight, None, stride, padding).expect("valid layer")
    }

    #[test]
    fn same_padding_preserves_spatial_extent() {
        let conv = layer(8, 3, 3, 1, 1);
        let out = Layer::<crate::device::HostDevice>::output_shape(&conv, &Shape::new([3, 32, 32]))
            .expect("shape");
        assert_eq!(out.dims(), [8, 32, 32]);
    }

    #[test]
    fn channel_mismatch_reports_both_shapes() {
        let conv = layer(8, 3, 3, 1, 1);
        let err = Layer::<crate::device::HostDevice>::output_shape(&conv, &Shape::new([4, 32, 32]))
            .expect_err("mismatch");
        assert_eq!(err.expected, "[3, 32, 32]");
        assert_eq!(err.actual, "[4, 32, 32]");
    }

    #[test]
    fn rejects_non_square_kernels() {
        let weight = HostTensor::zeros(Shape::new([8, 3, 3, 5]), DType::F32);
        assert!(Conv2DLayer::new(weight, None, 1, 0).is_err());
    }
}
