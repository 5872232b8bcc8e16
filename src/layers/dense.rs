//! Fully connected layer.

use anyhow::{ensure, Result};

use crate::device::{Device, DeviceError, DeviceProps};
use crate::error::ShapeMismatchInfo;
use crate::kernels::{DenseSpec, KernelOp, LaunchConfig};
use crate::tensor::{DType, HostTensor, Shape};

use super::{Launch, Layer};

const DENSE_BLOCK: usize = 128;

/// Dense `y = W x + b`. The incoming tensor is consumed in row-major
/// flattened order, so any input shape with `in_features` elements is
/// accepted.
pub struct DenseLayer {
    weight: HostTensor,
    bias: Option<HostTensor>,
    spec: DenseSpec,
}

impl DenseLayer {
    /// Builds the layer from a `[out_features, in_features]` weight tensor
    /// and an optional `[out_features]` bias.
    pub fn new(weight: HostTensor, bias: Option<HostTensor>) -> Result<Self> {
        ensure!(
            weight.dtype() == DType::F32,
            "dense weights must be f32, got {}",
            weight.dtype()
        );
        let dims = weight.shape().dims();
        ensure!(
            dims.len() == 2,
            "dense weight must be [out_features, in_features], got {}",
            weight.shape()
        );
        ensure!(dims[0] > 0 && dims[1] > 0, "dense weight cannot be empty");
        if let Some(bias) = &bias {
            ensure!(
                bias.dtype() == DType::F32,
                "dense bias must be f32, got {}",
                bias.dtype()
            );
            ensure!(
                bias.shape().num_elements() == dims[0],
                "dense bias {} does not match {} output features",
                bias.shape(),
                dims[0]
            );
        }
        let spec = DenseSpec {
            out_features: dims[0],
            in_features: dims[1],
        };
        Ok(DenseLayer { weight, bias, spec })
    }

    pub fn spec(&self) -> &DenseSpec {
        &self.spec
    }
}

impl<D: Device> Layer<D> for DenseLayer {
    fn label(&self) -> &'static str {
        "dense"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, ShapeMismatchInfo> {
        if input.num_elements() != self.spec.in_features {
            return Err(ShapeMismatchInfo::new(
                format!("[{}]", self.spec.in_features),
                input.to_string(),
            ));
        }
        Ok(Shape::new([self.spec.out_features]))
    }

    fn parameters(&self) -> Vec<&HostTensor> {
        match &self.bias {
            Some(bias) => vec![&self.weight, bias],
            None => vec![&self.weight],
        }
    }

    fn plan_launch(&self, output: &Shape, _props: &DeviceProps) -> LaunchConfig {
        LaunchConfig::auto_1d(output.num_elements(), DENSE_BLOCK)
    }

    fn forward(&self, launch: &Launch<'_, D>) -> Result<(), DeviceError> {
        let mut inputs = Vec::with_capacity(1 + launch.params.len());
        inputs.push(launch.input.clone());
        inputs.extend(launch.params.iter().cloned());
        launch.device.launch(
            launch.stream,
            &KernelOp::Dense(self.spec),
            launch.cfg,
            &inputs,
            launch.output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn flattens_any_input_with_matching_element_count() {
        let weight = HostTensor::zeros(Shape::new([10, 64]), DType::F32);
        let dense = DenseLayer::new(weight, None).expect("layer");
        let out = Layer::<HostDevice>::output_shape(&dense, &Shape::new([4, 4, 4])).expect("shape");
        assert_eq!(out.dims(), [10]);
    }

    #[test]
    fn element_count_mismatch_is_rejected() {
        let weight = HostTensor::zeros(Shape::new([10, 64]), DType::F32);
        let dense = DenseLayer::new(weight, None).expect("layer");
        let err = Layer::<HostDevice>::output_shape(&dense, &Shape::new([4, 4]))
            .expect_err("element count differs");
        assert_eq!(err.expected, "[64]");
        assert_eq!(err.actual, "[4, 4]");
    }
}
