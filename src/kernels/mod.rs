//! Compute kernels: stateless numeric routines plus the descriptors the
//! device consumes to run them.
//!
//! Each kernel is a pure function over input/parameter/output buffers. The
//! engine describes a launch as a tagged [`KernelOp`] with a
//! [`LaunchConfig`] sized from the output shape; the device executes the
//! matching routine. [`reference`] holds the brute-force oracles the tiled
//! implementations are validated against.

pub mod conv;
pub mod dense;
pub mod elementwise;
pub mod launch;
pub mod pool;
pub mod reference;

use serde::{Deserialize, Serialize};

pub use conv::conv2d_out_dim;
pub use launch::{plan_conv_tile, ConvTile, LaunchConfig};

/// Conv2D configuration: square `kernel`×`kernel` window over a
/// channels-first `[C_in, H, W]` input, weights `[C_out, C_in, K, K]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dSpec {
    /// Spatial output extents, `None` when the padded input cannot hold one
    /// window or a size computation overflows.
    pub fn out_hw(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let oh = conv2d_out_dim(h, self.kernel, self.stride, self.padding)?;
        let ow = conv2d_out_dim(w, self.kernel, self.stride, self.padding)?;
        Some((oh, ow))
    }
}

/// MaxPool2D configuration: square window, no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dSpec {
    pub window: usize,
    pub stride: usize,
}

impl Pool2dSpec {
    pub fn out_hw(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let oh = conv2d_out_dim(h, self.window, self.stride, 0)?;
        let ow = conv2d_out_dim(w, self.window, self.stride, 0)?;
        Some((oh, ow))
    }
}

/// Dense (fully connected) configuration: `y = W x + b` with weights
/// `[out_features, in_features]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseSpec {
    pub in_features: usize,
    pub out_features: usize,
}

/// Tagged kernel descriptor dispatched by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelOp {
    Conv2d(Conv2dSpec),
    Relu,
    MaxPool2d(Pool2dSpec),
    Dense(DenseSpec),
}

impl KernelOp {
    pub fn name(&self) -> &'static str {
        match self {
            KernelOp::Conv2d(_) => "conv2d",
            KernelOp::Relu => "relu",
            KernelOp::MaxPool2d(_) => "max_pool2d",
            KernelOp::Dense(_) => "dense",
        }
    }
}
