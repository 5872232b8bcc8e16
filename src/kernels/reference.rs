//! Brute-force reference implementations.
//!
//! Plain nested loops with no tiling or staging, used as oracles when
//! validating the device kernels. Shapes follow the engine's conventions:
//! channels-first `[C, H, W]` activations, `[C_out, C_in, K, K]` conv
//! weights, `[out, in]` dense weights.

use anyhow::{ensure, Result};

use crate::tensor::{HostTensor, Shape};

use super::{conv2d_out_dim, Conv2dSpec};

/// Triple-loop Conv2D with explicit bounds checks; padding positions
/// contribute zero.
pub fn conv2d(
    input: &HostTensor,
    weight: &HostTensor,
    bias: Option<&HostTensor>,
    stride: usize,
    padding: usize,
) -> Result<HostTensor> {
    ensure!(
        input.shape().rank() == 3,
        "conv2d reference expects [C, H, W] input, got {}",
        input.shape()
    );
    ensure!(
        weight.shape().rank() == 4,
        "conv2d reference expects [C_out, C_in, K, K] weight, got {}",
        weight.shape()
    );
    let [c_in, h, w] = [input.shape().dims()[0], input.shape().dims()[1], input.shape().dims()[2]];
    let wd = weight.shape().dims();
    let (c_out, k) = (wd[0], wd[2]);
    ensure!(wd[1] == c_in, "weight expects {} input channels, got {}", wd[1], c_in);
    ensure!(wd[2] == wd[3], "conv2d reference expects a square kernel, got {}", weight.shape());
    if let Some(b) = bias {
        ensure!(
            b.shape().num_elements() == c_out,
            "bias length {} does not match {} output channels",
            b.shape().num_elements(),
            c_out
        );
    }

    let spec = Conv2dSpec {
        in_channels: c_in,
        out_channels: c_out,
        kernel: k,
        stride,
        padding,
    };
    let (oh, ow) = spec
        .out_hw(h, w)
        .ok_or_else(|| anyhow::anyhow!("no valid output extent for input {}", input.shape()))?;

    let x = input.as_f32();
    let wv = weight.as_f32();
    let bv = bias.map(|b| b.as_f32());
    let mut out = vec![0f32; c_out * oh * ow];

    for oc in 0..c_out {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut sum = 0f32;
                for ic in 0..c_in {
                    for ky in 0..k {
                        for kx in 0..k {
                            let iy = (oy * stride + ky) as isize - padding as isize;
                            let ix = (ox * stride + kx) as isize - padding as isize;
                            if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let xi = (ic * h + iy as usize) * w + ix as usize;
                            let wi = ((oc * c_in + ic) * k + ky) * k + kx;
                            sum += x[xi] * wv[wi];
                        }
                    }
                }
                if let Some(b) = bv {
                    sum += b[oc];
                }
                out[(oc * oh + oy) * ow + ox] = sum;
            }
        }
    }

    HostTensor::from_vec(Shape::new(vec![c_out, oh, ow]), out)
}

/// Elementwise `max(0, x)` on any shape.
pub fn relu(input: &HostTensor) -> HostTensor {
    let mut out = input.clone();
    for v in out.as_f32_mut() {
        *v = v.max(0.0);
    }
    out
}

/// Per-window maximum with no padding; the output shrinks by the same
/// formula as conv with padding zero.
pub fn max_pool2d(input: &HostTensor, window: usize, stride: usize) -> Result<HostTensor> {
    ensure!(
        input.shape().rank() == 3,
        "max_pool2d reference expects [C, H, W] input, got {}",
        input.shape()
    );
    let [c, h, w] = [input.shape().dims()[0], input.shape().dims()[1], input.shape().dims()[2]];
    let oh = conv2d_out_dim(h, window, stride, 0)
        .ok_or_else(|| anyhow::anyhow!("window {window} does not fit input {}", input.shape()))?;
    let ow = conv2d_out_dim(w, window, stride, 0)
        .ok_or_else(|| anyhow::anyhow!("window {window} does not fit input {}", input.shape()))?;

    let x = input.as_f32();
    let mut out = vec![0f32; c * oh * ow];
    for chan in 0..c {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..window {
                    for kx in 0..window {
                        let v = x[(chan * h + oy * stride + ky) * w + ox * stride + kx];
                        best = best.max(v);
                    }
                }
                out[(chan * oh + oy) * ow + ox] = best;
            }
        }
    }
    HostTensor::from_vec(Shape::new(vec![c, oh, ow]), out)
}

/// Flattening matrix-vector product plus bias.
pub fn dense(
    input: &HostTensor,
    weight: &HostTensor,
    bias: Option<&HostTensor>,
) -> Result<HostTensor> {
    ensure!(
        weight.shape().rank() == 2,
        "dense reference expects [out, in] weight, got {}",
        weight.shape()
    );
    let (out_f, in_f) = (weight.shape().dims()[0], weight.shape().dims()[1]);
    ensure!(
        input.shape().num_elements() == in_f,
        "dense reference expects {} input features, got {}",
        in_f,
        input.shape().num_elements()
    );
    if let Some(b) = bias {
        ensure!(
            b.shape().num_elements() == out_f,
            "bias length {} does not match {} output features",
            b.shape().num_elements(),
            out_f
        );
    }

    let x = input.as_f32();
    let wv = weight.as_f32();
    let bv = bias.map(|b| b.as_f32());
    let mut out = vec![0f32; out_f];
    for (o, out_v) in out.iter_mut().enumerate() {
        let mut sum = 0f32;
        for i in 0..in_f {
            sum += wv[o * in_f + i] * x[i];
        }
        if let Some(b) = bv {
            sum += b[o];
        }
        *out_v = sum;
    }
    HostTensor::from_vec(Shape::new(vec![out_f]), out)
}
