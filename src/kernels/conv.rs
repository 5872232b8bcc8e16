//! Tiled Conv2D forward.
//!
//! A compute group covers one square output tile of one output channel. It
//! stages the matching input patch and weight window in fast memory,
//! accumulates in f32, then adds bias on writeback. Input channels are
//! processed in blocks when the full set does not fit the staging budget.

use super::launch::{ceil_div, plan_conv_tile};
use super::Conv2dSpec;

/// Output extent of one convolved dimension:
/// `floor((input + 2*padding - window) / stride) + 1`.
///
/// `None` when the padded input cannot hold one window, the stride or
/// window is zero, or the arithmetic overflows.
pub fn conv2d_out_dim(input: usize, window: usize, stride: usize, padding: usize) -> Option<usize> {
    if window == 0 || stride == 0 {
        return None;
    }
    let padded = input.checked_add(padding.checked_mul(2)?)?;
    if padded < window {
        return None;
    }
    Some((padded - window) / stride + 1)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run_conv2d(
    spec: &Conv2dSpec,
    shared_limit: usize,
    x: &[f32],
    h: usize,
    w: usize,
    weight: &[f32],
    bias: Option<&[f32]>,
    out: &mut [f32],
    oh: usize,
    ow: usize,
) {
    if oh == 0 || ow == 0 {
        return;
    }
    let k = spec.kernel;
    let s = spec.stride;
    let p = spec.padding;
    let (c_in, c_out) = (spec.in_channels, spec.out_channels);

    let tile = plan_conv_tile(k, s, c_in, shared_limit);
    let (th, tw) = (tile.tile_h, tile.tile_w);
    let (ph, pw) = (tile.patch_h, tile.patch_w);
    let tiles_y = ceil_div(oh, th);
    let tiles_x = ceil_div(ow, tw);

    // Staging buffers standing in for the per-group fast memory.
    let mut patch = vec![0f32; ph * pw * tile.c_block];
    let mut wblk = vec![0f32; k * k * tile.c_block];
    let mut acc = vec![0f32; th * tw];

    for oc in 0..c_out {
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                acc.fill(0.0);
                let base_y = (ty * th * s) as isize - p as isize;
                let base_x = (tx * tw * s) as isize - p as isize;

                let mut c0 = 0;
                while c0 < c_in {
                    let cb = tile.c_block.min(c_in - c0);
                    for cc in 0..cb {
                        let chan = c0 + cc;
                        for py in 0..ph {
                            let iy = base_y + py as isize;
                            let dst_row = (cc * ph + py) * pw;
                            if iy < 0 || iy >= h as isize {
                                patch[dst_row..dst_row + pw].fill(0.0);
                                continue;
                            }
                            let src_row = (chan * h + iy as usize) * w;
                            for px in 0..pw {
                                let ix = base_x + px as isize;
                                patch[dst_row + px] = if ix < 0 || ix >= w as isize {
                                    0.0
                                } else {
                                    x[src_row + ix as usize]
                                };
                            }
                        }
                        let wsrc = (oc * c_in + chan) * k * k;
                        wblk[cc * k * k..(cc + 1) * k * k]
                            .copy_from_slice(&weight[wsrc..wsrc + k * k]);
                    }

                    for ly in 0..th {
                        for lx in 0..tw {
                            let oy = ty * th + ly;
                            let ox = tx * tw + lx;
                            if oy >= oh || ox >= ow {
                                continue;
                            }
                            let mut sum = 0f32;
                            for cc in 0..cb {
                                let prow = cc * ph + ly * s;
                                let wrow = cc * k * k;
                                for ky in 0..k {
                                    let pbase = (prow + ky) * pw + lx * s;
                                    let wbase = wrow + ky * k;
                                    for kx in 0..k {
                                        sum += patch[pbase + kx] * wblk[wbase + kx];
                                    }
                                }
                            }
                            acc[ly * tw + lx] += sum;
                        }
                    }
                    c0 += cb;
                }

                let b = bias.map(|b| b[oc]).unwrap_or(0.0);
                for ly in 0..th {
                    for lx in 0..tw {
                        let oy = ty * th + ly;
                        let ox = tx * tw + lx;
                        if oy < oh && ox < ow {
                            out[(oc * oh + oy) * ow + ox] = acc[ly * tw + lx] + b;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_dim_matches_formula() {
        assert_eq!(conv2d_out_dim(32, 3, 1, 1), Some(32));
        assert_eq!(conv2d_out_dim(32, 2, 2, 0), Some(16));
        assert_eq!(conv2d_out_dim(7, 3, 2, 0), Some(3));
        assert_eq!(conv2d_out_dim(5, 5, 1, 0), Some(1));
    }

    #[test]
    fn out_dim_rejects_degenerate_windows() {
        assert_eq!(conv2d_out_dim(4, 5, 1, 0), None);
        assert_eq!(conv2d_out_dim(4, 3, 0, 0), None);
        assert_eq!(conv2d_out_dim(4, 0, 1, 0), None);
        assert_eq!(conv2d_out_dim(2, 5, 1, 1), None);
    }
}
