//! Windowed MaxPool2D forward.

use super::Pool2dSpec;

/// Per-window maximum over `[C, H, W]` input. Pooling has no padding, so
/// every window the output formula admits lies fully inside the input and
/// the inner loops need no bounds handling. Ties resolve to the value; the
/// argmax index is not tracked.
pub(crate) fn run_max_pool2d(
    spec: &Pool2dSpec,
    x: &[f32],
    channels: usize,
    h: usize,
    w: usize,
    out: &mut [f32],
    oh: usize,
    ow: usize,
) {
    let k = spec.window;
    let s = spec.stride;
    for chan in 0..channels {
        for oy in 0..oh {
            for ox in 0..ow {
                let (iy0, ix0) = (oy * s, ox * s);
                let mut best = f32::NEG_INFINITY;
                for ky in 0..k {
                    let row = (chan * h + iy0 + ky) * w + ix0;
                    for kx in 0..k {
                        let v = x[row + kx];
                        if v > best {
                            best = v;
                        }
                    }
                }
                out[(chan * oh + oy) * ow + ox] = best;
            }
        }
    }
}
