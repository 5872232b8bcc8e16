//! Elementwise forward kernels.

/// ReLU: `out[i] = max(0, x[i])`. Fully independent per element; the launch
/// maps one thread per element.
pub(crate) fn run_relu(x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        *o = v.max(0.0);
    }
}
