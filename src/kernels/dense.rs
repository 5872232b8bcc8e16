//! Dense (fully connected) forward: `y = W x + b`.

use super::DenseSpec;

/// Matrix-vector product over row-major `[out_features, in_features]`
/// weights, one output element per thread.
pub(crate) fn run_dense(
    spec: &DenseSpec,
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    out: &mut [f32],
) {
    let n = spec.in_features;
    for (o, out_v) in out.iter_mut().enumerate() {
        let row = &weight[o * n..(o + 1) * n];
        let mut sum = 0f32;
        for (wv, xv) in row.iter().zip(x.iter()) {
            sum += wv * xv;
        }
        *out_v = sum + bias.map(|b| b[o]).unwrap_or(0.0);
    }
}
