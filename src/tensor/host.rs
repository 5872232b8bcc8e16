//! Host-resident tensors backed by an owned byte buffer.
//!
//! Weights and inputs arrive here already deserialized; the arena copies
//! them to accelerator memory. Typed accessors check the dtype and the
//! buffer layout before exposing element views.

use anyhow::{ensure, Result};
use rand::Rng;

use super::{DType, Shape};

#[derive(Clone)]
pub struct HostTensor {
    shape: Shape,
    dtype: DType,
    data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled tensor of the given shape and dtype.
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        let bytes = shape.num_elements() * dtype.size_in_bytes();
        HostTensor {
            shape,
            dtype,
            data: vec![0u8; bytes],
        }
    }

    /// Builds an `F32` tensor from a value vector. Fails if the vector
    /// length does not cover the shape.
    pub fn from_vec(shape: Shape, values: Vec<f32>) -> Result<Self> {
        ensure!(
            values.len() == shape.num_elements(),
            "value count {} does not match shape {} ({} elements)",
            values.len(),
            shape,
            shape.num_elements()
        );
        Ok(HostTensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(values),
        })
    }

    /// Wraps raw bytes as a tensor of the given shape and dtype. Fails if
    /// the byte length does not cover the shape.
    pub fn from_bytes(shape: Shape, dtype: DType, data: Vec<u8>) -> Result<Self> {
        ensure!(
            data.len() == shape.num_elements() * dtype.size_in_bytes(),
            "byte length {} does not match shape {} with dtype {}",
            data.len(),
            shape,
            dtype
        );
        Ok(HostTensor { shape, dtype, data })
    }

    /// Standard-normal `F32` tensor using a thread-local generator.
    pub fn randn(shape: Shape) -> Self {
        let mut rng = rand::thread_rng();
        Self::randn_from(&mut rng, shape)
    }

    /// Standard-normal `F32` tensor drawn from the caller's generator, for
    /// reproducible fixtures.
    pub fn randn_from<R: Rng>(rng: &mut R, shape: Shape) -> Self {
        let count = shape.num_elements();
        let mut values = Vec::with_capacity(count);
        // Box-Muller transform over uniform samples.
        while values.len() < count {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let radius = (-2.0 * u1.ln()).sqrt();
            let angle = 2.0 * std::f32::consts::PI * u2;
            values.push(radius * angle.cos());
            if values.len() < count {
                values.push(radius * angle.sin());
            }
        }
        HostTensor {
            shape,
            dtype: DType::F32,
            data: vec_into_bytes(values),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Element view of an `F32` tensor. Panics on dtype mismatch.
    pub fn as_f32(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "host tensor dtype mismatch");
        bytes_as_slice(&self.data)
    }

    /// Mutable element view of an `F32` tensor. Panics on dtype mismatch.
    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dtype, DType::F32, "host tensor dtype mismatch");
        bytes_as_slice_mut(&mut self.data)
    }

    /// Index and value of the largest element (top-1 class of a
    /// classification vector). `None` for an empty tensor.
    pub fn argmax(&self) -> Option<(usize, f32)> {
        let values = self.as_f32();
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in values.iter().enumerate() {
            match best {
                Some((_, bv)) if bv >= v => {}
                _ => best = Some((i, v)),
            }
        }
        best
    }
}

impl std::fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

fn vec_into_bytes(values: Vec<f32>) -> Vec<u8> {
    let mut values = std::mem::ManuallyDrop::new(values);
    let ptr = values.as_mut_ptr();
    let len = values.len() * std::mem::size_of::<f32>();
    let cap = values.capacity() * std::mem::size_of::<f32>();
    // SAFETY: the allocation came from Vec<f32>, so the pointer is valid for
    // `cap` bytes and f32 has no invalid byte patterns.
    unsafe { Vec::from_raw_parts(ptr.cast::<u8>(), len, cap) }
}

fn bytes_as_slice(bytes: &[u8]) -> &[f32] {
    assert_eq!(bytes.len() % std::mem::size_of::<f32>(), 0);
    assert_eq!(bytes.as_ptr().align_offset(std::mem::align_of::<f32>()), 0);
    // SAFETY: length and alignment checked above; every bit pattern is a
    // valid f32.
    unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr().cast::<f32>(),
            bytes.len() / std::mem::size_of::<f32>(),
        )
    }
}

fn bytes_as_slice_mut(bytes: &mut [u8]) -> &mut [f32] {
    assert_eq!(bytes.len() % std::mem::size_of::<f32>(), 0);
    assert_eq!(bytes.as_ptr().align_offset(std::mem::align_of::<f32>()), 0);
    // SAFETY: as in `bytes_as_slice`, with exclusive access inherited from
    // the mutable borrow.
    unsafe {
        std::slice::from_raw_parts_mut(
            bytes.as_mut_ptr().cast::<f32>(),
            bytes.len() / std::mem::size_of::<f32>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_length_mismatch() {
        assert!(HostTensor::from_vec(Shape::new(vec![4]), vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn f32_views_round_trip() {
        let mut t = HostTensor::from_vec(Shape::new(vec![2, 2]), vec![1.0, -2.0, 3.0, -4.0])
            .expect("build tensor");
        assert_eq!(t.as_f32(), &[1.0, -2.0, 3.0, -4.0]);
        t.as_f32_mut()[1] = 5.0;
        assert_eq!(t.as_f32()[1], 5.0);
    }

    #[test]
    fn argmax_reports_first_of_equal_maxima() {
        let t = HostTensor::from_vec(Shape::new(vec![4]), vec![0.5, 2.0, 2.0, -1.0])
            .expect("build tensor");
        assert_eq!(t.argmax(), Some((1, 2.0)));
    }
}
