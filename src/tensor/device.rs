//! Device-resident tensor views.
//!
//! A `DeviceTensor` never owns accelerator memory. It names an arena
//! allocation by opaque id plus generation, with a byte offset into the
//! block; the arena rejects handles whose generation has moved on.

use crate::device::TensorSpec;
use crate::memory::AllocId;

use super::{DType, Shape};

#[derive(Debug, Clone)]
pub struct DeviceTensor {
    spec: TensorSpec,
    alloc: AllocId,
    generation: u64,
    offset: usize,
}

impl DeviceTensor {
    pub(crate) fn new(spec: TensorSpec, alloc: AllocId, generation: u64, offset: usize) -> Self {
        DeviceTensor {
            spec,
            alloc,
            generation,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn alloc_id(&self) -> AllocId {
        self.alloc
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_len(&self) -> usize {
        self.spec.shape.num_elements() * self.spec.dtype.size_in_bytes()
    }
}
