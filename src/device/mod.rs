//! The accelerator contract.
//!
//! Everything above this seam talks to the device through the [`Device`]
//! trait: raw allocation, asynchronous copies and kernel launches issued
//! into command streams, and event-based cross-stream ordering. The
//! in-tree implementation is [`HostDevice`], a software model of a small
//! discrete accelerator used as the engine's execution and test substrate.

pub mod host;
pub mod stream;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kernels::{KernelOp, LaunchConfig};
use crate::tensor::{DType, Shape};

pub use host::{HostBuffer, HostDevice};
pub use stream::{Download, Event};

/// Identifier of one command stream on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub(crate) u32);

impl StreamId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Capacity description of one accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProps {
    /// Total device memory available to allocations.
    pub memory_bytes: usize,
    /// Number of compute groups that can run concurrently.
    pub compute_groups: usize,
    /// Upper bound on threads per compute group.
    pub max_threads_per_group: usize,
    /// Fast (shared) memory per compute group, in bytes.
    pub shared_memory_per_group: usize,
}

impl Default for DeviceProps {
    fn default() -> Self {
        DeviceProps {
            memory_bytes: 512 * 1024 * 1024,
            compute_groups: 16,
            max_threads_per_group: 1024,
            shared_memory_per_group: 48 * 1024,
        }
    }
}

/// Dtype plus shape, the metadata a device needs to interpret a buffer
/// region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        TensorSpec { dtype, shape }
    }

    pub fn f32(shape: Shape) -> Self {
        TensorSpec {
            dtype: DType::F32,
            shape,
        }
    }

    /// Total byte footprint, `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .num_elements()
            .checked_mul(self.dtype.size_in_bytes())
    }
}

/// One operand binding of a launch: a device buffer region and the tensor
/// metadata describing it.
#[derive(Debug, Clone)]
pub struct BufferView<B> {
    pub buffer: B,
    pub offset: usize,
    pub spec: TensorSpec,
}

impl<B> BufferView<B> {
    pub fn byte_len(&self) -> usize {
        self.spec.byte_len().unwrap_or(usize::MAX)
    }
}

/// Failures reported by a device.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device out of memory: requested {requested} bytes with {in_use} of {capacity} in use")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },
    #[error("unknown {0}")]
    InvalidStream(StreamId),
    /// The operation was rejected at issue time (bad bindings, geometry
    /// over device limits, out-of-bounds copy).
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),
    /// Asynchronous execution failed. Reported at the next synchronization
    /// point of the affected stream.
    #[error("execution fault: {0}")]
    Fault(String),
}

/// A discrete accelerator.
///
/// Copies and launches are asynchronous: they enqueue onto a command
/// stream and return. Operations on one stream execute in issue order;
/// ordering across streams exists only through [`Device::record_event`] /
/// [`Device::wait_event`] joins or [`Device::synchronize`]. An execution
/// fault poisons its stream until the next `synchronize`, which reports
/// and clears it.
pub trait Device: Send + Sync + 'static {
    /// Handle to one contiguous device allocation. Dropping the last clone
    /// frees the memory.
    type Buffer: Clone + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn props(&self) -> &DeviceProps;

    /// Bytes currently allocated on the device.
    fn memory_in_use(&self) -> usize;

    fn alloc(&self, len: usize) -> Result<Self::Buffer, DeviceError>;

    fn create_stream(&self) -> Result<StreamId, DeviceError>;

    /// Enqueues a host-to-device copy of `src` into `dst` at `dst_offset`.
    fn copy_to_device(
        &self,
        stream: StreamId,
        src: Vec<u8>,
        dst: &Self::Buffer,
        dst_offset: usize,
    ) -> Result<(), DeviceError>;

    /// Enqueues a device-to-host copy; the returned handle completes when
    /// the bytes have landed.
    fn copy_to_host(
        &self,
        stream: StreamId,
        src: &Self::Buffer,
        src_offset: usize,
        len: usize,
    ) -> Result<Download, DeviceError>;

    /// Enqueues one kernel launch. Binding and geometry validation happens
    /// at issue time; execution faults surface at synchronization.
    fn launch(
        &self,
        stream: StreamId,
        op: &KernelOp,
        cfg: &LaunchConfig,
        inputs: &[BufferView<Self::Buffer>],
        output: &BufferView<Self::Buffer>,
    ) -> Result<(), DeviceError>;

    /// Records an event that completes once all work issued to `stream` so
    /// far has executed.
    fn record_event(&self, stream: StreamId) -> Result<Event, DeviceError>;

    /// Makes `stream` hold subsequent work until `event` completes.
    fn wait_event(&self, stream: StreamId, event: &Event) -> Result<(), DeviceError>;

    /// Blocks until `stream` has drained; reports and clears any pending
    /// execution fault.
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError>;
}
