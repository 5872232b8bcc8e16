pub mod context;
pub mod device;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod layers;
pub mod memory;
pub mod tensor;
pub mod trace;

mod env;

pub use context::{ContextOptions, ExecContext};
pub use device::{
    BufferView, Device, DeviceError, DeviceProps, Download, Event, HostBuffer, HostDevice,
    StreamId, TensorSpec,
};
pub use error::{Error, Result, ShapeMismatchInfo};
pub use graph::{ExecutionGraph, NodeId, PlanSummary};
pub use kernels::{conv2d_out_dim, Conv2dSpec, DenseSpec, KernelOp, LaunchConfig, Pool2dSpec};
pub use layers::{Conv2DLayer, DenseLayer, Launch, Layer, MaxPoolLayer, ReLULayer};
pub use memory::{AllocId, Arena, ArenaScope, ArenaStats};
pub use tensor::{DType, DeviceTensor, HostTensor, Shape};
pub use trace::{CompileStats, LaunchRecord, RunStats, TraceSink};
