//! Software model of a small discrete accelerator.
//!
//! [`HostDevice`] executes kernels on per-stream worker threads with the
//! same observable contract a hardware backend would have: commands run
//! asynchronously in issue order per stream, cross-stream ordering exists
//! only through events, device memory is a fixed budget, and execution
//! faults surface at the next synchronization of the affected stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};

use super::stream::{Command, Download, Event, StreamQueue};
use super::{BufferView, Device, DeviceError, DeviceProps, StreamId};
use crate::kernels::{self, KernelOp, LaunchConfig};
use crate::tensor::DType;

struct BufferInner {
    /// Backing store kept as `f32` words so kernel views are plain
    /// subslices. Byte copies reinterpret it; `len` is the byte length the
    /// allocation was requested with.
    data: RwLock<Box<[f32]>>,
    len: usize,
    used: Arc<AtomicUsize>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.used.fetch_sub(self.len, Ordering::Relaxed);
    }
}

/// Handle to one device allocation. Clones share the allocation; the
/// memory returns to the budget when the last clone drops.
#[derive(Clone)]
pub struct HostBuffer(Arc<BufferInner>);

impl HostBuffer {
    /// Byte length of the allocation.
    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    fn same_alloc(a: &HostBuffer, b: &HostBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostBuffer({} bytes)", self.0.len)
    }
}

/// The in-process reference device.
pub struct HostDevice {
    props: DeviceProps,
    used: Arc<AtomicUsize>,
    streams: Mutex<Vec<StreamQueue>>,
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice::with_props(DeviceProps::default())
    }

    pub fn with_props(props: DeviceProps) -> Self {
        HostDevice {
            props,
            used: Arc::new(AtomicUsize::new(0)),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn sender(&self, stream: StreamId) -> Result<mpsc::Sender<Command>, DeviceError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .get(stream.index())
            .map(|queue| queue.sender())
            .ok_or(DeviceError::InvalidStream(stream))
    }

    fn submit(&self, stream: StreamId, command: Command) -> Result<(), DeviceError> {
        self.sender(stream)?
            .send(command)
            .map_err(|_| DeviceError::Fault(format!("{stream} worker terminated")))
    }

    fn check_view(&self, view: &BufferView<HostBuffer>, role: &str) -> Result<(), DeviceError> {
        if view.spec.dtype != DType::F32 {
            return Err(DeviceError::InvalidLaunch(format!(
                "{role} must be f32, got {}",
                view.spec.dtype
            )));
        }
        let len = view
            .spec
            .byte_len()
            .ok_or_else(|| DeviceError::InvalidLaunch(format!("{role} byte size overflows")))?;
        if view.offset % 4 != 0 {
            return Err(DeviceError::InvalidLaunch(format!(
                "{role} offset {} is not 4-byte aligned",
                view.offset
            )));
        }
        let end = view.offset.checked_add(len).unwrap_or(usize::MAX);
        if end > view.buffer.len() {
            return Err(DeviceError::InvalidLaunch(format!(
                "{role} region {}..{} exceeds allocation of {} bytes",
                view.offset,
                end,
                view.buffer.len()
            )));
        }
        Ok(())
    }

    /// Issue-time validation: operand dtypes, bounds, arity, shape
    /// agreement with the kernel descriptor, and device limits. The output
    /// must not share an allocation with any input; kernels lock inputs
    /// shared and the output exclusive.
    fn validate_launch(
        &self,
        op: &KernelOp,
        cfg: &LaunchConfig,
        inputs: &[BufferView<HostBuffer>],
        output: &BufferView<HostBuffer>,
    ) -> Result<(), DeviceError> {
        if cfg.threads_per_group() > self.props.max_threads_per_group {
            return Err(DeviceError::InvalidLaunch(format!(
                "block {:?} exceeds {} threads per group",
                cfg.block, self.props.max_threads_per_group
            )));
        }
        if cfg.shared_mem_bytes as usize > self.props.shared_memory_per_group {
            return Err(DeviceError::InvalidLaunch(format!(
                "requested {} bytes of group-shared memory, device has {}",
                cfg.shared_mem_bytes, self.props.shared_memory_per_group
            )));
        }
        self.check_view(output, "output")?;
        for view in inputs {
            self.check_view(view, "input")?;
            if HostBuffer::same_alloc(&view.buffer, &output.buffer) {
                return Err(DeviceError::InvalidLaunch(
                    "output aliases an input allocation".into(),
                ));
            }
        }

        let arity_err = || {
            DeviceError::InvalidLaunch(format!("{} given {} inputs", op.name(), inputs.len()))
        };
        let shape_err = |detail: String| DeviceError::InvalidLaunch(detail);

        match op {
            KernelOp::Conv2d(spec) => {
                if inputs.len() < 2 || inputs.len() > 3 {
                    return Err(arity_err());
                }
                let dims = inputs[0].spec.shape.dims();
                if dims.len() != 3 || dims[0] != spec.in_channels {
                    return Err(shape_err(format!(
                        "conv2d input {} does not match {} input channels",
                        inputs[0].spec.shape, spec.in_channels
                    )));
                }
                let weight_len = spec.out_channels * spec.in_channels * spec.kernel * spec.kernel;
                if inputs[1].spec.shape.num_elements() != weight_len {
                    return Err(shape_err(format!(
                        "conv2d weight {} does not hold {} elements",
                        inputs[1].spec.shape, weight_len
                    )));
                }
                if let Some(bias) = inputs.get(2) {
                    if bias.spec.shape.num_elements() != spec.out_channels {
                        return Err(shape_err(format!(
                            "conv2d bias {} does not hold {} elements",
                            bias.spec.shape, spec.out_channels
                        )));
                    }
                }
                let (oh, ow) = spec
                    .out_hw(dims[1], dims[2])
                    .ok_or_else(|| shape_err("conv2d output would be empty".into()))?;
                let expected = [spec.out_channels, oh, ow];
                if output.spec.shape.dims() != expected {
                    return Err(shape_err(format!(
                        "conv2d output {} does not match computed {:?}",
                        output.spec.shape, expected
                    )));
                }
            }
            KernelOp::Relu => {
                if inputs.len() != 1 {
                    return Err(arity_err());
                }
                if output.spec.shape != inputs[0].spec.shape {
                    return Err(shape_err(format!(
                        "relu output {} does not match input {}",
                        output.spec.shape, inputs[0].spec.shape
                    )));
                }
            }
            KernelOp::MaxPool2d(spec) => {
                if inputs.len() != 1 {
                    return Err(arity_err());
                }
                let dims = inputs[0].spec.shape.dims();
                if dims.len() != 3 {
                    return Err(shape_err(format!(
                        "max_pool2d expects a rank-3 input, got {}",
                        inputs[0].spec.shape
                    )));
                }
                let (oh, ow) = spec
                    .out_hw(dims[1], dims[2])
                    .ok_or_else(|| shape_err("max_pool2d window exceeds input".into()))?;
                let expected = [dims[0], oh, ow];
                if output.spec.shape.dims() != expected {
                    return Err(shape_err(format!(
                        "max_pool2d output {} does not match computed {:?}",
                        output.spec.shape, expected
                    )));
                }
            }
            KernelOp::Dense(spec) => {
                if inputs.len() < 2 || inputs.len() > 3 {
                    return Err(arity_err());
                }
                if inputs[0].spec.shape.num_elements() != spec.in_features {
                    return Err(shape_err(format!(
                        "dense input {} does not hold {} elements",
                        inputs[0].spec.shape, spec.in_features
                    )));
                }
                if inputs[1].spec.shape.num_elements() != spec.in_features * spec.out_features {
                    return Err(shape_err(format!(
                        "dense weight {} does not hold {} elements",
                        inputs[1].spec.shape,
                        spec.in_features * spec.out_features
                    )));
                }
                if let Some(bias) = inputs.get(2) {
                    if bias.spec.shape.num_elements() != spec.out_features {
                        return Err(shape_err(format!(
                            "dense bias {} does not hold {} elements",
                            bias.spec.shape, spec.out_features
                        )));
                    }
                }
                if output.spec.shape.num_elements() != spec.out_features {
                    return Err(shape_err(format!(
                        "dense output {} does not hold {} elements",
                        output.spec.shape, spec.out_features
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        HostDevice::new()
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "host"
    }

    fn props(&self) -> &DeviceProps {
        &self.props
    }

    fn memory_in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn alloc(&self, len: usize) -> Result<HostBuffer, DeviceError> {
        let capacity = self.props.memory_bytes;
        let mut in_use = self.used.load(Ordering::Relaxed);
        loop {
            let next = match in_use.checked_add(len) {
                Some(next) if next <= capacity => next,
                _ => {
                    return Err(DeviceError::OutOfMemory {
                        requested: len,
                        in_use,
                        capacity,
                    })
                }
            };
            match self
                .used
                .compare_exchange(in_use, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => in_use = current,
            }
        }
        let words = (len + 3) / 4;
        Ok(HostBuffer(Arc::new(BufferInner {
            data: RwLock::new(vec![0f32; words].into_boxed_slice()),
            len,
            used: Arc::clone(&self.used),
        })))
    }

    fn create_stream(&self) -> Result<StreamId, DeviceError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let id = StreamId(streams.len() as u32);
        streams.push(StreamQueue::spawn(id.0));
        Ok(id)
    }

    fn copy_to_device(
        &self,
        stream: StreamId,
        src: Vec<u8>,
        dst: &HostBuffer,
        dst_offset: usize,
    ) -> Result<(), DeviceError> {
        let end = dst_offset.checked_add(src.len()).unwrap_or(usize::MAX);
        if end > dst.len() {
            return Err(DeviceError::InvalidLaunch(format!(
                "upload of {} bytes at offset {} exceeds allocation of {} bytes",
                src.len(),
                dst_offset,
                dst.len()
            )));
        }
        let dst = dst.clone();
        self.submit(
            stream,
            Command::Task {
                label: "copy_to_device",
                run: Box::new(move || {
                    let mut data = dst.0.data.write().unwrap_or_else(|e| e.into_inner());
                    buffer_bytes_mut(&mut data, dst.0.len)[dst_offset..end].copy_from_slice(&src);
                    Ok(())
                }),
            },
        )
    }

    fn copy_to_host(
        &self,
        stream: StreamId,
        src: &HostBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<Download, DeviceError> {
        let end = src_offset.checked_add(len).unwrap_or(usize::MAX);
        if end > src.len() {
            return Err(DeviceError::InvalidLaunch(format!(
                "download of {len} bytes at offset {src_offset} exceeds allocation of {} bytes",
                src.len()
            )));
        }
        let landing = Arc::new(Mutex::new(None));
        let done = Event::new();
        let src = src.clone();
        let filled = Arc::clone(&landing);
        let sender = self.sender(stream)?;
        sender
            .send(Command::Task {
                label: "copy_to_host",
                run: Box::new(move || {
                    let data = src.0.data.read().unwrap_or_else(|e| e.into_inner());
                    let bytes = buffer_bytes(&data, src.0.len)[src_offset..end].to_vec();
                    *filled.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
                    Ok(())
                }),
            })
            .and_then(|_| sender.send(Command::Record(done.clone())))
            .map_err(|_| DeviceError::Fault(format!("{stream} worker terminated")))?;
        Ok(Download {
            bytes: landing,
            done,
        })
    }

    fn launch(
        &self,
        stream: StreamId,
        op: &KernelOp,
        cfg: &LaunchConfig,
        inputs: &[BufferView<HostBuffer>],
        output: &BufferView<HostBuffer>,
    ) -> Result<(), DeviceError> {
        self.validate_launch(op, cfg, inputs, output)?;
        let op = op.clone();
        let inputs = inputs.to_vec();
        let output = output.clone();
        let shared_limit = self.props.shared_memory_per_group;
        self.submit(
            stream,
            Command::Task {
                label: op.name(),
                run: Box::new(move || execute_op(&op, shared_limit, &inputs, &output)),
            },
        )
    }

    fn record_event(&self, stream: StreamId) -> Result<Event, DeviceError> {
        let event = Event::new();
        self.submit(stream, Command::Record(event.clone()))?;
        Ok(event)
    }

    fn wait_event(&self, stream: StreamId, event: &Event) -> Result<(), DeviceError> {
        self.submit(stream, Command::WaitFor(event.clone()))
    }

    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError> {
        let (ack, done) = mpsc::sync_channel(1);
        self.submit(stream, Command::Synchronize(ack))?;
        match done.recv() {
            Ok(Some(fault)) => Err(fault),
            Ok(None) => Ok(()),
            Err(_) => Err(DeviceError::Fault(format!("{stream} worker terminated"))),
        }
    }
}

/// Runs one validated kernel against locked buffer regions. Inputs sharing
/// an allocation are locked once; validation guarantees the output
/// allocation is distinct from every input.
fn execute_op(
    op: &KernelOp,
    shared_limit: usize,
    inputs: &[BufferView<HostBuffer>],
    output: &BufferView<HostBuffer>,
) -> Result<(), DeviceError> {
    let mut unique: Vec<&HostBuffer> = Vec::new();
    let mut regions: Vec<(usize, usize, usize)> = Vec::new();
    for view in inputs {
        let slot = match unique
            .iter()
            .position(|held| HostBuffer::same_alloc(held, &view.buffer))
        {
            Some(slot) => slot,
            None => {
                unique.push(&view.buffer);
                unique.len() - 1
            }
        };
        let start = view.offset / 4;
        regions.push((slot, start, view.byte_len() / 4));
    }

    let guards: Vec<_> = unique
        .iter()
        .map(|buffer| buffer.0.data.read().unwrap_or_else(|e| e.into_inner()))
        .collect();
    let views: Vec<&[f32]> = regions
        .iter()
        .map(|&(slot, start, len)| &guards[slot][start..start + len])
        .collect();

    let mut out_guard = output
        .buffer
        .0
        .data
        .write()
        .unwrap_or_else(|e| e.into_inner());
    let out_start = output.offset / 4;
    let out = &mut out_guard[out_start..out_start + output.byte_len() / 4];

    match op {
        KernelOp::Conv2d(spec) => {
            let dims = inputs[0].spec.shape.dims();
            let out_dims = output.spec.shape.dims();
            kernels::conv::run_conv2d(
                spec,
                shared_limit,
                views[0],
                dims[1],
                dims[2],
                views[1],
                views.get(2).copied(),
                out,
                out_dims[1],
                out_dims[2],
            );
        }
        KernelOp::Relu => kernels::elementwise::run_relu(views[0], out),
        KernelOp::MaxPool2d(spec) => {
            let dims = inputs[0].spec.shape.dims();
            let out_dims = output.spec.shape.dims();
            kernels::pool::run_max_pool2d(
                spec,
                views[0],
                dims[0],
                dims[1],
                dims[2],
                out,
                out_dims[1],
                out_dims[2],
            );
        }
        KernelOp::Dense(spec) => {
            kernels::dense::run_dense(spec, views[0], views[1], views.get(2).copied(), out)
        }
    }
    Ok(())
}

/// Views `f32` backing words as bytes. The store is valid for `len` bytes
/// and `u8` carries no alignment requirement.
fn buffer_bytes(data: &[f32], len: usize) -> &[u8] {
    // SAFETY: `data` owns at least `len` bytes of initialized storage and
    // every bit pattern is a valid `u8`.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

fn buffer_bytes_mut(data: &mut [f32], len: usize) -> &mut [u8] {
    // SAFETY: as in `buffer_bytes`; every bit pattern is also a valid
    // `f32`, so arbitrary byte writes cannot corrupt the store.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, len) }
}
