use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use peregrine::kernels::reference;
use peregrine::{
    BufferView, Conv2DLayer, DType, DenseLayer, Device, DeviceError, DeviceProps, Download, Error,
    Event, ExecContext, ExecutionGraph, HostBuffer, HostDevice, HostTensor, KernelOp, LaunchConfig,
    MaxPoolLayer, ReLULayer, Shape, StreamId,
};

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let tol = 1e-4 * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tol,
            "element {i}: {a} differs from {e} by more than {tol}"
        );
    }
}

fn reference_pipeline(
    input: &HostTensor,
    conv_w: &HostTensor,
    conv_b: &HostTensor,
) -> Result<HostTensor> {
    let conv = reference::conv2d(input, conv_w, Some(conv_b), 1, 1)?;
    let relu = reference::relu(&conv);
    Ok(reference::max_pool2d(&relu, 2, 2)?)
}

#[test]
fn pipeline_matches_the_reference_composition() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(51);
    let input = HostTensor::randn_from(&mut rng, Shape::new([3, 32, 32]));
    let conv_w = HostTensor::randn_from(&mut rng, Shape::new([8, 3, 3, 3]));
    let conv_b = HostTensor::randn_from(&mut rng, Shape::new([8]));
    let expected = reference_pipeline(&input, &conv_w, &conv_b)?;

    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(conv_w, Some(conv_b), 1, 1)?));
    graph.push(Box::new(ReLULayer::new()));
    graph.push(Box::new(MaxPoolLayer::new(2, 2)?));
    graph.compile(&mut ctx, input.shape())?;

    let out = graph.run(&mut ctx, &input)?;
    assert_eq!(out.shape().dims(), [8, 16, 16]);
    assert_close(out.as_f32(), expected.as_f32());
    Ok(())
}

#[test]
fn repeated_runs_are_bit_identical() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(52);
    let input = HostTensor::randn_from(&mut rng, Shape::new([3, 16, 16]));
    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(
        HostTensor::randn_from(&mut rng, Shape::new([4, 3, 3, 3])),
        Some(HostTensor::randn_from(&mut rng, Shape::new([4]))),
        1,
        1,
    )?));
    graph.push(Box::new(ReLULayer::new()));
    graph.compile(&mut ctx, input.shape())?;

    let first = graph.run(&mut ctx, &input)?;
    let second = graph.run(&mut ctx, &input)?;
    assert_eq!(first.bytes(), second.bytes(), "replays must be bit identical");
    Ok(())
}

#[test]
fn running_before_compile_is_rejected() -> Result<()> {
    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(ReLULayer::new()));

    let input = HostTensor::zeros(Shape::new([2, 4, 4]), DType::F32);
    let err = graph.run(&mut ctx, &input).expect_err("never compiled");
    assert!(matches!(err, Error::NotCompiled));
    Ok(())
}

#[test]
fn input_shape_is_checked_at_run() -> Result<()> {
    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(ReLULayer::new()));
    graph.compile(&mut ctx, &Shape::new([3, 32, 32]))?;

    let wrong = HostTensor::zeros(Shape::new([3, 16, 16]), DType::F32);
    let err = graph.run(&mut ctx, &wrong).expect_err("shape differs from the plan");
    assert!(matches!(err, Error::ShapeMismatch { layer: 0, .. }));
    let text = err.to_string();
    assert!(text.contains("[3, 32, 32]"), "unexpected message: {text}");
    assert!(text.contains("[3, 16, 16]"), "unexpected message: {text}");
    Ok(())
}

/// Delegates everything to an in-process device but fails the next
/// `failures_left` kernel launches at issue time.
struct FaultyDevice {
    inner: HostDevice,
    failures_left: AtomicUsize,
}

impl FaultyDevice {
    fn new(failures: usize) -> Self {
        FaultyDevice {
            inner: HostDevice::new(),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

impl Device for FaultyDevice {
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "faulty-host"
    }

    fn props(&self) -> &DeviceProps {
        self.inner.props()
    }

    fn memory_in_use(&self) -> usize {
        self.inner.memory_in_use()
    }

    fn alloc(&self, len: usize) -> std::result::Result<HostBuffer, DeviceError> {
        self.inner.alloc(len)
    }

    fn create_stream(&self) -> std::result::Result<StreamId, DeviceError> {
        self.inner.create_stream()
    }

    fn copy_to_device(
        &self,
        stream: StreamId,
        src: Vec<u8>,
        dst: &HostBuffer,
        dst_offset: usize,
    ) -> std::result::Result<(), DeviceError> {
        self.inner.copy_to_device(stream, src, dst, dst_offset)
    }

    fn copy_to_host(
        &self,
        stream: StreamId,
        src: &HostBuffer,
        src_offset: usize,
        len: usize,
    ) -> std::result::Result<Download, DeviceError> {
        self.inner.copy_to_host(stream, src, src_offset, len)
    }

    fn launch(
        &self,
        stream: StreamId,
        op: &KernelOp,
        cfg: &LaunchConfig,
        inputs: &[BufferView<HostBuffer>],
        output: &BufferView<HostBuffer>,
    ) -> std::result::Result<(), DeviceError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(DeviceError::InvalidLaunch("injected launch failure".into()));
        }
        self.inner.launch(stream, op, cfg, inputs, output)
    }

    fn record_event(&self, stream: StreamId) -> std::result::Result<Event, DeviceError> {
        self.inner.record_event(stream)
    }

    fn wait_event(&self, stream: StreamId, event: &Event) -> std::result::Result<(), DeviceError> {
        self.inner.wait_event(stream, event)
    }

    fn synchronize(&self, stream: StreamId) -> std::result::Result<(), DeviceError> {
        self.inner.synchronize(stream)
    }
}

#[test]
fn launch_faults_fail_the_run_but_keep_the_plan() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(53);
    let input = HostTensor::randn_from(&mut rng, Shape::new([3, 16, 16]));
    let conv_w = HostTensor::randn_from(&mut rng, Shape::new([4, 3, 3, 3]));
    let conv_b = HostTensor::randn_from(&mut rng, Shape::new([4]));
    let expected = {
        let conv = reference::conv2d(&input, &conv_w, Some(&conv_b), 1, 1)?;
        reference::relu(&conv)
    };

    let mut ctx = ExecContext::new(Arc::new(FaultyDevice::new(1)))?;
    let mut graph: ExecutionGraph<FaultyDevice> = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(conv_w, Some(conv_b), 1, 1)?));
    graph.push(Box::new(ReLULayer::new()));
    graph.compile(&mut ctx, input.shape())?;
    let live_before = ctx.arena().stats().live_bytes;

    let err = graph.run(&mut ctx, &input).expect_err("first launch is rigged");
    assert!(matches!(err, Error::KernelLaunch { .. }));
    assert!(err.to_string().contains("injected launch failure"));

    // The fault costs one run, not the plan or any memory.
    assert!(graph.compiled());
    assert_eq!(ctx.arena().stats().live_bytes, live_before);
    let out = graph.run(&mut ctx, &input)?;
    assert_close(out.as_f32(), expected.as_f32());
    Ok(())
}

#[test]
fn classifier_produces_class_scores() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(54);
    let input = HostTensor::randn_from(&mut rng, Shape::new([3, 32, 32]));

    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(
        HostTensor::randn_from(&mut rng, Shape::new([8, 3, 3, 3])),
        Some(HostTensor::randn_from(&mut rng, Shape::new([8]))),
        1,
        1,
    )?));
    graph.push(Box::new(ReLULayer::new()));
    graph.push(Box::new(MaxPoolLayer::new(2, 2)?));
    graph.push(Box::new(DenseLayer::new(
        HostTensor::randn_from(&mut rng, Shape::new([10, 8 * 16 * 16])),
        Some(HostTensor::randn_from(&mut rng, Shape::new([10]))),
    )?));
    graph.compile(&mut ctx, input.shape())?;

    let scores = graph.run(&mut ctx, &input)?;
    assert_eq!(scores.shape().dims(), [10]);
    let (class, score) = scores.argmax().ok_or_else(|| anyhow::anyhow!("empty output"))?;
    assert!(class < 10);
    assert!(score.is_finite());
    Ok(())
}
