//! Plan execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::ExecContext;
use crate::device::{BufferView, Device, Download, Event, StreamId};
use crate::error::{Error, Result};
use crate::layers::Launch;
use crate::memory::{AllocId, Arena};
use crate::tensor::{DeviceTensor, HostTensor};
use crate::trace::{LaunchRecord, RunStats, TraceSink};

use super::plan::{Join, Plan};
use super::{ExecutionGraph, GraphNode};

impl<D: Device> ExecutionGraph<D> {
    /// Runs the compiled plan and returns the primary output, the last
    /// leaf in node order.
    pub fn run(&self, ctx: &mut ExecContext<D>, input: &HostTensor) -> Result<HostTensor> {
        let mut outputs = self.run_all(ctx, input)?;
        match outputs.pop() {
            Some(primary) => Ok(primary),
            None => unreachable!("a compiled plan always has at least one output"),
        }
    }

    /// Runs the compiled plan and returns every leaf output in node order.
    ///
    /// Intermediate blocks are acquired per run and returned to the arena
    /// on success and on every error path, always after the streams have
    /// drained. A failed run leaves the plan intact for retry.
    pub fn run_all(&self, ctx: &mut ExecContext<D>, input: &HostTensor) -> Result<Vec<HostTensor>> {
        let plan = self.plan.as_ref().ok_or(Error::NotCompiled)?;
        let started = Instant::now();
        let (device, arena, streams, trace) = ctx.parts();
        if plan.arena_id != arena.id() {
            return Err(Error::NotCompiled);
        }
        check_input(plan, input)?;

        let mut stats = RunStats {
            launches: 0,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            sync_points: 0,
            duration: Duration::ZERO,
        };

        // Every intermediate block is acquired before anything is issued,
        // so an out-of-memory answer arrives with no work in flight.
        let mut scope = arena.scope();
        let mut physical = Vec::with_capacity(plan.physical.len());
        for &bytes in &plan.physical {
            physical.push(scope.acquire_bytes(bytes)?);
        }

        // The scope holds the blocks until the streams below have drained;
        // only then may they return to the free list.
        let issued = issue(
            device.as_ref(),
            scope.arena(),
            streams,
            plan,
            &self.nodes,
            &self.weights,
            &physical,
            input,
            trace,
            &mut stats,
        );
        let mut sync_failure = None;
        for &stream in streams {
            if let Err(err) = device.synchronize(stream) {
                sync_failure.get_or_insert_with(|| Error::launch("synchronize", err.to_string()));
            }
        }
        stats.sync_points += streams.len();
        drop(scope);

        let downloads = issued?;
        if let Some(err) = sync_failure {
            return Err(err);
        }

        let mut outputs = Vec::with_capacity(downloads.len());
        for (download, &slot) in downloads.into_iter().zip(&plan.outputs) {
            let bytes = download
                .wait()
                .map_err(|err| Error::launch("download", err.to_string()))?;
            stats.bytes_downloaded += bytes.len();
            let spec = &plan.slots[slot].spec;
            let tensor = HostTensor::from_bytes(spec.shape.clone(), spec.dtype, bytes)
                .map_err(|err| Error::launch("download", err.to_string()))?;
            outputs.push(tensor);
        }

        if let Some(sink) = trace {
            stats.duration = started.elapsed();
            sink.run_finished(&stats);
        }
        Ok(outputs)
    }
}

fn check_input(plan: &Plan, input: &HostTensor) -> Result<()> {
    let spec = &plan.input_spec;
    if input.dtype() != spec.dtype {
        return Err(Error::ShapeMismatch {
            layer: 0,
            expected: format!("{} {}", spec.dtype, spec.shape),
            actual: format!("{} {}", input.dtype(), input.shape()),
        });
    }
    if input.shape() != &spec.shape {
        return Err(Error::ShapeMismatch {
            layer: 0,
            expected: spec.shape.to_string(),
            actual: input.shape().to_string(),
        });
    }
    Ok(())
}

/// Issues the whole schedule: input upload, per-step joins and launches,
/// leaf readbacks. Enqueue-only; the caller synchronizes.
#[allow(clippy::too_many_arguments)]
fn issue<D: Device>(
    device: &D,
    arena: &Arena<D>,
    streams: &[StreamId],
    plan: &Plan,
    nodes: &[GraphNode<D>],
    weights: &[Vec<DeviceTensor>],
    physical: &[(AllocId, u64)],
    input: &HostTensor,
    trace: Option<&Arc<dyn TraceSink>>,
    stats: &mut RunStats,
) -> Result<Vec<Download>> {
    let slot_tensors: Vec<DeviceTensor> = plan
        .slots
        .iter()
        .map(|slot| {
            let (alloc, generation) = physical[slot.physical];
            DeviceTensor::new(slot.spec.clone(), alloc, generation, 0)
        })
        .collect();

    let input_view = arena.view(&slot_tensors[0]);
    device
        .copy_to_device(
            streams[0],
            input.bytes().to_vec(),
            &input_view.buffer,
            input_view.offset,
        )
        .map_err(|err| Error::launch("upload", err.to_string()))?;
    stats.bytes_uploaded += input.byte_len();
    let input_event = if plan.needs_input_event {
        let event = device
            .record_event(streams[0])
            .map_err(|err| Error::launch("upload", err.to_string()))?;
        Some(event)
    } else {
        None
    };

    let mut step_events: Vec<Option<Event>> = Vec::new();
    step_events.resize_with(plan.steps.len(), || None);
    for (idx, step) in plan.steps.iter().enumerate() {
        let stream = streams[step.stream];
        for join in &step.waits {
            let event = match join {
                Join::AfterInput => input_event.as_ref(),
                Join::AfterStep(j) => step_events[*j].as_ref(),
            };
            debug_assert!(event.is_some(), "plan join targets an unrecorded event");
            if let Some(event) = event {
                device
                    .wait_event(stream, event)
                    .map_err(|err| Error::launch(step.label, err.to_string()))?;
                stats.sync_points += 1;
            }
        }

        let input_view = arena.view(&slot_tensors[step.input_slot]);
        let output_view = arena.view(&slot_tensors[step.output_slot]);
        let params: Vec<BufferView<D::Buffer>> = weights[step.node]
            .iter()
            .map(|tensor| arena.view(tensor))
            .collect();
        let launch = Launch {
            device,
            stream,
            cfg: &step.cfg,
            input: &input_view,
            output: &output_view,
            params: &params,
        };
        nodes[step.node]
            .layer
            .forward(&launch)
            .map_err(|err| Error::launch(step.label, err.to_string()))?;
        stats.launches += 1;
        if let Some(sink) = trace {
            sink.kernel_launched(&LaunchRecord {
                step: idx,
                layer: step.label,
                stream,
                grid: step.cfg.grid,
                block: step.cfg.block,
            });
        }
        if step.record_event {
            let event = device
                .record_event(stream)
                .map_err(|err| Error::launch(step.label, err.to_string()))?;
            step_events[idx] = Some(event);
        }
    }

    // Leaf readbacks issue on their writers' streams, ordered behind the
    // final writes by issue order.
    let mut downloads = Vec::with_capacity(plan.outputs.len());
    for &slot in &plan.outputs {
        let stream = match plan.slots[slot].writer {
            Some(writer) => streams[plan.steps[writer].stream],
            None => streams[0],
        };
        let view = arena.view(&slot_tensors[slot]);
        let byte_len = slot_tensors[slot].byte_len();
        let download = device
            .copy_to_host(stream, &view.buffer, view.offset, byte_len)
            .map_err(|err| Error::launch("download", err.to_string()))?;
        downloads.push(download);
    }
    Ok(downloads)
}
