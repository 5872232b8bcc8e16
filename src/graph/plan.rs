//! Plan construction.
//!
//! Compilation walks the node list once per concern: shape inference,
//! liveness, stream assignment, then physical buffer assignment. The
//! result is a fixed schedule; `run` performs no planning of its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceProps, TensorSpec};
use crate::error::{Error, Result};
use crate::kernels::LaunchConfig;
use crate::tensor::Shape;

use super::{GraphNode, SourceRef};

/// Ordering dependency of one step on earlier work. Emitted only when the
/// two sides run on different streams; same-stream ordering comes free
/// from issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Join {
    /// The input upload, issued on the first stream.
    AfterInput,
    /// A previously issued step, by index into the step list.
    AfterStep(usize),
}

#[derive(Debug)]
pub(crate) struct PlanStep {
    pub(crate) node: usize,
    pub(crate) input_slot: usize,
    pub(crate) output_slot: usize,
    pub(crate) label: &'static str,
    pub(crate) cfg: LaunchConfig,
    pub(crate) stream: usize,
    pub(crate) waits: Vec<Join>,
    /// Some later step joins on this one; run records an event after it.
    pub(crate) record_event: bool,
}

/// One logical value: the graph input (slot 0) or a node output
/// (slot `node + 1`).
#[derive(Debug)]
pub(crate) struct SlotPlan {
    pub(crate) spec: TensorSpec,
    pub(crate) bytes: usize,
    /// Index into `Plan::physical`.
    pub(crate) physical: usize,
    /// Step producing this value; `None` for the input slot.
    pub(crate) writer: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Plan {
    /// Arena the plan's block sizes were decided for. Running against a
    /// different arena is rejected.
    pub(crate) arena_id: u64,
    pub(crate) input_spec: TensorSpec,
    pub(crate) slots: Vec<SlotPlan>,
    /// Byte size of each physical block a run acquires.
    pub(crate) physical: Vec<usize>,
    pub(crate) steps: Vec<PlanStep>,
    /// Leaf slots in node order; the last entry is the primary output.
    pub(crate) outputs: Vec<usize>,
    pub(crate) needs_input_event: bool,
    pub(crate) weight_bytes: usize,
    pub(crate) summary: PlanSummary,
}

/// Serializable description of a compiled plan. Compiling the same graph
/// against the same stream count yields an identical summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// One entry per step: label with input and output shapes.
    pub layers: Vec<String>,
    pub slot_bytes: Vec<usize>,
    /// Physical block index backing each slot.
    pub slot_physical: Vec<usize>,
    pub physical_bytes: Vec<usize>,
    /// Intermediate bytes a run holds at once.
    pub total_physical_bytes: usize,
    pub step_streams: Vec<usize>,
    pub cross_stream_joins: usize,
}

pub(crate) fn compile_plan<D: Device>(
    nodes: &[GraphNode<D>],
    input_shape: &Shape,
    stream_count: usize,
    props: &DeviceProps,
    arena_id: u64,
) -> Result<Plan> {
    if nodes.is_empty() {
        return Err(Error::compile_msg("graph has no layers"));
    }
    let stream_count = stream_count.max(1);

    // Shape inference. Slot 0 is the graph input; node i writes slot i+1.
    let input_spec = TensorSpec::f32(input_shape.clone());
    let mut slots = Vec::with_capacity(nodes.len() + 1);
    slots.push(SlotPlan {
        bytes: slot_bytes(&input_spec, 0)?,
        spec: input_spec.clone(),
        physical: usize::MAX,
        writer: None,
    });
    let mut steps = Vec::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        let input_slot = match node.parent {
            SourceRef::Input => 0,
            SourceRef::Node(j) => {
                debug_assert!(j < i, "graph nodes must be topologically ordered");
                j + 1
            }
        };
        let in_shape = slots[input_slot].spec.shape.clone();
        let out_shape = node
            .layer
            .output_shape(&in_shape)
            .map_err(|info| Error::compile_from(info.at_layer(i)))?;
        let cfg = node.layer.plan_launch(&out_shape, props);
        let spec = TensorSpec::f32(out_shape);
        slots.push(SlotPlan {
            bytes: slot_bytes(&spec, i)?,
            spec,
            physical: usize::MAX,
            writer: Some(i),
        });
        steps.push(PlanStep {
            node: i,
            input_slot,
            output_slot: i + 1,
            label: node.layer.label(),
            cfg,
            stream: 0,
            waits: Vec::new(),
            record_event: false,
        });
    }

    // Liveness: which steps read each slot, and the last of them. Leaves
    // are pinned until readback.
    let mut readers: Vec<Vec<usize>> = vec![Vec::new(); slots.len()];
    for (i, step) in steps.iter().enumerate() {
        readers[step.input_slot].push(i);
    }
    let last_use: Vec<usize> = readers
        .iter()
        .map(|r| r.last().copied().unwrap_or(usize::MAX))
        .collect();

    // Stream assignment: the first reader of a value stays on its writer's
    // stream, further readers fan out round-robin.
    let mut slot_stream = vec![0usize; slots.len()];
    let mut seen_reader = vec![false; slots.len()];
    let mut rr = 0usize;
    for i in 0..steps.len() {
        let parent = steps[i].input_slot;
        let stream = if seen_reader[parent] {
            rr = (rr + 1) % stream_count;
            rr
        } else {
            seen_reader[parent] = true;
            slot_stream[parent]
        };
        steps[i].stream = stream;
        slot_stream[steps[i].output_slot] = stream;
    }

    // True-dependency joins: a step waits on its producer only when the
    // producer ran on another stream.
    let mut needs_input_event = false;
    for i in 0..steps.len() {
        let parent = steps[i].input_slot;
        match slots[parent].writer {
            None => {
                if steps[i].stream != 0 {
                    steps[i].waits.push(Join::AfterInput);
                    needs_input_event = true;
                }
            }
            Some(writer) => {
                if steps[writer].stream != steps[i].stream {
                    steps[i].waits.push(Join::AfterStep(writer));
                }
            }
        }
    }

    // Physical assignment, greedy over exact byte sizes. A block frees
    // once its occupant's last reader has issued strictly earlier, which
    // keeps a step from ever writing the block it is reading. Reusing a
    // block adds write-after-read joins against the previous occupant's
    // readers on other streams.
    let mut physical: Vec<usize> = vec![slots[0].bytes];
    let mut occupant: Vec<usize> = vec![0];
    slots[0].physical = 0;
    let mut avail: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut freed = vec![false; slots.len()];
    for i in 0..steps.len() {
        for s in 0..slots.len() {
            if !freed[s] && slots[s].physical != usize::MAX && last_use[s] < i {
                freed[s] = true;
                avail.entry(slots[s].bytes).or_default().push(slots[s].physical);
            }
        }
        let out = steps[i].output_slot;
        let bytes = slots[out].bytes;
        let phys = match avail.get_mut(&bytes).and_then(|bucket| bucket.pop()) {
            Some(phys) => {
                let my_stream = steps[i].stream;
                let prev = occupant[phys];
                for r in 0..readers[prev].len() {
                    let reader = readers[prev][r];
                    if steps[reader].stream != my_stream {
                        let join = Join::AfterStep(reader);
                        if !steps[i].waits.contains(&join) {
                            steps[i].waits.push(join);
                        }
                    }
                }
                phys
            }
            None => {
                let phys = physical.len();
                physical.push(bytes);
                occupant.push(out);
                phys
            }
        };
        occupant[phys] = out;
        slots[out].physical = phys;
    }

    // Steps that are join targets record an event when run.
    let mut flagged = Vec::new();
    for step in &steps {
        for join in &step.waits {
            if let Join::AfterStep(j) = join {
                flagged.push(*j);
            }
        }
    }
    for j in flagged {
        steps[j].record_event = true;
    }

    let outputs: Vec<usize> = (1..slots.len()).filter(|&s| readers[s].is_empty()).collect();

    let weight_bytes = nodes
        .iter()
        .map(|node| {
            node.layer
                .parameters()
                .iter()
                .map(|p| p.byte_len())
                .sum::<usize>()
        })
        .sum();

    let summary = PlanSummary {
        layers: steps
            .iter()
            .map(|step| {
                format!(
                    "{} {} -> {}",
                    step.label, slots[step.input_slot].spec.shape, slots[step.output_slot].spec.shape
                )
            })
            .collect(),
        slot_bytes: slots.iter().map(|s| s.bytes).collect(),
        slot_physical: slots.iter().map(|s| s.physical).collect(),
        physical_bytes: physical.clone(),
        total_physical_bytes: physical.iter().sum(),
        step_streams: steps.iter().map(|s| s.stream).collect(),
        cross_stream_joins: steps.iter().map(|s| s.waits.len()).sum(),
    };

    Ok(Plan {
        arena_id,
        input_spec,
        slots,
        physical,
        steps,
        outputs,
        needs_input_event,
        weight_bytes,
        summary,
    })
}

fn slot_bytes(spec: &TensorSpec, layer: usize) -> Result<usize> {
    spec.byte_len().ok_or_else(|| {
        Error::compile_msg(format!(
            "layer {layer}: {} overflows device addressing",
            spec.shape
        ))
    })
}
