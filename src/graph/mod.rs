//! Execution graphs.
//!
//! A graph is an ordered list of layers with explicit data edges. `compile`
//! turns it into an immutable plan: inferred shapes, a physical buffer
//! assignment that recycles memory once a value's last reader has run, a
//! stream schedule with joins only at true dependencies, and uploaded
//! parameters. `run` replays the plan against a context; a failed run
//! leaves the plan intact for retry.

mod plan;
mod run;

use std::time::Instant;

use crate::context::ExecContext;
use crate::device::{Device, HostDevice};
use crate::error::{Error, Result};
use crate::layers::Layer;
use crate::tensor::{DeviceTensor, Shape};
use crate::trace::CompileStats;

pub use plan::PlanSummary;

use plan::{compile_plan, Plan};

/// Handle to one node of a graph, valid only for the graph that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub(crate) enum SourceRef {
    /// The graph input tensor.
    Input,
    /// Output of an earlier node.
    Node(usize),
}

pub(crate) struct GraphNode<D: Device> {
    pub(crate) layer: Box<dyn Layer<D>>,
    pub(crate) parent: SourceRef,
}

/// A network under construction, and after [`ExecutionGraph::compile`] a
/// runnable plan.
///
/// Structural edits drop the plan; the graph must be recompiled before the
/// next run.
pub struct ExecutionGraph<D: Device = HostDevice> {
    nodes: Vec<GraphNode<D>>,
    plan: Option<Plan>,
    weights: Vec<Vec<DeviceTensor>>,
}

impl<D: Device> Default for ExecutionGraph<D> {
    fn default() -> Self {
        ExecutionGraph::new()
    }
}

impl<D: Device> ExecutionGraph<D> {
    pub fn new() -> Self {
        ExecutionGraph {
            nodes: Vec::new(),
            plan: None,
            weights: Vec::new(),
        }
    }

    /// Builds a plain chain: each layer consumes the previous one's output.
    pub fn sequential(layers: Vec<Box<dyn Layer<D>>>) -> Self {
        let mut graph = ExecutionGraph::new();
        for layer in layers {
            graph.push(layer);
        }
        graph
    }

    /// Appends a layer consuming the most recently added node, or the graph
    /// input for the first node. Drops any compiled plan.
    pub fn push(&mut self, layer: Box<dyn Layer<D>>) -> NodeId {
        let parent = match self.nodes.len() {
            0 => SourceRef::Input,
            n => SourceRef::Node(n - 1),
        };
        self.insert(layer, parent)
    }

    /// Appends a layer consuming the output of `parent`, which must belong
    /// to this graph. Drops any compiled plan.
    pub fn push_after(&mut self, parent: NodeId, layer: Box<dyn Layer<D>>) -> NodeId {
        assert!(
            parent.0 < self.nodes.len(),
            "parent node #{} does not exist in this graph",
            parent.0
        );
        self.insert(layer, SourceRef::Node(parent.0))
    }

    fn insert(&mut self, layer: Box<dyn Layer<D>>, parent: SourceRef) -> NodeId {
        self.plan = None;
        let id = NodeId(self.nodes.len());
        self.nodes.push(GraphNode { layer, parent });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn compiled(&self) -> bool {
        self.plan.is_some()
    }

    /// Deterministic description of the compiled plan, if any.
    pub fn plan_summary(&self) -> Option<&PlanSummary> {
        self.plan.as_ref().map(|plan| &plan.summary)
    }

    /// Infers shapes, assigns physical buffers and a stream schedule, and
    /// uploads layer parameters. On failure the graph holds no plan and no
    /// device memory; nothing of a failed compile survives.
    pub fn compile(&mut self, ctx: &mut ExecContext<D>, input_shape: &Shape) -> Result<()> {
        let started = Instant::now();
        self.discard_plan(ctx);

        let (device, arena, streams, trace) = ctx.parts();
        let plan = compile_plan(
            &self.nodes,
            input_shape,
            streams.len(),
            device.props(),
            arena.id(),
        )?;

        let upload_stream = streams[0];
        let mut scope = arena.scope();
        let mut weights = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut bound = Vec::new();
            for param in node.layer.parameters() {
                let uploaded = scope
                    .upload(param, upload_stream)
                    .map_err(Error::compile_from)?;
                bound.push(uploaded);
            }
            weights.push(bound);
        }
        scope.commit();

        if let Some(sink) = trace {
            let mut used = plan.summary.step_streams.clone();
            used.sort_unstable();
            used.dedup();
            sink.compile_finished(&CompileStats {
                layers: self.nodes.len(),
                slots: plan.slots.len(),
                physical_buffers: plan.physical.len(),
                peak_bytes: plan.summary.total_physical_bytes,
                weight_bytes: plan.weight_bytes,
                streams_used: used.len(),
                duration: started.elapsed(),
            });
        }

        self.plan = Some(plan);
        self.weights = weights;
        Ok(())
    }

    /// Releases the plan and the device-resident parameters it bound.
    pub fn discard_plan(&mut self, ctx: &mut ExecContext<D>) {
        self.plan = None;
        let arena = ctx.arena_mut();
        for bound in self.weights.drain(..) {
            for tensor in bound {
                arena.release(&tensor);
            }
        }
    }
}
