use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use peregrine::{
    ContextOptions, Conv2DLayer, DenseLayer, DeviceProps, Error, ExecContext, ExecutionGraph,
    HostDevice, HostTensor, MaxPoolLayer, ReLULayer, Shape,
};

fn classifier(rng: &mut StdRng) -> Result<ExecutionGraph> {
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(
        HostTensor::randn_from(rng, Shape::new([8, 3, 3, 3])),
        Some(HostTensor::randn_from(rng, Shape::new([8]))),
        1,
        1,
    )?));
    graph.push(Box::new(ReLULayer::new()));
    graph.push(Box::new(MaxPoolLayer::new(2, 2)?));
    graph.push(Box::new(DenseLayer::new(
        HostTensor::randn_from(rng, Shape::new([10, 8 * 16 * 16])),
        Some(HostTensor::randn_from(rng, Shape::new([10]))),
    )?));
    Ok(graph)
}

#[test]
fn summaries_are_deterministic_across_compiles() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(41);
    let mut ctx = ExecContext::with_options(
        Arc::new(HostDevice::new()),
        ContextOptions {
            streams: 2,
            trace: None,
        },
    )?;
    let mut graph = classifier(&mut rng)?;
    let input_shape = Shape::new([3, 32, 32]);

    graph.compile(&mut ctx, &input_shape)?;
    let first = graph.plan_summary().cloned().ok_or_else(|| anyhow::anyhow!("no summary"))?;
    let first_json = serde_json::to_string(&first)?;

    graph.compile(&mut ctx, &input_shape)?;
    let second = graph.plan_summary().cloned().ok_or_else(|| anyhow::anyhow!("no summary"))?;
    let second_json = serde_json::to_string(&second)?;

    assert_eq!(first, second);
    assert_eq!(first_json, second_json);
    assert_eq!(first.layers.len(), 4);
    assert!(first.layers[0].starts_with("conv2d"));
    Ok(())
}

#[test]
fn shape_conflicts_name_the_layer_and_both_shapes() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(ReLULayer::new()));
    graph.push(Box::new(Conv2DLayer::new(
        HostTensor::randn_from(&mut rng, Shape::new([8, 3, 3, 3])),
        None,
        1,
        1,
    )?));

    let err = graph
        .compile(&mut ctx, &Shape::new([4, 32, 32]))
        .expect_err("conv wants 3 channels");
    assert!(matches!(err, Error::GraphCompile { .. }));
    let text = err.to_string();
    assert!(text.contains("layer 1"), "unexpected message: {text}");
    assert!(text.contains("[3, 32, 32]"), "unexpected message: {text}");
    assert!(text.contains("[4, 32, 32]"), "unexpected message: {text}");

    // Nothing of the failed compile survives.
    assert!(!graph.compiled());
    assert_eq!(ctx.arena().stats().live_bytes, 0);
    let run_err = graph
        .run(&mut ctx, &HostTensor::zeros(Shape::new([4, 32, 32]), peregrine::DType::F32))
        .expect_err("no plan to run");
    assert!(matches!(run_err, Error::NotCompiled));
    Ok(())
}

#[test]
fn compile_failures_release_partial_weight_uploads() -> Result<()> {
    // The 16 byte kernel fits, the 4 byte bias on top of it does not.
    let device = Arc::new(HostDevice::with_props(DeviceProps {
        memory_bytes: 16,
        ..DeviceProps::default()
    }));
    let mut ctx = ExecContext::new(device)?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(
        HostTensor::from_vec(Shape::new([1, 1, 2, 2]), vec![1.0, 0.0, 0.0, 1.0])?,
        Some(HostTensor::from_vec(Shape::new([1]), vec![0.5])?),
        2,
        0,
    )?));

    let err = graph
        .compile(&mut ctx, &Shape::new([1, 4, 4]))
        .expect_err("weights exceed the budget");
    assert!(matches!(err, Error::GraphCompile { .. }));
    assert!(!graph.compiled());
    assert_eq!(ctx.arena().stats().live_bytes, 0);
    Ok(())
}

#[test]
fn relu_chains_ping_pong_between_two_physical_blocks() -> Result<()> {
    let mut ctx = ExecContext::with_options(
        Arc::new(HostDevice::new()),
        ContextOptions {
            streams: 1,
            trace: None,
        },
    )?;
    let mut graph = ExecutionGraph::new();
    for _ in 0..4 {
        graph.push(Box::new(ReLULayer::new()));
    }
    graph.compile(&mut ctx, &Shape::new([4, 8, 8]))?;

    let summary = graph.plan_summary().ok_or_else(|| anyhow::anyhow!("no summary"))?;
    assert_eq!(summary.physical_bytes, vec![1024, 1024]);
    assert_eq!(summary.total_physical_bytes, 2048);
    assert_eq!(summary.slot_physical, vec![0, 1, 0, 1, 0]);
    Ok(())
}

#[test]
fn structural_edits_drop_the_plan() -> Result<()> {
    let mut ctx = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(ReLULayer::new()));
    graph.compile(&mut ctx, &Shape::new([2, 4, 4]))?;
    assert!(graph.compiled());

    graph.push(Box::new(ReLULayer::new()));
    assert!(!graph.compiled());

    let input = HostTensor::zeros(Shape::new([2, 4, 4]), peregrine::DType::F32);
    let err = graph.run(&mut ctx, &input).expect_err("plan was dropped");
    assert!(matches!(err, Error::NotCompiled));
    Ok(())
}

#[test]
fn plans_are_bound_to_their_context() -> Result<()> {
    let mut compiled_in = ExecContext::host()?;
    let mut other = ExecContext::host()?;
    let mut graph = ExecutionGraph::new();
    graph.push(Box::new(ReLULayer::new()));
    graph.compile(&mut compiled_in, &Shape::new([2, 4, 4]))?;

    let input = HostTensor::zeros(Shape::new([2, 4, 4]), peregrine::DType::F32);
    let err = graph
        .run(&mut other, &input)
        .expect_err("foreign context must be rejected");
    assert!(matches!(err, Error::NotCompiled));

    // The original context still runs the plan.
    graph.run(&mut compiled_in, &input)?;
    Ok(())
}

#[test]
fn empty_graphs_do_not_compile() -> Result<()> {
    let mut ctx = ExecContext::host()?;
    let mut graph: ExecutionGraph = ExecutionGraph::new();
    let err = graph
        .compile(&mut ctx, &Shape::new([1]))
        .expect_err("nothing to plan");
    assert!(err.to_string().contains("no layers"));
    Ok(())
}
