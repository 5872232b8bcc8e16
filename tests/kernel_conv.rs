use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use peregrine::kernels::reference;
use peregrine::{
    Conv2DLayer, DeviceProps, ExecContext, ExecutionGraph, HostDevice, HostTensor, Shape,
};

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * e.abs().max(1.0),
            "element {i}: {a} vs {e}"
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn check_against_reference(
    rng: &mut StdRng,
    props: DeviceProps,
    c_in: usize,
    c_out: usize,
    hw: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    with_bias: bool,
) -> Result<()> {
    let input = HostTensor::randn_from(rng, Shape::new([c_in, hw, hw]));
    let weight = HostTensor::randn_from(rng, Shape::new([c_out, c_in, kernel, kernel]));
    let bias = if with_bias {
        Some(HostTensor::randn_from(rng, Shape::new([c_out])))
    } else {
        None
    };
    let expected = reference::conv2d(&input, &weight, bias.as_ref(), stride, padding)?;

    let mut ctx = ExecContext::new(Arc::new(HostDevice::with_props(props)))?;
    let mut graph: ExecutionGraph = ExecutionGraph::new();
    graph.push(Box::new(Conv2DLayer::new(weight, bias, stride, padding)?));
    graph.compile(&mut ctx, input.shape())?;
    let out = graph.run(&mut ctx, &input)?;

    assert_eq!(out.shape(), expected.shape());
    assert_close(out.as_f32(), expected.as_f32(), 1e-4);
    Ok(())
}

#[test]
fn matches_reference_across_configs() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    for &(c_in, c_out, hw, kernel, stride, padding) in &[
        (1, 1, 5, 1, 1, 0),
        (3, 8, 16, 3, 1, 1),
        (3, 4, 11, 3, 2, 0),
        (8, 8, 9, 5, 1, 2),
        (4, 2, 7, 3, 3, 1),
    ] {
        check_against_reference(
            &mut rng,
            DeviceProps::default(),
            c_in,
            c_out,
            hw,
            kernel,
            stride,
            padding,
            true,
        )?;
    }
    Ok(())
}

#[test]
fn bias_free_convolutions_match_too() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(23);
    check_against_reference(&mut rng, DeviceProps::default(), 3, 6, 13, 3, 1, 1, false)
}

#[test]
fn tiny_fast_memory_forces_channel_blocking() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let props = DeviceProps {
        shared_memory_per_group: 512,
        ..DeviceProps::default()
    };
    check_against_reference(&mut rng, props, 8, 4, 12, 3, 1, 1, true)
}

#[test]
fn spatial_extent_follows_the_padded_floor_formula() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    for &(hw, kernel, stride, padding, expect) in &[
        (32usize, 3usize, 1usize, 1usize, 32usize),
        (32, 2, 2, 0, 16),
        (7, 3, 2, 0, 3),
        (5, 5, 1, 0, 1),
        (9, 3, 4, 0, 2),
    ] {
        let input = HostTensor::randn_from(&mut rng, Shape::new([1, hw, hw]));
        let weight = HostTensor::randn_from(&mut rng, Shape::new([1, 1, kernel, kernel]));

        let mut ctx = ExecContext::host()?;
        let mut graph: ExecutionGraph = ExecutionGraph::new();
        graph.push(Box::new(Conv2DLayer::new(weight, None, stride, padding)?));
        graph.compile(&mut ctx, input.shape())?;
        let out = graph.run(&mut ctx, &input)?;
        assert_eq!(
            out.shape().dims(),
            [1, expect, expect],
            "input {hw} kernel {kernel} stride {stride} padding {padding}"
        );
    }
    Ok(())
}
