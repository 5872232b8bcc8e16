use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use peregrine::kernels::reference;
use peregrine::{ExecContext, ExecutionGraph, HostTensor, MaxPoolLayer, Shape};

fn pool_through_graph(input: &HostTensor, window: usize, stride: usize) -> Result<HostTensor> {
    let mut ctx = ExecContext::host()?;
    let mut graph: ExecutionGraph = ExecutionGraph::new();
    graph.push(Box::new(MaxPoolLayer::new(window, stride)?));
    graph.compile(&mut ctx, input.shape())?;
    Ok(graph.run(&mut ctx, input)?)
}

#[test]
fn matches_reference_and_drops_partial_windows() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(17);
    for &(c, h, w, window, stride) in &[
        (2usize, 5usize, 5usize, 2usize, 2usize),
        (3, 7, 9, 3, 2),
        (1, 8, 8, 2, 2),
        (4, 6, 6, 3, 3),
    ] {
        let input = HostTensor::randn_from(&mut rng, Shape::new([c, h, w]));
        let expected = reference::max_pool2d(&input, window, stride)?;
        let out = pool_through_graph(&input, window, stride)?;
        assert_eq!(out.shape(), expected.shape());
        assert_eq!(out.as_f32(), expected.as_f32(), "maxima are exact");
    }
    Ok(())
}

#[test]
fn picks_the_window_maximum() -> Result<()> {
    let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let input = HostTensor::from_vec(Shape::new([1, 4, 4]), values)?;
    let out = pool_through_graph(&input, 2, 2)?;
    assert_eq!(out.shape().dims(), [1, 2, 2]);
    assert_eq!(out.as_f32(), [5.0, 7.0, 13.0, 15.0]);
    Ok(())
}

#[test]
fn window_covering_the_input_reduces_to_one_cell() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(18);
    let input = HostTensor::randn_from(&mut rng, Shape::new([2, 4, 4]));
    let out = pool_through_graph(&input, 4, 4)?;
    assert_eq!(out.shape().dims(), [2, 1, 1]);

    let x = input.as_f32();
    let expected: Vec<f32> = (0..2)
        .map(|c| {
            x[c * 16..(c + 1) * 16]
                .iter()
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b))
        })
        .collect();
    assert_eq!(out.as_f32(), expected.as_slice());
    Ok(())
}
