//! Shared helpers for the scenario tests.
#![allow(dead_code)]

use burn::backend::NdArray;
use burn::prelude::*;
use recnet::{
    LayerRegistry, NetDict, ParamStore, RecInputs, RecLayer, RecOptions, RecOutput, RecPlan,
    Stacked, TemplateEnv,
};

pub type B = NdArray;

pub fn build(
    net: serde_json::Value,
    options: RecOptions,
    env: &TemplateEnv,
    registry: &LayerRegistry<B>,
) -> RecPlan {
    let net = NetDict::from_value(&net).expect("valid net definition");
    RecLayer::new(net, options)
        .build(registry, env)
        .expect("template builds")
}

pub fn run(plan: &RecPlan, registry: &LayerRegistry<B>, inputs: &RecInputs<B>) -> RecOutput<B> {
    let device = Default::default();
    let mut params = ParamStore::new(&device);
    plan.run(registry, inputs, &mut params).expect("loop runs")
}

/// A dense `[steps, batch, width]` sequence with `f(t, b, j)` at each cell.
pub fn sequence(
    steps: usize,
    batch: usize,
    width: usize,
    f: impl Fn(usize, usize, usize) -> f32,
) -> Stacked<B> {
    let mut values = Vec::with_capacity(steps * batch * width);
    for t in 0..steps {
        for b in 0..batch {
            for j in 0..width {
                values.push(f(t, b, j));
            }
        }
    }
    let device = Default::default();
    Stacked::Dense(Tensor::from_data(
        TensorData::new(values, [steps, batch, width]),
        &device,
    ))
}

pub fn values(out: &RecOutput<B>, name: &str) -> Vec<f32> {
    out.output(name)
        .unwrap_or_else(|| panic!("no output '{name}'"))
        .to_f32_vec()
        .expect("readable output")
}

pub fn assert_close(found: &[f32], expected: &[f32]) {
    assert_eq!(found.len(), expected.len(), "{found:?} vs {expected:?}");
    for (i, (a, b)) in found.iter().zip(expected).enumerate() {
        assert!((a - b).abs() < 1e-5, "element {i}: {a} vs {b}\n{found:?}\n{expected:?}");
    }
}
