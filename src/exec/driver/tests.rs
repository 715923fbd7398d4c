use super::*;
use crate::config::{NetDict, RecOptions};
use crate::exec::value::{dense_tensor, labels_tensor};
use crate::net::descriptor::OutputDesc;
use crate::net::template::TemplateEnv;
use crate::rec::RecLayer;
use burn::backend::NdArray;
use serde_json::json;

type B = NdArray;

fn run_net(
    net: serde_json::Value,
    options: RecOptions,
    env: &TemplateEnv,
    inputs: &RecInputs<B>,
) -> Result<RecOutput<B>, ExecError> {
    let net = NetDict::from_value(&net).unwrap();
    let registry = LayerRegistry::<B>::with_builtins();
    let plan = RecLayer::new(net, options).build(&registry, env).unwrap();
    let device = Default::default();
    let mut params = ParamStore::new(&device);
    plan.run(&registry, inputs, &mut params)
}

fn zeros(steps: usize, batch: usize, width: usize) -> Stacked<B> {
    let device = Default::default();
    Stacked::Dense(Tensor::zeros([steps, batch, width], &device))
}

#[test]
fn hypotheses_end_once_and_keep_their_length() {
    let device = Default::default();
    let record = SearchRecord::new();
    let flags = |v: &[i64]| StepValue::<B>::beamless(Value::Sparse(labels_tensor(v, &device)));

    let hyps = HypState::new(2)
        .advance(&record, &flags(&[0, 1]), 2, 0)
        .unwrap();
    assert_eq!(hyps.ended, vec![false, true]);
    assert_eq!(hyps.lengths, vec![1, 1]);

    let hyps = hyps.advance(&record, &flags(&[1, 0]), 2, 1).unwrap();
    assert_eq!(hyps.ended, vec![true, true]);
    assert_eq!(hyps.lengths, vec![2, 1]);
    assert!(hyps.all_ended());
}

#[test]
fn initial_vector_feeds_the_first_step() {
    let net = json!({
        "one": {"class": "constant", "value": 1.0, "n_out": 2},
        "output": {
            "class": "combine", "kind": "add",
            "from": ["prev:output", "one"],
            "initial_output": [1.0, 2.0]
        }
    });
    let out = run_net(
        net,
        RecOptions::default().with_fixed_length(3),
        &TemplateEnv::new(),
        &RecInputs::new(2),
    )
    .unwrap();
    assert_eq!(out.steps, 3);
    assert_eq!(out.seq_lens, vec![3, 3]);
    let output = out.output("output").unwrap();
    assert_eq!(output.shape(), vec![3, 2, 2]);
    assert_eq!(
        output.to_f32_vec().unwrap(),
        vec![2.0, 3.0, 2.0, 3.0, 3.0, 4.0, 3.0, 4.0, 4.0, 5.0, 4.0, 5.0]
    );
}

fn base_net() -> serde_json::Value {
    json!({
        "ctx": {"class": "copy", "from": ["base:enc"]},
        "output": {
            "class": "combine", "kind": "add",
            "from": ["prev:output", "ctx"],
            "initial_output": "base:init"
        }
    })
}

#[test]
fn outer_layers_are_constant_over_the_loop() {
    let device = Default::default();
    let env = TemplateEnv::new()
        .with_base("enc", OutputDesc::dense(2))
        .with_base("init", OutputDesc::dense(2));
    let inputs = RecInputs::<B>::new(2)
        .with_base("enc", Value::Dense(dense_tensor(vec![1.0, 2.0, 3.0, 4.0], 2, 2, &device)))
        .with_base("init", Value::Dense(dense_tensor(vec![10.0, 10.0, 20.0, 20.0], 2, 2, &device)));
    let out = run_net(base_net(), RecOptions::default().with_fixed_length(3), &env, &inputs).unwrap();
    let ctx = out.output("ctx").unwrap();
    assert_eq!(ctx.shape(), vec![3, 2, 2]);
    assert_eq!(ctx.to_f32_vec().unwrap(), [1.0, 2.0, 3.0, 4.0].repeat(3));
    assert_eq!(
        out.output("output").unwrap().to_f32_vec().unwrap(),
        vec![11.0, 12.0, 23.0, 24.0, 12.0, 14.0, 26.0, 28.0, 13.0, 16.0, 29.0, 32.0]
    );

    let without_enc = RecInputs::<B>::new(2)
        .with_base("init", Value::Dense(dense_tensor(vec![0.0; 4], 2, 2, &device)));
    let err = run_net(base_net(), RecOptions::default().with_fixed_length(3), &env, &without_enc)
        .err()
        .unwrap();
    assert!(matches!(err, ExecError::MissingBase { ref name } if name == "enc"));
}

#[test]
fn step_counter_counts_from_zero() {
    let net = json!({"output": {"class": "copy", "from": ":i"}});
    let out = run_net(
        net,
        RecOptions::default().with_fixed_length(4),
        &TemplateEnv::new(),
        &RecInputs::new(1),
    )
    .unwrap();
    assert_eq!(
        out.output("output").unwrap().to_f32_vec().unwrap(),
        vec![0.0, 1.0, 2.0, 3.0]
    );
}

#[test]
fn missing_data_is_reported_before_running() {
    let net = json!({
        "output": {"class": "linear", "from": ["data:source", "prev:output"], "n_out": 2}
    });
    let env = TemplateEnv::new().with_data("source", OutputDesc::dense(3));
    let err = run_net(net, RecOptions::default(), &env, &RecInputs::new(1)).unwrap_err();
    assert!(matches!(err, ExecError::MissingData { ref key } if key == "source"));
}

#[test]
fn pre_loop_inputs_must_agree_on_length() {
    let net = json!({
        "feat": {"class": "copy", "from": ["data:source", "data:other"]},
        "output": {"class": "linear", "from": ["feat", "prev:output"], "n_out": 2}
    });
    let env = TemplateEnv::new()
        .with_data("source", OutputDesc::dense(3))
        .with_data("other", OutputDesc::dense(2));
    let inputs = RecInputs::new(1)
        .with_data("source", zeros(3, 1, 3))
        .with_data("other", zeros(2, 1, 2));
    let err = run_net(net, RecOptions::default().with_fixed_length(2), &env, &inputs).unwrap_err();
    assert!(matches!(err, ExecError::LengthMismatch { .. }), "{err:?}");
}

#[test]
fn reading_past_the_data_names_step_and_layer() {
    let net = json!({
        "output": {"class": "linear", "from": ["data:source", "prev:output"], "n_out": 2}
    });
    let env = TemplateEnv::new().with_data("source", OutputDesc::dense(3));
    let inputs = RecInputs::new(1).with_data("source", zeros(2, 1, 3));
    let err = run_net(net, RecOptions::default().with_fixed_length(4), &env, &inputs).unwrap_err();
    match err {
        ExecError::Layer { step, layer, source } => {
            assert_eq!(step, 2);
            assert_eq!(layer, "output");
            assert!(matches!(*source, ExecError::LengthMismatch { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn losses_only_count_valid_frames() {
    let net = json!({
        "output": {"class": "constant", "value": 1.0, "n_out": 1, "loss": "mse"}
    });
    let env = TemplateEnv::new().with_data("gold", OutputDesc::dense(1));
    let inputs = RecInputs::new(2)
        .with_data("gold", zeros(3, 2, 1))
        .with_lengths("gold", vec![3, 1]);
    let out = run_net(net, RecOptions::default().with_target("gold"), &env, &inputs).unwrap();
    assert_eq!(out.seq_lens, vec![3, 1]);
    let loss = out.losses["output"];
    assert_eq!(loss.frames, 4);
    assert!((loss.total - 4.0).abs() < 1e-6);
    assert!((loss.mean() - 1.0).abs() < 1e-6);
}
