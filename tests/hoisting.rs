//! Layers moved out of the loop run once and compute the same values.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use burn::prelude::*;
use common::{assert_close, build, run, sequence, values, B};
use recnet::error::ExecError;
use recnet::layers::basic::{linear_class, softmax_class};
use recnet::layers::{ForwardCtx, LayerClass, Produced};
use recnet::{LayerRegistry, OutputDesc, Placement, RecInputs, RecOptions, TemplateEnv};
use serde_json::json;

static EMBED_CALLS: AtomicUsize = AtomicUsize::new(0);
static PROJECT_CALLS: AtomicUsize = AtomicUsize::new(0);

fn counted_embed<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    EMBED_CALLS.fetch_add(1, Ordering::SeqCst);
    (linear_class::<B>().forward)(ctx)
}

fn counted_project<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    PROJECT_CALLS.fetch_add(1, Ordering::SeqCst);
    (softmax_class::<B>().forward)(ctx)
}

fn embed_recur_project(embed: &str, project: &str) -> serde_json::Value {
    json!({
        "emb": {"class": embed, "from": ["data:source"], "n_out": 3},
        "lin": {"class": "linear", "from": ["emb", "prev:lin"], "n_out": 3, "activation": "tanh"},
        "output": {"class": "copy", "from": ["lin"]},
        "proj": {"class": project, "from": ["output"], "n_out": 5, "is_output_layer": true}
    })
}

fn env() -> TemplateEnv {
    TemplateEnv::new().with_data("source", OutputDesc::dense(4))
}

fn inputs() -> RecInputs<B> {
    RecInputs::new(2).with_data(
        "source",
        sequence(4, 2, 4, |t, b, j| ((t * 7 + b * 3 + j) % 5) as f32 * 0.25 - 0.5),
    )
}

#[test]
fn hoisted_layers_are_invoked_once() {
    let mut registry = LayerRegistry::<B>::with_builtins();
    registry.register(
        "counted_embed",
        LayerClass {
            forward: counted_embed::<B>,
            ..linear_class::<B>()
        },
    );
    registry.register(
        "counted_project",
        LayerClass {
            forward: counted_project::<B>,
            ..softmax_class::<B>()
        },
    );
    let net = embed_recur_project("counted_embed", "counted_project");

    let plan = build(net.clone(), RecOptions::default().with_fixed_length(4), &env(), &registry);
    let partition = plan.partition();
    assert_eq!(partition.placement("emb"), Some(Placement::PreLoop));
    assert_eq!(partition.placement("lin"), Some(Placement::InLoop));
    assert_eq!(partition.placement("proj"), Some(Placement::PostLoop));
    run(&plan, &registry, &inputs());
    assert_eq!(EMBED_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(PROJECT_CALLS.load(Ordering::SeqCst), 1);

    let plan = build(
        net,
        RecOptions::default().with_fixed_length(4).with_hoisting(false),
        &env(),
        &registry,
    );
    run(&plan, &registry, &inputs());
    assert_eq!(EMBED_CALLS.load(Ordering::SeqCst), 1 + 4);
    assert_eq!(PROJECT_CALLS.load(Ordering::SeqCst), 1 + 4);
}

#[test]
fn hoisting_does_not_change_values() {
    let registry = LayerRegistry::<B>::with_builtins();
    let net = embed_recur_project("linear", "softmax");
    let hoisted = run(
        &build(net.clone(), RecOptions::default().with_fixed_length(4), &env(), &registry),
        &registry,
        &inputs(),
    );
    let looped = run(
        &build(
            net,
            RecOptions::default().with_fixed_length(4).with_hoisting(false),
            &env(),
            &registry,
        ),
        &registry,
        &inputs(),
    );

    let names: Vec<&String> = hoisted.outputs.keys().collect();
    assert_eq!(names, looped.outputs.keys().collect::<Vec<_>>());
    for name in ["emb", "lin", "output", "proj"] {
        assert_eq!(
            hoisted.output(name).unwrap().shape(),
            looped.output(name).unwrap().shape(),
            "{name}"
        );
        assert_close(&values(&hoisted, name), &values(&looped, name));
    }
    assert_eq!(hoisted.output("proj").unwrap().shape(), vec![4, 2, 5]);
}

fn long_inputs() -> RecInputs<B> {
    RecInputs::new(2).with_data(
        "source",
        sequence(6, 2, 4, |t, b, j| ((t * 5 + b + j * 3) % 7) as f32 * 0.2 - 0.6),
    )
}

fn assert_same_with_and_without_hoisting(net: serde_json::Value, options: RecOptions, steps: usize) {
    let registry = LayerRegistry::<B>::with_builtins();
    let plan = build(net.clone(), options.clone(), &env(), &registry);
    assert_eq!(plan.partition().placement("emb"), Some(Placement::PreLoop));
    let hoisted = run(&plan, &registry, &long_inputs());
    let looped = run(
        &build(net, options.with_hoisting(false), &env(), &registry),
        &registry,
        &long_inputs(),
    );
    assert_eq!(hoisted.seq_lens, looped.seq_lens);
    for name in ["emb", "lin", "output", "proj"] {
        let shape = hoisted.output(name).unwrap().shape();
        assert_eq!(shape, looped.output(name).unwrap().shape(), "{name}");
        assert_eq!(shape[0], steps, "{name}");
        assert_close(&values(&hoisted, name), &values(&looped, name));
    }
}

#[test]
fn hoisted_layers_follow_a_fixed_loop_shorter_than_the_data() {
    assert_same_with_and_without_hoisting(
        embed_recur_project("linear", "softmax"),
        RecOptions::default().with_fixed_length(3),
        3,
    );
}

#[test]
fn hoisted_layers_follow_an_end_flag_before_the_data_ends() {
    let mut net = embed_recur_project("linear", "softmax");
    net["end"] = json!({"class": "compare", "from": [":i"], "kind": "greater_equal", "value": 2});
    assert_same_with_and_without_hoisting(net, RecOptions::default(), 2);
}

#[test]
fn search_values_survive_post_loop_projection() {
    let registry = LayerRegistry::<B>::with_builtins();
    let net = json!({
        "probs": {"class": "softmax", "from": ["prev:output", "data:source"], "n_out": 6},
        "output": {"class": "choice", "from": ["probs"], "beam_size": 3},
        "score": {"class": "linear", "from": ["output"], "n_out": 2, "is_output_layer": true}
    });
    let options = RecOptions::default().with_fixed_length(4).with_search(true);
    let plan = build(net.clone(), options.clone(), &env(), &registry);
    assert_eq!(plan.partition().placement("score"), Some(Placement::PostLoop));
    let hoisted = run(&plan, &registry, &inputs()).decide(false);
    let looped = run(
        &build(net, options.with_hoisting(false), &env(), &registry),
        &registry,
        &inputs(),
    )
    .decide(false);
    assert_eq!(values(&hoisted, "output"), values(&looped, "output"));
    assert_close(&values(&hoisted, "score"), &values(&looped, "score"));
    assert_eq!(hoisted.output("score").unwrap().shape(), vec![4, 2, 2]);
}
