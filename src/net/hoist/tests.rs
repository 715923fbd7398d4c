use super::*;
use crate::config::{NetDict, RecOptions};
use crate::net::descriptor::OutputDesc;
use crate::net::template::{TemplateBuilder, TemplateEnv};
use burn::backend::NdArray;
use serde_json::json;

type B = NdArray;

fn partition_of(def: serde_json::Value, options: RecOptions) -> Partition {
    let net = NetDict::from_value(&def).unwrap();
    let registry = LayerRegistry::<B>::with_builtins();
    let env = TemplateEnv::new()
        .with_data("source", OutputDesc::dense(4))
        .with_data("classes", OutputDesc::sparse(5));
    let template = TemplateBuilder::new(&net, &registry, &env)
        .with_options(options)
        .build()
        .unwrap();
    partition(&template, &registry)
}

fn embed_recur_project() -> serde_json::Value {
    json!({
        "output": {"class": "copy", "from": ["lin"]},
        "lin": {"class": "linear", "from": ["emb", "prev:lin"], "n_out": 3},
        "emb": {"class": "linear", "from": ["data:source"], "n_out": 3},
        "proj": {"class": "softmax", "from": ["output"], "n_out": 5, "is_output_layer": true}
    })
}

#[test]
fn embedding_and_projection_leave_the_loop() {
    let p = partition_of(embed_recur_project(), RecOptions::default().with_fixed_length(4));
    assert_eq!(p.pre_loop, vec!["emb"]);
    assert_eq!(p.in_loop, vec!["lin"]);
    assert_eq!(p.post_loop, vec!["output", "proj"]);
    assert_eq!(p.placement("emb"), Some(Placement::PreLoop));
    assert_eq!(p.placement("proj"), Some(Placement::PostLoop));
    assert_eq!(p.placement("nope"), None);
    insta::assert_snapshot!("embed_recur_project", p.report());
}

#[test]
fn disabled_hoisting_keeps_everything_in_loop() {
    let p = partition_of(
        embed_recur_project(),
        RecOptions::default().with_fixed_length(4).with_hoisting(false),
    );
    assert!(p.pre_loop.is_empty());
    assert!(p.post_loop.is_empty());
    assert_eq!(p.in_loop, vec!["emb", "lin", "output", "proj"]);
}

#[test]
fn prev_edges_pin_both_ends() {
    let p = partition_of(
        json!({
            "output": {"class": "linear", "from": ["feat"], "n_out": 2},
            "feat": {"class": "linear", "from": ["prev:output", "data:source"], "n_out": 2}
        }),
        RecOptions::default().with_fixed_length(3),
    );
    // `output` is read one step back, `feat` reads a previous-step value.
    assert_eq!(p.in_loop, vec!["feat", "output"]);
    assert!(p.pre_loop.is_empty());
    assert!(p.post_loop.is_empty());
}

#[test]
fn cells_and_end_stay_in_loop() {
    let p = partition_of(
        json!({
            "output": {"class": "rec", "unit": "rnn", "from": ["data:source"], "n_out": 2},
            "end": {"class": "compare", "from": [":i"], "kind": "greater_equal", "value": 2}
        }),
        RecOptions::default(),
    );
    assert_eq!(p.placement("output"), Some(Placement::InLoop));
    assert_eq!(p.placement("end"), Some(Placement::InLoop));
    assert_eq!(p.placement(":i"), Some(Placement::InLoop));
}

#[test]
fn only_search_choices_are_pinned() {
    let def = json!({
        "output": {"class": "choice", "from": ["probs"], "beam_size": 2},
        "probs": {"class": "softmax", "from": ["data:source"]}
    });
    let forced = partition_of(def.clone(), RecOptions::default().with_target("classes"));
    // Nothing reads across steps, so the whole net runs after the loop.
    assert!(forced.in_loop.is_empty());
    assert_eq!(forced.post_loop, vec!["probs", "output"]);

    let searched = partition_of(
        def,
        RecOptions::default()
            .with_target("classes")
            .with_search(true)
            .with_fixed_length(3),
    );
    assert_eq!(searched.pre_loop, vec!["probs"]);
    assert_eq!(searched.in_loop, vec!["output"]);
}
