use super::*;
use crate::config::NetDict;
use burn::backend::NdArray;
use serde_json::json;

type B = NdArray;

fn source_env() -> TemplateEnv {
    TemplateEnv::new()
        .with_data("source", OutputDesc::dense(4))
        .with_data("classes", OutputDesc::sparse(6))
}

fn build_with(
    def: serde_json::Value,
    env: &TemplateEnv,
    options: RecOptions,
) -> Result<Template, BuildError> {
    let net = NetDict::from_value(&def).unwrap();
    let registry = LayerRegistry::<B>::with_builtins();
    TemplateBuilder::new(&net, &registry, env)
        .with_options(options)
        .build()
}

fn build(def: serde_json::Value, options: RecOptions) -> Result<Template, BuildError> {
    build_with(def, &source_env(), options)
}

#[test]
fn self_prev_reference_resolves() {
    let t = build(
        json!({"output": {"class": "linear", "from": ["prev:output", "data:source"], "n_out": 8}}),
        RecOptions::default().with_fixed_length(5),
    )
    .unwrap();
    assert_eq!(t.descriptor("output"), Some(&OutputDesc::dense(8)));
    assert_eq!(t.length_mode(), &LengthMode::Fixed(5));
    assert!(t.report().best_effort.is_empty());
    let out = t.id("output").unwrap();
    assert!(t.prev_read().contains(&out));
    assert!(!t.arena().node(out).is_provisional());
}

#[test]
fn forward_reference_through_prev() {
    let t = build(
        json!({
            "output": {"class": "copy", "from": ["a"]},
            "a": {"class": "linear", "from": ["prev:b"], "n_out": 3},
            "b": {"class": "copy", "from": ["a"]}
        }),
        RecOptions::default().with_fixed_length(2),
    )
    .unwrap();
    for name in ["output", "a", "b"] {
        assert_eq!(t.descriptor(name), Some(&OutputDesc::dense(3)), "{name}");
    }
    assert!(t.report().best_effort.is_empty());
    assert!(!t.report().recovered.is_empty());
    assert!(t.report().refinement_passes >= 1);
}

#[test]
fn execution_order_follows_current_edges() {
    let t = build(
        json!({
            "output": {"class": "linear", "from": ["b"], "n_out": 2},
            "b": {"class": "linear", "from": ["a"], "n_out": 3},
            "a": {"class": "linear", "from": ["data:source"], "n_out": 4}
        }),
        RecOptions::default().with_fixed_length(1),
    )
    .unwrap();
    let names: Vec<&str> = t.layers().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "output"]);
    let out = t.layer_by_name("output").unwrap();
    assert_eq!(out.input_names, vec!["b".to_string()]);
    assert_eq!(out.input_descs, vec![OutputDesc::dense(3)]);
}

#[test]
fn current_step_cycle_is_rejected() {
    let err = build(
        json!({
            "output": {"class": "copy", "from": ["a"]},
            "a": {"class": "linear", "from": ["output"], "n_out": 2}
        }),
        RecOptions::default().with_fixed_length(2),
    )
    .unwrap_err();
    assert_eq!(
        err,
        BuildError::CyclicDependency {
            cycle: vec!["a".to_string(), "output".to_string()]
        }
    );
}

#[test]
fn missing_output_layer() {
    let err = build(
        json!({"a": {"class": "linear", "n_out": 2}}),
        RecOptions::default().with_fixed_length(2),
    )
    .unwrap_err();
    assert_eq!(err, BuildError::MissingOutput);
}

#[test]
fn no_length_source() {
    let err = build_with(
        json!({"output": {"class": "linear", "from": ["prev:output"], "n_out": 2}}),
        &TemplateEnv::new(),
        RecOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err, BuildError::NoLengthSource);
}

#[test]
fn unknown_layer_is_fatal() {
    let err = build(
        json!({"output": {"class": "copy", "from": ["missing"]}}),
        RecOptions::default().with_fixed_length(2),
    )
    .unwrap_err();
    assert_eq!(
        err,
        BuildError::UnknownLayer {
            layer: "missing".to_string()
        }
    );
}

#[test]
fn unknown_data_key_is_fatal() {
    let err = build(
        json!({"output": {"class": "linear", "from": ["data:nope"], "n_out": 2}}),
        RecOptions::default().with_fixed_length(2),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::UnknownData { ref key, .. } if key == "nope"));
}

#[test]
fn cell_sub_outputs() {
    let t = build(
        json!({
            "output": {"class": "linear", "from": ["cell/cell"], "n_out": 2},
            "cell": {"class": "rec", "unit": "lstm", "from": ["data:source", "prev:cell/state"], "n_out": 5}
        }),
        RecOptions::default().with_fixed_length(3),
    )
    .unwrap();
    assert_eq!(t.descriptor("cell"), Some(&OutputDesc::dense(5)));
    assert_eq!(t.descriptor("cell/state"), Some(&OutputDesc::dense(5)));
    assert_eq!(t.descriptor("cell/cell"), Some(&OutputDesc::dense(5)));
    let sub = t.layer_by_name("cell/cell").unwrap();
    assert!(sub.is_sub_layer());
    assert_eq!(sub.spec.name, "cell");
    let cell = t.id("cell").unwrap();
    assert_eq!(
        t.arena().node(sub.id).sub_of,
        Some((cell, "cell".to_string()))
    );
}

#[test]
fn unknown_sub_output() {
    let err = build(
        json!({
            "output": {"class": "linear", "from": ["cell/cell"], "n_out": 2},
            "cell": {"class": "rec", "unit": "rnn", "from": ["data:source"], "n_out": 5}
        }),
        RecOptions::default().with_fixed_length(3),
    )
    .unwrap_err();
    assert_eq!(
        err,
        BuildError::UnknownLayer {
            layer: "cell/cell".to_string()
        }
    );
}

#[test]
fn search_choice_owns_its_beam() {
    let t = build(
        json!({
            "output": {"class": "choice", "from": ["probs"], "beam_size": 3},
            "probs": {"class": "softmax", "from": ["prev:output"], "n_out": 6}
        }),
        RecOptions::default().with_fixed_length(4).with_search(true),
    )
    .unwrap();
    let beam = Some(SearchBeam {
        choice: "output".to_string(),
        size: 3,
    });
    assert_eq!(t.descriptor("output"), Some(&OutputDesc::sparse(6).with_beam(beam.clone())));
    assert_eq!(t.descriptor("probs").unwrap().beam, beam);
    let out = t.id("output").unwrap();
    assert!(t.is_search_choice(out));
    assert!(t.report().best_effort.is_empty());
}

#[test]
fn choice_without_search_follows_target() {
    let t = build(
        json!({
            "output": {"class": "choice", "from": ["probs"], "beam_size": 3},
            "probs": {"class": "softmax", "from": ["prev:output"]}
        }),
        RecOptions::default().with_target("classes"),
    )
    .unwrap();
    assert_eq!(t.descriptor("output"), Some(&OutputDesc::sparse(6)));
    assert_eq!(t.length_mode(), &LengthMode::Target("classes".to_string()));
    let out = t.id("output").unwrap();
    assert!(!t.is_search_choice(out));
    assert_eq!(t.layer(out).unwrap().target.as_deref(), Some("classes"));
}

#[test]
fn unrelated_choices_are_incompatible() {
    let err = build(
        json!({
            "output": {"class": "combine", "kind": "add", "from": ["l1", "l2"]},
            "l1": {"class": "linear", "from": ["c1"], "n_out": 2},
            "l2": {"class": "linear", "from": ["c2"], "n_out": 2},
            "c1": {"class": "choice", "from": ["p1"], "beam_size": 2},
            "c2": {"class": "choice", "from": ["p2"], "beam_size": 2},
            "p1": {"class": "softmax", "from": ["data:source"], "n_out": 3},
            "p2": {"class": "softmax", "from": ["data:source"], "n_out": 3}
        }),
        RecOptions::default().with_fixed_length(2).with_search(true),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::IncompatibleSearch { ref layer, .. } if layer == "output"));
}

#[test]
fn nested_choices_take_the_newest_beam() {
    let t = build(
        json!({
            "output": {"class": "combine", "kind": "add", "from": ["l1", "l2"]},
            "l1": {"class": "linear", "from": ["c1"], "n_out": 2},
            "l2": {"class": "linear", "from": ["c2"], "n_out": 2},
            "c1": {"class": "choice", "from": ["p1"], "beam_size": 2},
            "c2": {"class": "choice", "from": ["p2"], "beam_size": 4},
            "p1": {"class": "softmax", "from": ["data:source"], "n_out": 3},
            "p2": {"class": "softmax", "from": ["c1"], "n_out": 3}
        }),
        RecOptions::default().with_fixed_length(2).with_search(true),
    )
    .unwrap();
    assert_eq!(
        t.descriptor("output").unwrap().beam,
        Some(SearchBeam {
            choice: "c2".to_string(),
            size: 4
        })
    );
}

#[test]
fn beam_size_disagreement_through_data() {
    let env = source_env().with_data(
        "hyps",
        OutputDesc::dense(4).with_beam(Some(SearchBeam {
            choice: "output".to_string(),
            size: 2,
        })),
    );
    let err = build_with(
        json!({
            "output": {"class": "choice", "from": ["probs"], "beam_size": 3},
            "probs": {"class": "softmax", "from": ["prev:output", "data:hyps"], "n_out": 5}
        }),
        &env,
        RecOptions::default().with_fixed_length(2).with_search(true),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        BuildError::InconsistentBeam {
            expected: 3,
            found: 2,
            ..
        }
    ));
}

#[test]
fn end_layer_selects_dynamic_length() {
    let t = build(
        json!({
            "output": {"class": "linear", "from": ["prev:output"], "n_out": 2},
            "end": {"class": "compare", "from": [":i"], "kind": "greater_equal", "value": 3}
        }),
        RecOptions::default().with_max_seq_len(7),
    )
    .unwrap();
    assert_eq!(t.length_mode(), &LengthMode::Dynamic { cap: 7 });
    assert!(t.layer_by_name(":i").is_some());
    assert_eq!(t.needed().len(), 2);
}

#[test]
fn end_layer_must_be_a_flag() {
    let err = build(
        json!({
            "output": {"class": "linear", "from": ["prev:output"], "n_out": 2},
            "end": {"class": "linear", "from": ["output"], "n_out": 1}
        }),
        RecOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::InvalidOption { ref layer, .. } if layer == "end"));
}

#[test]
fn fixed_length_wins_over_target() {
    let t = build(
        json!({"output": {"class": "linear", "from": ["prev:output"], "n_out": 2}}),
        RecOptions::default().with_fixed_length(3).with_target("classes"),
    )
    .unwrap();
    assert_eq!(t.length_mode(), &LengthMode::Fixed(3));
    let t = build(
        json!({"output": {"class": "linear", "from": ["prev:output"], "n_out": 2}}),
        RecOptions::default(),
    )
    .unwrap();
    assert_eq!(t.length_mode(), &LengthMode::Source);
}

#[test]
fn initial_vector_must_fit() {
    let err = build(
        json!({"output": {
            "class": "linear", "from": ["prev:output"], "n_out": 2,
            "initial_output": [1.0, 2.0, 3.0]
        }}),
        RecOptions::default().with_fixed_length(3),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::InvalidOption { ref key, .. } if key == "initial_output"));
}

#[test]
fn loss_layers_are_needed() {
    let t = build(
        json!({
            "output": {"class": "linear", "from": ["data:source"], "n_out": 2},
            "aux": {"class": "softmax", "from": ["output"], "loss": "ce", "target": "classes"}
        }),
        RecOptions::default().with_fixed_length(3),
    )
    .unwrap();
    let aux = t.layer_by_name("aux").unwrap();
    assert_eq!(aux.loss, Some(LossKind::CrossEntropy));
    assert_eq!(aux.desc, OutputDesc::dense(6));
    assert!(t.needed().contains(&aux.id));
}

fn never_known(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    Err(BuildError::MissingDescriptor {
        layer: ctx.spec.name.clone(),
        input: "data:source".to_string(),
    })
}

#[test]
fn unresolvable_layer_leaves_the_template_incomplete() {
    let mut registry = LayerRegistry::<B>::with_builtins();
    registry.register(
        "waiting",
        LayerClass {
            describe: never_known,
            ..crate::layers::basic::copy_class::<B>()
        },
    );
    let net = NetDict::from_value(&json!({
        "output": {"class": "copy", "from": ["late"]},
        "late": {"class": "waiting", "from": ["data:source"]}
    }))
    .unwrap();
    let err = TemplateBuilder::new(&net, &registry, &source_env())
        .with_options(RecOptions::default().with_fixed_length(2))
        .build()
        .err()
        .unwrap();
    match err {
        BuildError::TemplateIncomplete {
            unfinished, errors, ..
        } => {
            assert!(unfinished.contains(&"late".to_string()), "{unfinished:?}");
            assert!(!errors.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
}
