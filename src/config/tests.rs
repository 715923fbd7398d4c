use super::*;
use std::fs;

#[test]
fn parse_source_refs() {
    assert_eq!(
        SourceRef::parse("l", "prev:output").unwrap(),
        SourceRef::Prev("output".into())
    );
    assert_eq!(
        SourceRef::parse("l", "base:enc").unwrap(),
        SourceRef::Base("enc".into())
    );
    assert_eq!(
        SourceRef::parse("l", "data").unwrap(),
        SourceRef::Data("source".into())
    );
    assert_eq!(
        SourceRef::parse("l", "data:classes").unwrap(),
        SourceRef::Data("classes".into())
    );
    assert_eq!(SourceRef::parse("l", ":i").unwrap(), SourceRef::StepIndex);
    assert_eq!(
        SourceRef::parse("l", "lstm/cell").unwrap(),
        SourceRef::Current("lstm/cell".into())
    );
}

#[test]
fn reject_bad_refs() {
    assert!(SourceRef::parse("l", "prev:").is_err());
    assert!(SourceRef::parse("l", "prev:base:x").is_err());
    assert!(matches!(
        SourceRef::parse("l", "foo:bar"),
        Err(BuildError::InvalidReference { .. })
    ));
}

#[test]
fn net_keeps_declaration_order() {
    let net = NetDict::from_json(
        r#"{
            "zeta": {"class": "linear", "n_out": 3},
            "alpha": {"class": "copy", "from": "zeta"},
            "output": {"class": "copy", "from": ["alpha", "prev:output"]}
        }"#,
    )
    .unwrap();
    let names: Vec<&str> = net.names().collect();
    assert_eq!(names, vec!["zeta", "alpha", "output"]);
    let out = net.get("output").unwrap();
    assert_eq!(
        out.from,
        Some(vec![
            SourceRef::Current("alpha".into()),
            SourceRef::Prev("output".into())
        ])
    );
    assert!(net.get("zeta").unwrap().from.is_none());
    assert_eq!(net.get("zeta").unwrap().opt_usize("n_out").unwrap(), Some(3));
}

#[test]
fn layer_spec_reserved_keys() {
    let net = NetDict::from_json(
        r#"{"output": {"class": "softmax", "from": "data", "n_out": 5,
                       "loss": "ce", "target": "classes", "is_output_layer": true,
                       "initial_output": "base:init"}}"#,
    )
    .unwrap();
    let out = net.get("output").unwrap();
    assert_eq!(out.class, "softmax");
    assert_eq!(out.loss.as_deref(), Some("ce"));
    assert_eq!(out.target.as_deref(), Some("classes"));
    assert!(out.is_output_layer);
    assert_eq!(out.initial_output, InitialOutput::Base("init".into()));
    assert!(!out.options.contains_key("loss"));
    assert!(out.options.contains_key("n_out"));
}

#[test]
fn missing_class_is_an_error() {
    let err = NetDict::from_json(r#"{"output": {"from": "data"}}"#).unwrap_err();
    assert!(matches!(err, BuildError::InvalidOption { ref key, .. } if key == "class"));
}

#[test]
fn bad_option_types() {
    let net = NetDict::from_json(r#"{"output": {"class": "linear", "n_out": "many"}}"#).unwrap();
    assert!(net.get("output").unwrap().opt_usize("n_out").is_err());
}

#[test]
fn initial_output_forms() {
    use serde_json::json;
    assert_eq!(
        InitialOutput::from_value("l", &json!("ones")).unwrap(),
        InitialOutput::Ones
    );
    assert_eq!(
        InitialOutput::from_value("l", &json!(0.5)).unwrap(),
        InitialOutput::Scalar(0.5)
    );
    assert_eq!(
        InitialOutput::from_value("l", &json!([1.0, 2.0])).unwrap(),
        InitialOutput::Vector(vec![1.0, 2.0])
    );
    assert!(InitialOutput::from_value("l", &json!("base:")).is_err());
    assert!(InitialOutput::from_value("l", &json!(true)).is_err());
}

#[test]
fn rec_options_defaults_and_json() {
    let opts = RecOptions::default();
    assert!(opts.optimize_move_layers_out);
    assert!(!opts.include_eos);
    assert_eq!(opts.step_cap(), options::DEFAULT_MAX_SEQ_LEN);

    let opts = RecOptions::from_json(r#"{"max_seq_len": 7, "search": true}"#).unwrap();
    assert_eq!(opts.step_cap(), 7);
    assert!(opts.search);
    assert!(RecOptions::from_json(r#"{"unknown": 1}"#).is_err());
}

#[test]
fn load_net_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.json");
    fs::write(
        &path,
        r#"{"output": {"class": "linear", "from": "data", "n_out": 2}}"#,
    )
    .unwrap();
    let net = NetDict::load(&path).unwrap();
    assert_eq!(net.len(), 1);
    assert!(net.source().unwrap().contains("\"output\""));

    let missing = dir.path().join("missing.json");
    assert!(NetDict::load(&missing).is_err());
}
