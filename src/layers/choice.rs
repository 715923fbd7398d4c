//! Hypothesis selection.
//!
//! With search enabled the step loop scores and prunes candidates itself
//! (see `exec::search`); the class only derives descriptors and validates
//! options. With search disabled a choice follows its target labels.

use burn::prelude::*;

use super::{DescribeCtx, ForwardCtx, LayerClass, LayerKind, Produced};
use crate::config::LayerSpec;
use crate::error::{BuildError, ExecError};
use crate::exec::value::Value;
use crate::net::descriptor::OutputDesc;

/// How the scores fed into a choice are expressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    Prob,
    LogProb,
}

/// Search options of one choice layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ChoiceConfig {
    pub beam_size: usize,
    /// Extend every incoming hypothesis by its best candidate instead of
    /// re-selecting across hypotheses.
    pub keep_beams: bool,
    pub input_type: InputType,
    /// Rank candidates by score divided by hypothesis length.
    pub length_normalization: bool,
    /// Force the ground-truth continuation into the beam.
    pub cheating: bool,
    /// Per-source pruning sizes, one per source.
    pub source_beam_sizes: Vec<usize>,
    pub eos_label: usize,
}

impl ChoiceConfig {
    pub fn from_spec(spec: &LayerSpec, sources: usize) -> Result<ChoiceConfig, BuildError> {
        let invalid = |key: &str, reason: &str| BuildError::InvalidOption {
            layer: spec.name.clone(),
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let beam_size = spec.opt_usize("beam_size")?.unwrap_or(1);
        if beam_size == 0 {
            return Err(invalid("beam_size", "must be at least 1"));
        }
        let input_type = match spec.opt_str("input_type")?.unwrap_or("prob") {
            "prob" => InputType::Prob,
            "log_prob" => InputType::LogProb,
            other => return Err(invalid("input_type", &format!("unknown input type '{}'", other))),
        };
        let cheating = spec.opt_bool("cheating")?.unwrap_or(false);
        let source_beam_sizes = match spec.opt_usize_list("source_beam_sizes")? {
            Some(sizes) => {
                if sizes.len() != sources {
                    return Err(invalid(
                        "source_beam_sizes",
                        &format!("expected {} entries, one per source, got {}", sources, sizes.len()),
                    ));
                }
                if sizes.contains(&0) {
                    return Err(invalid("source_beam_sizes", "entries must be at least 1"));
                }
                sizes
            }
            None if sources > 1 => {
                return Err(invalid(
                    "source_beam_sizes",
                    "required when a choice has more than one source",
                ))
            }
            None => vec![beam_size],
        };
        if cheating && sources > 1 {
            return Err(invalid("cheating", "only supported with a single source"));
        }
        Ok(ChoiceConfig {
            beam_size,
            keep_beams: spec.opt_bool("keep_beams")?.unwrap_or(false),
            input_type,
            length_normalization: spec.opt_bool("length_normalization")?.unwrap_or(false),
            cheating,
            source_beam_sizes,
            eos_label: spec.opt_usize("eos_label")?.unwrap_or(0),
        })
    }
}

pub fn choice_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Choice,
        describe: describe_choice,
        forward: forward_choice::<B>,
        aux_state: None,
        sub_output: Some(choice_sub_output),
        row_wise: true,
        default_source: true,
    }
}

fn describe_choice(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    if ctx.inputs.is_empty() {
        return Err(ctx.fail("needs at least one scored source"));
    }
    let config = ChoiceConfig::from_spec(ctx.spec, ctx.inputs.len())?;
    let first = ctx.require(0)?;
    if first.sparse {
        return Err(ctx.fail("source scores must be dense"));
    }
    // Ended and padded hypotheses carry `eos_label` in every source.
    for source in ctx.inputs.iter().flatten() {
        if config.eos_label >= source.width() {
            return Err(BuildError::InvalidOption {
                layer: ctx.spec.name.clone(),
                key: "eos_label".to_string(),
                reason: format!(
                    "label {} is outside the {} scored labels",
                    config.eos_label,
                    source.width()
                ),
            });
        }
    }
    if !ctx.search && ctx.target.is_none() {
        return Err(ctx.fail("a target is required when search is disabled"));
    }
    Ok(OutputDesc::sparse(first.width()))
}

/// `out_<i>`: labels chosen for source `i` (`i >= 1`).
fn choice_sub_output(ctx: &DescribeCtx<'_>, _desc: &OutputDesc, key: &str) -> Option<OutputDesc> {
    let i: usize = key.strip_prefix("out_")?.parse().ok()?;
    if i == 0 {
        return None;
    }
    let source = ctx.inputs.get(i)?.as_ref()?;
    Some(OutputDesc::sparse(source.width()))
}

fn forward_choice<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let labels = match &ctx.target {
        Some(target) => target.sparse(&ctx.spec.name)?,
        None => {
            return Err(ExecError::MissingTarget {
                layer: ctx.spec.name.clone(),
                target: ctx.spec.target.clone().unwrap_or_default(),
            })
        }
    };
    let mut extras = Vec::new();
    for (i, input) in ctx.inputs.iter().enumerate().skip(1) {
        let scores = input.dense(&ctx.spec.name)?;
        let rows = scores.dims()[0];
        extras.push((
            format!("out_{}", i),
            Value::Sparse(scores.argmax(1).reshape([rows])),
        ));
    }
    Ok(Produced {
        value: Value::Sparse(labels),
        aux: None,
        extras,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: serde_json::Value) -> LayerSpec {
        LayerSpec::from_value("output", &v).unwrap()
    }

    #[test]
    fn multi_source_needs_sizes() {
        let s = spec(json!({"class": "choice", "from": ["a", "b"], "beam_size": 4}));
        assert!(ChoiceConfig::from_spec(&s, 2).is_err());
        let s = spec(json!({
            "class": "choice", "from": ["a", "b"], "beam_size": 4,
            "source_beam_sizes": [2, 3]
        }));
        let cfg = ChoiceConfig::from_spec(&s, 2).unwrap();
        assert_eq!(cfg.source_beam_sizes, vec![2, 3]);
        assert_eq!(cfg.input_type, InputType::Prob);
    }

    #[test]
    fn single_source_prunes_to_beam() {
        let s = spec(json!({"class": "choice", "from": "probs", "beam_size": 3, "input_type": "log_prob"}));
        let cfg = ChoiceConfig::from_spec(&s, 1).unwrap();
        assert_eq!(cfg.source_beam_sizes, vec![3]);
        assert_eq!(cfg.input_type, InputType::LogProb);
        let s = spec(json!({"class": "choice", "from": "probs", "input_type": "logits"}));
        assert!(ChoiceConfig::from_spec(&s, 1).is_err());
    }

    #[test]
    fn describe_requires_target_without_search() {
        let s = spec(json!({"class": "choice", "from": "probs", "beam_size": 3}));
        let ctx = DescribeCtx {
            spec: &s,
            inputs: vec![Some(OutputDesc::dense(5))],
            target: None,
            unit: None,
            search: false,
        };
        assert!(describe_choice(&ctx).is_err());
        let ctx = DescribeCtx { search: true, ..ctx };
        assert_eq!(describe_choice(&ctx).unwrap(), OutputDesc::sparse(5));
    }

    #[test]
    fn eos_label_must_be_a_scored_label() {
        let s = spec(json!({"class": "choice", "from": "probs", "beam_size": 3, "eos_label": 7}));
        let ctx = DescribeCtx {
            spec: &s,
            inputs: vec![Some(OutputDesc::dense(2))],
            target: None,
            unit: None,
            search: true,
        };
        assert!(matches!(
            describe_choice(&ctx),
            Err(BuildError::InvalidOption { ref key, .. }) if key == "eos_label"
        ));
        let ctx = DescribeCtx {
            inputs: vec![Some(OutputDesc::dense(8))],
            ..ctx
        };
        assert_eq!(describe_choice(&ctx).unwrap(), OutputDesc::sparse(8));
    }
}
