//! Stateless built-in layer classes.

use burn::prelude::*;
use burn::tensor::activation;

use super::{DescribeCtx, ForwardCtx, LayerClass, LayerKind, Produced};
use crate::error::{BuildError, ExecError};
use crate::exec::value::{tensor_to_labels, Value};
use crate::net::descriptor::{DType, Dim, OutputDesc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Tanh,
    Relu,
    Sigmoid,
    Softmax,
    LogSoftmax,
}

impl Activation {
    pub fn parse(name: &str) -> Option<Activation> {
        match name {
            "identity" | "linear" => Some(Activation::Identity),
            "tanh" => Some(Activation::Tanh),
            "relu" => Some(Activation::Relu),
            "sigmoid" => Some(Activation::Sigmoid),
            "softmax" => Some(Activation::Softmax),
            "log_softmax" => Some(Activation::LogSoftmax),
            _ => None,
        }
    }

    pub fn apply<B: Backend>(self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Activation::Identity => z,
            Activation::Tanh => z.tanh(),
            Activation::Relu => activation::relu(z),
            Activation::Sigmoid => activation::sigmoid(z),
            Activation::Softmax => activation::softmax(z, 1),
            Activation::LogSoftmax => activation::log_softmax(z, 1),
        }
    }

    /// Activation of a layer: explicit option, else the class default.
    pub fn of(spec: &crate::config::LayerSpec) -> Result<Activation, BuildError> {
        let default = match spec.class.as_str() {
            "hidden" => Activation::Tanh,
            "softmax" => Activation::Softmax,
            _ => Activation::Identity,
        };
        match spec.opt_str("activation")? {
            None => Ok(default),
            Some(name) => Activation::parse(name).ok_or_else(|| BuildError::InvalidOption {
                layer: spec.name.clone(),
                key: "activation".to_string(),
                reason: format!("unknown activation '{}'", name),
            }),
        }
    }
}

// ─── linear / hidden / forward / softmax ───────────────────────────

pub fn linear_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Linear,
        describe: describe_linear,
        forward: forward_linear::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: true,
        default_source: true,
    }
}

pub fn softmax_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        describe: describe_softmax,
        ..linear_class::<B>()
    }
}

fn describe_linear(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    Activation::of(ctx.spec)?;
    let n_out = ctx.n_out()?.ok_or_else(|| ctx.fail("'n_out' is required"))?;
    check_sparse_inputs(ctx)?;
    Ok(OutputDesc::dense(n_out))
}

fn describe_softmax(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    Activation::of(ctx.spec)?;
    let n_out = match ctx.n_out()? {
        Some(n) => n,
        None => ctx
            .target
            .as_ref()
            .and_then(|t| t.dim)
            .ok_or_else(|| ctx.fail("'n_out' is required when there is no sparse target"))?,
    };
    check_sparse_inputs(ctx)?;
    Ok(OutputDesc::dense(n_out))
}

fn check_sparse_inputs(ctx: &DescribeCtx<'_>) -> Result<(), BuildError> {
    for desc in ctx.inputs.iter().flatten() {
        if desc.sparse && desc.dim.is_none() {
            return Err(ctx.fail("sparse input without a vocabulary size"));
        }
    }
    Ok(())
}

/// `Σ_src W_src · x_src`; sparse sources are embedding lookups.
pub(crate) fn project_inputs<B: Backend>(
    ctx: &mut ForwardCtx<'_, B>,
    n_out: usize,
    tag: &str,
) -> Result<Option<Tensor<B, 2>>, ExecError> {
    let mut z: Option<Tensor<B, 2>> = None;
    for (i, x) in ctx.inputs.iter().enumerate() {
        let key = format!("{}/{}_{}", ctx.spec.name, tag, ctx.input_names[i]);
        let part = match x {
            Value::Sparse(labels) => {
                let vocab = ctx.input_descs[i].dim.unwrap_or(0);
                check_labels(ctx, &ctx.input_names[i], labels, vocab)?;
                let rows = labels.dims()[0];
                let table = ctx.params.embedding(&key, vocab, n_out)?;
                table
                    .forward(labels.clone().reshape([rows, 1]))
                    .reshape([rows, n_out])
            }
            Value::Dense(t) => {
                let linear = ctx.params.linear(&key, t.dims()[1], n_out)?;
                linear.forward(t.clone())
            }
        };
        z = Some(match z {
            Some(acc) => acc + part,
            None => part,
        });
    }
    Ok(z)
}

fn check_labels<B: Backend>(
    ctx: &ForwardCtx<'_, B>,
    input: &str,
    labels: &Tensor<B, 1, Int>,
    vocab: usize,
) -> Result<(), ExecError> {
    let values = tensor_to_labels(labels.clone())?;
    match values.iter().find(|&&l| l < 0 || l as usize >= vocab) {
        Some(l) => Err(ctx.error(&format!(
            "label {} from '{}' is outside the vocabulary of {}",
            l, input, vocab
        ))),
        None => Ok(()),
    }
}

fn forward_linear<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let n_out = ctx.desc.width();
    let act = Activation::of(ctx.spec).map_err(|e| ctx.error(&e.to_string()))?;
    let with_bias = ctx
        .spec
        .opt_bool("with_bias")
        .map_err(|e| ctx.error(&e.to_string()))?
        .unwrap_or(true);
    let device = ctx.device();
    let mut z = project_inputs(ctx, n_out, "W_in")?
        .unwrap_or_else(|| Tensor::<B, 2>::zeros([ctx.rows, n_out], &device));
    if with_bias {
        let key = format!("{}/b", ctx.spec.name);
        z = z + ctx.params.bias(&key, n_out)?;
    }
    Ok(Produced::value(Value::Dense(act.apply(z))))
}

// ─── copy ──────────────────────────────────────────────────────────

pub fn copy_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Copy,
        describe: describe_copy,
        forward: forward_copy::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: true,
        default_source: true,
    }
}

fn describe_copy(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    match ctx.inputs.len() {
        0 => Err(ctx.fail("needs at least one input")),
        1 => Ok(ctx.require(0)?.clone().with_beam(None)),
        n => {
            let mut width = 0;
            for i in 0..n {
                let desc = ctx.require(i)?;
                if desc.sparse {
                    return Err(ctx.fail("cannot concatenate sparse inputs"));
                }
                width += desc.width();
            }
            Ok(OutputDesc::dense(width))
        }
    }
}

fn forward_copy<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    if ctx.inputs.len() == 1 {
        return Ok(Produced::value(ctx.inputs[0].clone()));
    }
    let parts = ctx
        .inputs
        .iter()
        .map(|v| v.dense(&ctx.spec.name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Produced::value(Value::Dense(Tensor::cat(parts, 1))))
}

// ─── combine ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CombineKind {
    Add,
    Sub,
    Mul,
}

fn combine_kind(spec: &crate::config::LayerSpec) -> Result<CombineKind, BuildError> {
    match spec.opt_str("kind")?.unwrap_or("add") {
        "add" => Ok(CombineKind::Add),
        "sub" => Ok(CombineKind::Sub),
        "mul" => Ok(CombineKind::Mul),
        other => Err(BuildError::InvalidOption {
            layer: spec.name.clone(),
            key: "kind".to_string(),
            reason: format!("unknown combine kind '{}'", other),
        }),
    }
}

pub fn combine_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Combine,
        describe: describe_combine,
        forward: forward_combine::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: true,
        default_source: true,
    }
}

fn describe_combine(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    combine_kind(ctx.spec)?;
    if ctx.inputs.is_empty() {
        return Err(ctx.fail("needs at least one input"));
    }
    // Any one known input determines the shape.
    let first = match ctx.first_known() {
        Some(desc) => desc.clone(),
        None => {
            ctx.require(0)?;
            return Err(ctx.fail("no input descriptor is known"));
        }
    };
    for desc in ctx.inputs.iter().flatten() {
        if desc.sparse || desc.width() != first.width() {
            return Err(ctx.fail(&format!(
                "inputs must be dense with equal width, got {} and {}",
                first, desc
            )));
        }
    }
    Ok(OutputDesc::dense(first.width()))
}

fn forward_combine<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let kind = combine_kind(ctx.spec).map_err(|e| ctx.error(&e.to_string()))?;
    let mut acc: Option<Tensor<B, 2>> = None;
    for v in &ctx.inputs {
        let x = v.dense(&ctx.spec.name)?;
        acc = Some(match acc {
            None => x,
            Some(a) => match kind {
                CombineKind::Add => a + x,
                CombineKind::Sub => a - x,
                CombineKind::Mul => a * x,
            },
        });
    }
    acc.map(|t| Produced::value(Value::Dense(t)))
        .ok_or_else(|| ctx.error("no inputs"))
}

// ─── constant ──────────────────────────────────────────────────────

pub fn constant_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Constant,
        describe: describe_constant,
        forward: forward_constant::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: true,
        default_source: false,
    }
}

fn describe_constant(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    let value = ctx.spec.opt_f32("value")?.unwrap_or(0.0);
    match ctx.spec.opt_str("dtype")?.unwrap_or("float32") {
        "float32" => Ok(OutputDesc::dense(ctx.n_out()?.unwrap_or(1))),
        "int32" => {
            if value < 0.0 || value.fract() != 0.0 {
                return Err(ctx.fail("an int32 constant must be a non-negative integer"));
            }
            let vocab = ctx.n_out()?.unwrap_or(value as usize + 1);
            Ok(OutputDesc::sparse(vocab))
        }
        other => Err(ctx.fail(&format!("unsupported dtype '{}'", other))),
    }
}

fn forward_constant<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let value = ctx
        .spec
        .opt_f32("value")
        .map_err(|e| ctx.error(&e.to_string()))?
        .unwrap_or(0.0);
    let device = ctx.device();
    let out = if ctx.desc.sparse {
        Value::Sparse(Tensor::<B, 1, Int>::full([ctx.rows], value as i64, &device))
    } else {
        Value::Dense(Tensor::<B, 2>::full([ctx.rows, ctx.desc.width()], value, &device))
    };
    Ok(Produced::value(out))
}

// ─── compare ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareKind {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

fn compare_kind(spec: &crate::config::LayerSpec) -> Result<CompareKind, BuildError> {
    match spec.opt_str("kind")?.unwrap_or("equal") {
        "equal" => Ok(CompareKind::Equal),
        "not_equal" => Ok(CompareKind::NotEqual),
        "less" => Ok(CompareKind::Less),
        "less_equal" => Ok(CompareKind::LessEqual),
        "greater" => Ok(CompareKind::Greater),
        "greater_equal" => Ok(CompareKind::GreaterEqual),
        other => Err(BuildError::InvalidOption {
            layer: spec.name.clone(),
            key: "kind".to_string(),
            reason: format!("unknown compare kind '{}'", other),
        }),
    }
}

pub fn compare_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::Compare,
        describe: describe_compare,
        forward: forward_compare::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: true,
        default_source: true,
    }
}

fn describe_compare(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    compare_kind(ctx.spec)?;
    if ctx.inputs.len() != 1 {
        return Err(ctx.fail("compares exactly one input against 'value'"));
    }
    if let Some(desc) = &ctx.inputs[0] {
        if desc.width() != 1 {
            return Err(ctx.fail(&format!("input must have width 1, got {}", desc)));
        }
    }
    Ok(OutputDesc::flag())
}

fn forward_compare<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let kind = compare_kind(ctx.spec).map_err(|e| ctx.error(&e.to_string()))?;
    let value = ctx
        .spec
        .opt_f32("value")
        .map_err(|e| ctx.error(&e.to_string()))?
        .unwrap_or(0.0);
    let x = ctx.inputs[0].as_float();
    let rows = x.dims()[0];
    let flags = match kind {
        CompareKind::Equal => x.equal_elem(value),
        CompareKind::NotEqual => x.equal_elem(value).bool_not(),
        CompareKind::Less => x.lower_elem(value),
        CompareKind::LessEqual => x.lower_equal_elem(value),
        CompareKind::Greater => x.greater_elem(value),
        CompareKind::GreaterEqual => x.greater_equal_elem(value),
    };
    Ok(Produced::value(Value::Sparse(flags.int().reshape([rows]))))
}

// ─── :i ────────────────────────────────────────────────────────────

pub fn step_index_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::StepIndex,
        describe: describe_step_index,
        forward: forward_step_index::<B>,
        aux_state: None,
        sub_output: None,
        row_wise: false,
        default_source: false,
    }
}

fn describe_step_index(_ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    Ok(OutputDesc {
        shape: vec![Dim::Batch],
        dtype: DType::Int32,
        sparse: true,
        dim: None,
        beam: None,
    })
}

fn forward_step_index<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let step = ctx
        .step
        .ok_or_else(|| ctx.error("the step counter only exists inside the loop"))?;
    let device = ctx.device();
    Ok(Produced::value(Value::Sparse(Tensor::<B, 1, Int>::full(
        [ctx.rows],
        step as i64,
        &device,
    ))))
}
