//! Recurrent cells with auxiliary state.
//!
//! The cell math is selected by a named unit resolved through the
//! registry's unit table. The cell's previous hidden state and, for LSTM,
//! its memory cell are carried by the step loop as auxiliary state rather
//! than as `prev:` references.

use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use super::basic::project_inputs;
use super::{DescribeCtx, ForwardCtx, LayerClass, LayerKind, Produced};
use crate::config::LayerSpec;
use crate::error::{BuildError, ExecError};
use crate::exec::value::Value;
use crate::net::descriptor::OutputDesc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellUnit {
    Rnn,
    Lstm,
}

impl CellUnit {
    /// Number of auxiliary state tensors the unit carries.
    pub fn state_parts(self) -> usize {
        match self {
            CellUnit::Rnn => 1,
            CellUnit::Lstm => 2,
        }
    }

    fn gates(self) -> usize {
        match self {
            CellUnit::Rnn => 1,
            CellUnit::Lstm => 4,
        }
    }
}

pub fn rec_class<B: Backend>() -> LayerClass<B> {
    LayerClass {
        kind: LayerKind::RecCell,
        describe: describe_rec,
        forward: forward_rec::<B>,
        aux_state: Some(initial_state::<B>),
        sub_output: Some(rec_sub_output),
        row_wise: false,
        default_source: true,
    }
}

fn describe_rec(ctx: &DescribeCtx<'_>) -> Result<OutputDesc, BuildError> {
    if ctx.unit.is_none() {
        return Err(ctx.fail("'unit' is required"));
    }
    let n_out = ctx.n_out()?.ok_or_else(|| ctx.fail("'n_out' is required"))?;
    for desc in ctx.inputs.iter().flatten() {
        if desc.sparse && desc.dim.is_none() {
            return Err(ctx.fail("sparse input without a vocabulary size"));
        }
    }
    Ok(OutputDesc::dense(n_out))
}

fn rec_sub_output(ctx: &DescribeCtx<'_>, desc: &OutputDesc, key: &str) -> Option<OutputDesc> {
    match (key, ctx.unit) {
        ("state", Some(_)) => Some(OutputDesc::dense(desc.width())),
        ("cell", Some(CellUnit::Lstm)) => Some(OutputDesc::dense(desc.width())),
        _ => None,
    }
}

fn initial_state<B: Backend>(
    _spec: &LayerSpec,
    desc: &OutputDesc,
    unit: Option<CellUnit>,
    rows: usize,
    device: &B::Device,
) -> Vec<Tensor<B, 2>> {
    let parts = unit.map_or(1, CellUnit::state_parts);
    (0..parts)
        .map(|_| Tensor::<B, 2>::zeros([rows, desc.width()], device))
        .collect()
}

fn forward_rec<B: Backend>(ctx: &mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError> {
    let unit = ctx.unit.ok_or_else(|| ctx.error("no recurrent unit"))?;
    let n = ctx.desc.width();
    let aux = ctx
        .aux
        .take()
        .ok_or_else(|| ctx.error("recurrent state was not initialised"))?;
    let expected = vec![ctx.rows, n];
    if aux.len() != unit.state_parts() {
        return Err(ExecError::AuxStateMismatch {
            layer: ctx.spec.name.clone(),
            expected: vec![unit.state_parts()],
            found: vec![aux.len()],
        });
    }
    for part in &aux {
        let found = part.dims().to_vec();
        if found != expected {
            return Err(ExecError::AuxStateMismatch {
                layer: ctx.spec.name.clone(),
                expected,
                found,
            });
        }
    }

    let width = n * unit.gates();
    let device = ctx.device();
    let name = ctx.spec.name.clone();
    let mut z = project_inputs(ctx, width, "W_in")?
        .unwrap_or_else(|| Tensor::<B, 2>::zeros([ctx.rows, width], &device));
    let recurrent = ctx.params.linear(&format!("{}/W_re", name), n, width)?;
    z = z + recurrent.forward(aux[0].clone()) + ctx.params.bias(&format!("{}/b", name), width)?;

    match unit {
        CellUnit::Rnn => {
            let h = z.tanh();
            Ok(Produced {
                value: Value::Dense(h.clone()),
                aux: Some(vec![h.clone()]),
                extras: vec![("state".to_string(), Value::Dense(h))],
            })
        }
        CellUnit::Lstm => {
            let gate = |i: usize| z.clone().narrow(1, i * n, n);
            let input = sigmoid(gate(0));
            let forget = sigmoid(gate(1));
            let output = sigmoid(gate(2));
            let candidate = gate(3).tanh();
            let c = forget * aux[1].clone() + input * candidate;
            let h = output * c.clone().tanh();
            Ok(Produced {
                value: Value::Dense(h.clone()),
                aux: Some(vec![h.clone(), c.clone()]),
                extras: vec![
                    ("state".to_string(), Value::Dense(h)),
                    ("cell".to_string(), Value::Dense(c)),
                ],
            })
        }
    }
}
