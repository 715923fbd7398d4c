//! The recurrent layer: build a plan once, run it on many batches.
//!
//! ```ignore
//! let layer = RecLayer::new(net, RecOptions::default().with_search(true));
//! let plan = layer.build(&registry, &env)?;
//! let out = plan.run(&registry, &inputs, &mut params)?.decide(false);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;

use burn::prelude::*;

use crate::config::{NetDict, RecOptions};
use crate::error::{BuildError, ExecError};
use crate::exec::driver::Driver;
use crate::exec::search::SearchRecord;
use crate::exec::value::{index_tensor, Stacked, Value};
use crate::layers::{LayerRegistry, LossSummary, ParamStore};
use crate::net::hoist::{self, Partition};
use crate::net::template::{Template, TemplateBuilder, TemplateEnv};

/// A recurrent subnetwork definition with its options.
#[derive(Clone, Debug)]
pub struct RecLayer {
    net: NetDict,
    options: RecOptions,
}

impl RecLayer {
    pub fn new(net: NetDict, options: RecOptions) -> Self {
        Self { net, options }
    }

    pub fn net(&self) -> &NetDict {
        &self.net
    }

    pub fn options(&self) -> &RecOptions {
        &self.options
    }

    /// Construct the template and decide where each layer runs.
    pub fn build<B: Backend>(
        &self,
        registry: &LayerRegistry<B>,
        env: &TemplateEnv,
    ) -> Result<RecPlan, BuildError> {
        let template = TemplateBuilder::new(&self.net, registry, env)
            .with_options(self.options.clone())
            .build()?;
        let partition = hoist::partition(&template, registry);
        Ok(RecPlan {
            template,
            partition,
        })
    }
}

/// A built template plus its loop partition.
#[derive(Clone, Debug)]
pub struct RecPlan {
    template: Template,
    partition: Partition,
}

impl RecPlan {
    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn run<B: Backend>(
        &self,
        registry: &LayerRegistry<B>,
        inputs: &RecInputs<B>,
        params: &mut ParamStore<B>,
    ) -> Result<RecOutput<B>, ExecError> {
        Driver::new(&self.template, &self.partition, registry, inputs, params).run()
    }
}

// ─── Inputs ────────────────────────────────────────────────────────

/// Extern data sequences and outer-scope values of one batch.
#[derive(Clone, Debug)]
pub struct RecInputs<B: Backend> {
    batch: usize,
    data: BTreeMap<String, Stacked<B>>,
    lengths: BTreeMap<String, Vec<usize>>,
    base: BTreeMap<String, Value<B>>,
}

impl<B: Backend> RecInputs<B> {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            data: BTreeMap::new(),
            lengths: BTreeMap::new(),
            base: BTreeMap::new(),
        }
    }

    /// A time-major sequence `[steps, batch, ...]` for `data:<key>`.
    pub fn with_data(mut self, key: &str, value: Stacked<B>) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// Per-entry valid lengths of `data:<key>`; without them every entry
    /// spans all frames.
    pub fn with_lengths(mut self, key: &str, lengths: Vec<usize>) -> Self {
        self.lengths.insert(key.to_string(), lengths);
        self
    }

    /// A value `[batch, ...]` for `base:<name>`.
    pub fn with_base(mut self, name: &str, value: Value<B>) -> Self {
        self.base.insert(name.to_string(), value);
        self
    }

    /// Zero-filled inputs for every key of `env`, `steps` frames long.
    pub fn zeros(env: &TemplateEnv, batch: usize, steps: usize, device: &B::Device) -> Self {
        let mut inputs = Self::new(batch);
        for (key, desc) in &env.data {
            let value = if desc.sparse {
                Stacked::Sparse(Tensor::<B, 2, Int>::zeros([steps, batch], device))
            } else {
                Stacked::Dense(Tensor::zeros([steps, batch, desc.width()], device))
            };
            inputs = inputs.with_data(key, value);
        }
        for (name, desc) in &env.base {
            let value = if desc.sparse {
                Value::Sparse(Tensor::<B, 1, Int>::zeros([batch], device))
            } else {
                Value::Dense(Tensor::zeros([batch, desc.width()], device))
            };
            inputs = inputs.with_base(name, value);
        }
        inputs
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn data(&self, key: &str) -> Option<&Stacked<B>> {
        self.data.get(key)
    }

    pub fn lengths(&self, key: &str) -> Option<&[usize]> {
        self.lengths.get(key).map(Vec::as_slice)
    }

    pub fn base(&self, name: &str) -> Option<&Value<B>> {
        self.base.get(name)
    }
}

// ─── Output ────────────────────────────────────────────────────────

/// Resolved results of one run. Every per-hypothesis field has
/// `batch * beam_size` rows, batch major.
#[derive(Clone, Debug)]
pub struct RecOutput<B: Backend> {
    /// Time-major values of every evaluated layer, by name.
    pub outputs: BTreeMap<String, Stacked<B>>,
    pub seq_lens: Vec<usize>,
    pub batch: usize,
    pub beam_size: usize,
    /// Final hypothesis scores, zeros without search.
    pub scores: Vec<f32>,
    /// Summed losses per loss-bearing layer. Only filled without search.
    pub losses: BTreeMap<String, LossSummary>,
    /// Steps the loop executed.
    pub steps: usize,
    /// Final auxiliary state per cell layer.
    pub final_states: BTreeMap<String, Vec<Tensor<B, 2>>>,
    pub search: SearchRecord,
}

impl<B: Backend> RecOutput<B> {
    pub fn output(&self, name: &str) -> Option<&Stacked<B>> {
        self.outputs.get(name)
    }

    /// Collapse every beam to its best hypothesis. Ties keep the lowest
    /// slot.
    pub fn decide(&self, length_normalization: bool) -> RecOutput<B> {
        let k = self.beam_size.max(1);
        let rank = |row: usize| {
            let score = self.scores.get(row).copied().unwrap_or(f32::NEG_INFINITY);
            if length_normalization {
                score / self.seq_lens.get(row).copied().unwrap_or(1).max(1) as f32
            } else {
                score
            }
        };
        let rows: Vec<usize> = (0..self.batch)
            .map(|b| {
                let mut best = b * k;
                for row in b * k + 1..(b + 1) * k {
                    if rank(row) > rank(best) {
                        best = row;
                    }
                }
                best
            })
            .collect();
        self.select(&rows, 1)
    }

    /// Keep the whole beam, best hypothesis first within each batch entry.
    pub fn keep_beam(&self) -> RecOutput<B> {
        let k = self.beam_size.max(1);
        let score = |row: usize| self.scores.get(row).copied().unwrap_or(f32::NEG_INFINITY);
        let mut rows = Vec::with_capacity(self.batch * k);
        for b in 0..self.batch {
            let mut slots: Vec<usize> = (b * k..(b + 1) * k).collect();
            slots.sort_by(|&x, &y| score(y).partial_cmp(&score(x)).unwrap_or(Ordering::Equal));
            rows.extend(slots);
        }
        self.select(&rows, k)
    }

    /// Final state of a cell layer, its parts concatenated on the feature
    /// axis.
    pub fn last_hidden_state(&self, layer: &str) -> Result<Tensor<B, 2>, ExecError> {
        match self.final_states.get(layer) {
            Some(parts) if !parts.is_empty() => Ok(Tensor::cat(parts.clone(), 1)),
            _ => Err(ExecError::LastHiddenStateUnavailable {
                layer: layer.to_string(),
            }),
        }
    }

    fn select(&self, rows: &[usize], beam_size: usize) -> RecOutput<B> {
        let pick = |values: &[f32]| -> Vec<f32> {
            rows.iter()
                .map(|&r| values.get(r).copied().unwrap_or(0.0))
                .collect()
        };
        RecOutput {
            outputs: self
                .outputs
                .iter()
                .map(|(name, s)| (name.clone(), s.select_rows(rows)))
                .collect(),
            seq_lens: rows
                .iter()
                .map(|&r| self.seq_lens.get(r).copied().unwrap_or(0))
                .collect(),
            batch: self.batch,
            beam_size,
            scores: pick(&self.scores),
            losses: self.losses.clone(),
            steps: self.steps,
            final_states: self
                .final_states
                .iter()
                .map(|(name, parts)| {
                    let selected = parts
                        .iter()
                        .map(|p| p.clone().select(0, index_tensor::<B>(rows, &p.device())))
                        .collect();
                    (name.clone(), selected)
                })
                .collect(),
            search: self.search.clone(),
        }
    }
}
