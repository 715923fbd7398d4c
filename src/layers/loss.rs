//! Per-frame losses.
//!
//! Losses are evaluated per row and per step and reduced later over the
//! valid frames only, so variable sequence lengths do not bias the average.

use burn::prelude::*;

use crate::config::LayerSpec;
use crate::error::{BuildError, ExecError};
use crate::exec::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    CrossEntropy,
    MeanSquared,
}

impl LossKind {
    pub fn parse(spec: &LayerSpec) -> Result<Option<LossKind>, BuildError> {
        match spec.loss.as_deref() {
            None => Ok(None),
            Some("ce") | Some("cross_entropy") => Ok(Some(LossKind::CrossEntropy)),
            Some("mse") => Ok(Some(LossKind::MeanSquared)),
            Some(other) => Err(BuildError::InvalidOption {
                layer: spec.name.clone(),
                key: "loss".to_string(),
                reason: format!("unknown loss '{}'", other),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "ce",
            LossKind::MeanSquared => "mse",
        }
    }

    /// Loss of every row: `[rows]`.
    ///
    /// Cross entropy reads `output` as a distribution over the vocabulary;
    /// `log_space` says it already holds log-probabilities.
    pub fn frame_loss<B: Backend>(
        self,
        layer: &str,
        output: &Value<B>,
        target: &Value<B>,
        log_space: bool,
    ) -> Result<Tensor<B, 1>, ExecError> {
        let out = output.dense(layer)?;
        let [rows, width] = out.dims();
        if target.rows() != rows {
            return Err(ExecError::ShapeMismatch {
                layer: layer.to_string(),
                reason: format!("loss target has {} rows, output has {}", target.rows(), rows),
            });
        }
        match self {
            LossKind::CrossEntropy => {
                let labels = target.sparse(layer)?.reshape([rows, 1]);
                let picked = out.gather(1, labels);
                let logp = if log_space {
                    picked
                } else {
                    picked.clamp_min(1e-12).log()
                };
                Ok(logp.neg().reshape([rows]))
            }
            LossKind::MeanSquared => {
                let t = target.as_float();
                if t.dims()[1] != width {
                    return Err(ExecError::ShapeMismatch {
                        layer: layer.to_string(),
                        reason: format!(
                            "mse target width {} does not match output width {}",
                            t.dims()[1],
                            width
                        ),
                    });
                }
                Ok((out - t).powf_scalar(2.0).mean_dim(1).reshape([rows]))
            }
        }
    }
}

/// A loss summed over all valid frames, with the frame count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossSummary {
    pub kind: LossKind,
    pub total: f32,
    pub frames: usize,
}

impl LossSummary {
    /// Average loss per valid frame.
    pub fn mean(&self) -> f32 {
        if self.frames == 0 {
            0.0
        } else {
            self.total / self.frames as f32
        }
    }
}

/// Sum per-step row losses over the frames inside each row's length.
/// `steps[t][row]` is the loss of `row` at step `t`.
pub fn reduce_frames(kind: LossKind, steps: &[Vec<f32>], seq_lens: &[usize]) -> LossSummary {
    let mut total = 0.0f32;
    let mut frames = 0usize;
    for (t, rows) in steps.iter().enumerate() {
        for (row, &loss) in rows.iter().enumerate() {
            if seq_lens.get(row).is_some_and(|&len| t < len) {
                total += loss;
                frames += 1;
            }
        }
    }
    LossSummary {
        kind,
        total,
        frames,
    }
}
