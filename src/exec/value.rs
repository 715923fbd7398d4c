//! Per-step and time-major values.
//!
//! A per-step value has one row per hypothesis: `batch * beam` rows, batch
//! major (`row = b * beam + k`). Dense values are `[rows, features]`, sparse
//! values are `[rows]` label indices.

use burn::prelude::*;

use crate::error::ExecError;
use crate::net::node::NodeId;

/// One choice layer's beam at one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeamRef {
    pub choice: NodeId,
    pub step: usize,
}

#[derive(Clone, Debug)]
pub enum Value<B: Backend> {
    Dense(Tensor<B, 2>),
    Sparse(Tensor<B, 1, Int>),
}

impl<B: Backend> Value<B> {
    pub fn rows(&self) -> usize {
        match self {
            Value::Dense(t) => t.dims()[0],
            Value::Sparse(t) => t.dims()[0],
        }
    }

    /// Feature width, 1 for sparse values.
    pub fn width(&self) -> usize {
        match self {
            Value::Dense(t) => t.dims()[1],
            Value::Sparse(_) => 1,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Value::Sparse(_))
    }

    pub fn device(&self) -> B::Device {
        match self {
            Value::Dense(t) => t.device(),
            Value::Sparse(t) => t.device(),
        }
    }

    pub fn dense(&self, layer: &str) -> Result<Tensor<B, 2>, ExecError> {
        match self {
            Value::Dense(t) => Ok(t.clone()),
            Value::Sparse(_) => Err(ExecError::ShapeMismatch {
                layer: layer.to_string(),
                reason: "expected a dense input, got sparse labels".to_string(),
            }),
        }
    }

    pub fn sparse(&self, layer: &str) -> Result<Tensor<B, 1, Int>, ExecError> {
        match self {
            Value::Sparse(t) => Ok(t.clone()),
            Value::Dense(_) => Err(ExecError::ShapeMismatch {
                layer: layer.to_string(),
                reason: "expected sparse labels, got a dense input".to_string(),
            }),
        }
    }

    /// Dense view: sparse labels become a single float feature.
    pub fn as_float(&self) -> Tensor<B, 2> {
        match self {
            Value::Dense(t) => t.clone(),
            Value::Sparse(t) => {
                let rows = t.dims()[0];
                t.clone().float().reshape([rows, 1])
            }
        }
    }

    /// Gather rows by index.
    pub fn select_rows(&self, indices: &[usize]) -> Value<B> {
        let device = self.device();
        let idx = index_tensor::<B>(indices, &device);
        match self {
            Value::Dense(t) => Value::Dense(t.clone().select(0, idx)),
            Value::Sparse(t) => Value::Sparse(t.clone().select(0, idx)),
        }
    }

    pub fn narrow_rows(&self, start: usize, len: usize) -> Value<B> {
        match self {
            Value::Dense(t) => Value::Dense(t.clone().narrow(0, start, len)),
            Value::Sparse(t) => Value::Sparse(t.clone().narrow(0, start, len)),
        }
    }

    /// Concatenate values along the row axis.
    pub fn cat_rows(values: Vec<Value<B>>, layer: &str) -> Result<Value<B>, ExecError> {
        let sparse = values.first().map(|v| v.is_sparse()).unwrap_or(false);
        if sparse {
            let parts = values
                .iter()
                .map(|v| v.sparse(layer))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Sparse(Tensor::cat(parts, 0)))
        } else {
            let parts = values
                .iter()
                .map(|v| v.dense(layer))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Dense(Tensor::cat(parts, 0)))
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, ExecError> {
        match self {
            Value::Dense(t) => tensor_to_f32(t.clone()),
            Value::Sparse(t) => Ok(tensor_to_labels(t.clone())?
                .into_iter()
                .map(|l| l as f32)
                .collect()),
        }
    }

    pub fn to_labels(&self, layer: &str) -> Result<Vec<i64>, ExecError> {
        tensor_to_labels(self.sparse(layer)?)
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Dense(t) => t.dims().to_vec(),
            Value::Sparse(t) => t.dims().to_vec(),
        }
    }
}

/// A per-step value together with the search beam its rows belong to.
/// `beam == None` means one row per batch entry.
#[derive(Clone, Debug)]
pub struct StepValue<B: Backend> {
    pub value: Value<B>,
    pub beam: Option<BeamRef>,
}

impl<B: Backend> StepValue<B> {
    pub fn new(value: Value<B>, beam: Option<BeamRef>) -> Self {
        Self { value, beam }
    }

    pub fn beamless(value: Value<B>) -> Self {
        Self { value, beam: None }
    }
}

/// A time-major value: step axis first.
#[derive(Clone, Debug)]
pub enum Stacked<B: Backend> {
    Dense(Tensor<B, 3>),
    Sparse(Tensor<B, 2, Int>),
}

impl<B: Backend> Stacked<B> {
    /// Stack per-step values; every step must have the same number of rows.
    pub fn from_steps(steps: Vec<Value<B>>, layer: &str) -> Result<Stacked<B>, ExecError> {
        let rows = steps.first().map(|v| v.rows()).ok_or_else(|| ExecError::Unsupported {
            layer: layer.to_string(),
            reason: "cannot stack zero steps".to_string(),
        })?;
        for (step, v) in steps.iter().enumerate() {
            if v.rows() != rows {
                return Err(ExecError::StackRagged {
                    layer: layer.to_string(),
                    step,
                    expected: rows,
                    found: v.rows(),
                });
            }
        }
        if steps[0].is_sparse() {
            let parts = steps
                .iter()
                .map(|v| v.sparse(layer))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Stacked::Sparse(Tensor::stack::<2>(parts, 0)))
        } else {
            let parts = steps
                .iter()
                .map(|v| v.dense(layer))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Stacked::Dense(Tensor::stack::<3>(parts, 0)))
        }
    }

    pub fn steps(&self) -> usize {
        match self {
            Stacked::Dense(t) => t.dims()[0],
            Stacked::Sparse(t) => t.dims()[0],
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Stacked::Dense(t) => t.dims()[1],
            Stacked::Sparse(t) => t.dims()[1],
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Stacked::Dense(t) => t.dims().to_vec(),
            Stacked::Sparse(t) => t.dims().to_vec(),
        }
    }

    /// The value of one step.
    pub fn step(&self, t: usize) -> Value<B> {
        match self {
            Stacked::Dense(x) => {
                let [_, rows, width] = x.dims();
                Value::Dense(x.clone().narrow(0, t, 1).reshape([rows, width]))
            }
            Stacked::Sparse(x) => {
                let [_, rows] = x.dims();
                Value::Sparse(x.clone().narrow(0, t, 1).reshape([rows]))
            }
        }
    }

    /// Flatten to `[steps * rows, ...]`, step major.
    pub fn flatten(&self) -> Value<B> {
        match self {
            Stacked::Dense(x) => {
                let [steps, rows, width] = x.dims();
                Value::Dense(x.clone().reshape([steps * rows, width]))
            }
            Stacked::Sparse(x) => {
                let [steps, rows] = x.dims();
                Value::Sparse(x.clone().reshape([steps * rows]))
            }
        }
    }

    /// Inverse of [`Stacked::flatten`].
    pub fn unflatten(value: Value<B>, steps: usize) -> Stacked<B> {
        match value {
            Value::Dense(x) => {
                let [n, width] = x.dims();
                Stacked::Dense(x.reshape([steps, n / steps.max(1), width]))
            }
            Value::Sparse(x) => {
                let [n] = x.dims();
                Stacked::Sparse(x.reshape([steps, n / steps.max(1)]))
            }
        }
    }

    /// The same value at every one of `steps` frames.
    pub fn repeat(value: &Value<B>, steps: usize, layer: &str) -> Result<Stacked<B>, ExecError> {
        Stacked::from_steps(vec![value.clone(); steps], layer)
    }

    /// Gather hypotheses (axis 1) by index, for every frame.
    pub fn select_rows(&self, indices: &[usize]) -> Stacked<B> {
        match self {
            Stacked::Dense(x) => {
                let idx = index_tensor::<B>(indices, &x.device());
                Stacked::Dense(x.clone().select(1, idx))
            }
            Stacked::Sparse(x) => {
                let idx = index_tensor::<B>(indices, &x.device());
                Stacked::Sparse(x.clone().select(1, idx))
            }
        }
    }

    /// Keep only the first `steps` frames.
    pub fn truncate(&self, steps: usize) -> Stacked<B> {
        let steps = steps.min(self.steps());
        match self {
            Stacked::Dense(x) => Stacked::Dense(x.clone().narrow(0, 0, steps)),
            Stacked::Sparse(x) => Stacked::Sparse(x.clone().narrow(0, 0, steps)),
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, ExecError> {
        match self {
            Stacked::Dense(t) => tensor_to_f32(t.clone()),
            Stacked::Sparse(t) => Ok(tensor_to_labels(t.clone())?
                .into_iter()
                .map(|l| l as f32)
                .collect()),
        }
    }
}

pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(data, [indices.len()]), device)
}

pub fn labels_tensor<B: Backend>(labels: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::<B, 1, Int>::from_data(TensorData::new(labels.to_vec(), [labels.len()]), device)
}

pub fn dense_tensor<B: Backend>(
    data: Vec<f32>,
    rows: usize,
    cols: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    Tensor::<B, 2>::from_data(TensorData::new(data, [rows, cols]), device)
}

pub fn tensor_to_f32<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>, ExecError> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ExecError::Data(format!("{:?}", e)))
}

pub fn tensor_to_labels<B: Backend, const D: usize>(
    t: Tensor<B, D, Int>,
) -> Result<Vec<i64>, ExecError> {
    t.into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| ExecError::Data(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn select_and_cat_rows() {
        let device = Default::default();
        let v = Value::<B>::Dense(dense_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2, &device));
        let picked = v.select_rows(&[2, 0, 2]);
        assert_eq!(
            picked.to_f32_vec().unwrap(),
            vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]
        );
        let joined = Value::cat_rows(vec![v.clone(), picked], "x").unwrap();
        assert_eq!(joined.rows(), 6);
        assert_eq!(joined.width(), 2);
    }

    #[test]
    fn stack_requires_uniform_rows() {
        let device = Default::default();
        let a = Value::<B>::Sparse(labels_tensor(&[1, 2], &device));
        let b = Value::<B>::Sparse(labels_tensor(&[3], &device));
        let err = Stacked::from_steps(vec![a.clone(), b], "lbl").unwrap_err();
        assert!(matches!(err, ExecError::StackRagged { step: 1, .. }));

        let stacked = Stacked::from_steps(vec![a.clone(), a], "lbl").unwrap();
        assert_eq!(stacked.shape(), vec![2, 2]);
        assert_eq!(stacked.step(1).to_labels("lbl").unwrap(), vec![1, 2]);
    }

    #[test]
    fn flatten_roundtrip_keeps_step_order() {
        let device = Default::default();
        let s0 = Value::<B>::Dense(dense_tensor(vec![0.0, 1.0], 2, 1, &device));
        let s1 = Value::<B>::Dense(dense_tensor(vec![10.0, 11.0], 2, 1, &device));
        let stacked = Stacked::from_steps(vec![s0, s1], "x").unwrap();
        let flat = stacked.flatten();
        assert_eq!(flat.to_f32_vec().unwrap(), vec![0.0, 1.0, 10.0, 11.0]);
        let back = Stacked::unflatten(flat, 2);
        assert_eq!(back.shape(), vec![2, 2, 1]);
        assert_eq!(back.truncate(1).shape(), vec![1, 2, 1]);
        let swapped = back.select_rows(&[1, 0, 1]);
        assert_eq!(
            swapped.to_f32_vec().unwrap(),
            vec![1.0, 0.0, 1.0, 11.0, 10.0, 11.0]
        );
    }
}
