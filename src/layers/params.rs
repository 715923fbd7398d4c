//! Layer parameters, keyed by `<layer>/<param>`.
//!
//! Projections are `burn::nn::Linear` modules and sparse inputs read from
//! `burn::nn::Embedding` tables, both Xavier-uniform initialised on first
//! use. Each key seeds the backend RNG with a BLAKE3 digest of its name
//! right before initialisation, so a layer evaluated inside the loop,
//! hoisted before it, or deferred after it sees identical weights even
//! across separate stores.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use burn::module::{Initializer, Param};
use burn::nn::{Embedding, Linear, LinearConfig};
use burn::prelude::*;

use crate::error::ExecError;

/// Seeding and drawing must not interleave across stores.
static INIT_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug)]
enum Entry<B: Backend> {
    Linear(Linear<B>),
    Embedding(Embedding<B>),
    /// Biases and explicitly installed values.
    Tensor(Param<Tensor<B, 2>>),
}

impl<B: Backend> Entry<B> {
    fn weight(&self) -> Param<Tensor<B, 2>> {
        match self {
            Entry::Linear(linear) => linear.weight.clone(),
            Entry::Embedding(table) => table.weight.clone(),
            Entry::Tensor(param) => param.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ParamStore<B: Backend> {
    params: BTreeMap<String, Entry<B>>,
    device: B::Device,
}

impl<B: Backend> ParamStore<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            params: BTreeMap::new(),
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Install an explicit parameter value. Its shape is checked on first use.
    pub fn set(&mut self, key: &str, value: Tensor<B, 2>) {
        self.params
            .insert(key.to_string(), Entry::Tensor(Param::from_tensor(value)));
    }

    pub fn get(&self, key: &str) -> Option<Tensor<B, 2>> {
        self.params.get(key).map(|entry| entry.weight().val())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Bias-free projection `[d_in] -> [d_out]`.
    pub fn linear(&mut self, key: &str, d_in: usize, d_out: usize) -> Result<Linear<B>, ExecError> {
        let linear = match self.params.get(key) {
            Some(Entry::Linear(linear)) => linear.clone(),
            Some(entry) => Linear {
                weight: entry.weight(),
                bias: None,
            },
            None => self.seeded(key, |device| {
                let linear = LinearConfig::new(d_in, d_out)
                    .with_bias(false)
                    .with_initializer(glorot())
                    .init::<B>(device);
                let _ = linear.weight.val();
                linear
            }),
        };
        check_shape(key, &linear.weight, [d_in, d_out])?;
        self.params
            .insert(key.to_string(), Entry::Linear(linear.clone()));
        Ok(linear)
    }

    /// Lookup table with one `d`-wide row per label in `0..vocab`.
    pub fn embedding(&mut self, key: &str, vocab: usize, d: usize) -> Result<Embedding<B>, ExecError> {
        let table = match self.params.get(key) {
            Some(Entry::Embedding(table)) => table.clone(),
            Some(entry) => Embedding {
                weight: entry.weight(),
            },
            None => self.seeded(key, |device| {
                // EmbeddingConfig gives no fan sizes to the initializer.
                let weight = glorot().init_with([vocab, d], Some(vocab), Some(d), device);
                let _ = weight.val();
                Embedding { weight }
            }),
        };
        check_shape(key, &table.weight, [vocab, d])?;
        self.params
            .insert(key.to_string(), Entry::Embedding(table.clone()));
        Ok(table)
    }

    /// Bias row `[1, cols]`, zero initialised on first use.
    pub fn bias(&mut self, key: &str, cols: usize) -> Result<Tensor<B, 2>, ExecError> {
        let param = match self.params.get(key) {
            Some(entry) => entry.weight(),
            None => {
                let param = Initializer::Zeros.init::<B, 2, _>([1, cols], &self.device);
                self.params
                    .insert(key.to_string(), Entry::Tensor(param.clone()));
                param
            }
        };
        check_shape(key, &param, [1, cols])?;
        Ok(param.val())
    }

    fn seeded<T>(&self, key: &str, init: impl FnOnce(&B::Device) -> T) -> T {
        let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        B::seed(&self.device, key_seed(key));
        init(&self.device)
    }
}

fn glorot() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

/// RNG seed for one parameter key.
pub fn key_seed(key: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"recnet/param/");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(seed)
}

fn check_shape<B: Backend>(
    key: &str,
    param: &Param<Tensor<B, 2>>,
    expected: [usize; 2],
) -> Result<(), ExecError> {
    let found = param.val().dims();
    if found == expected {
        return Ok(());
    }
    Err(ExecError::ShapeMismatch {
        layer: key.split('/').next().unwrap_or(key).to_string(),
        reason: format!(
            "parameter '{}' has shape {:?}, expected {:?}",
            key, found, expected
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::value::{dense_tensor, labels_tensor, tensor_to_f32};
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn seeds_differ_per_key() {
        assert_eq!(key_seed("lin/W_in_data"), key_seed("lin/W_in_data"));
        assert_ne!(key_seed("lin/W_in_data"), key_seed("lin/W_re"));
    }

    #[test]
    fn weights_are_cached_per_key() {
        let device = Default::default();
        let mut store = ParamStore::<B>::new(&device);
        let w1 = tensor_to_f32(store.linear("lin/W", 3, 2).unwrap().weight.val()).unwrap();
        let w2 = tensor_to_f32(store.linear("lin/W", 3, 2).unwrap().weight.val()).unwrap();
        assert_eq!(w1, w2);
        assert_eq!(store.len(), 1);
        let limit = (6.0f32 / 5.0).sqrt();
        assert!(w1.iter().all(|v| v.abs() <= limit));

        let mut other = ParamStore::<B>::new(&device);
        let w3 = tensor_to_f32(other.linear("lin/W", 3, 2).unwrap().weight.val()).unwrap();
        assert_eq!(w3, w1);
    }

    #[test]
    fn explicit_values_win() {
        let device = Default::default();
        let mut store = ParamStore::<B>::new(&device);
        store.set("lin/b", Tensor::<B, 2>::ones([1, 2], &device));
        assert_eq!(
            tensor_to_f32(store.bias("lin/b", 2).unwrap()).unwrap(),
            vec![1.0, 1.0]
        );
        assert_eq!(
            tensor_to_f32(store.bias("other/b", 3).unwrap()).unwrap(),
            vec![0.0; 3]
        );
    }

    #[test]
    fn embedding_rows_follow_labels() {
        let device = Default::default();
        let mut store = ParamStore::<B>::new(&device);
        store.set(
            "emb/W_in_data",
            dense_tensor(vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5], 3, 2, &device),
        );
        let table = store.embedding("emb/W_in_data", 3, 2).unwrap();
        let rows = table
            .forward(labels_tensor::<B>(&[2, 0], &device).reshape([2, 1]))
            .reshape([2, 2]);
        assert_eq!(tensor_to_f32(rows).unwrap(), vec![2.0, 2.5, 0.0, 0.5]);
    }

    #[test]
    fn wrongly_shaped_values_are_rejected() {
        let device = Default::default();
        let mut store = ParamStore::<B>::new(&device);
        store.set("lin/W_in_data", Tensor::<B, 2>::ones([4, 2], &device));
        let err = store.linear("lin/W_in_data", 3, 2).unwrap_err();
        assert!(matches!(err, ExecError::ShapeMismatch { ref layer, .. } if layer == "lin"));

        store.linear("lin/W_re", 2, 2).unwrap();
        assert!(store.linear("lin/W_re", 2, 4).is_err());
        assert!(store.bias("lin/W_re", 2).is_err());
    }
}
