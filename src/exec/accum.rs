//! Step-indexed accumulators for in-loop layer outputs.

use burn::prelude::Backend;
use tracing::debug;

use crate::error::ExecError;
use crate::exec::value::StepValue;

/// Collects one layer's value per step. Slot `t` must be written before
/// slot `t + 1` and every slot exactly once.
#[derive(Clone, Debug)]
pub struct Accumulator<B: Backend> {
    layer: String,
    slots: Vec<StepValue<B>>,
}

impl<B: Backend> Accumulator<B> {
    pub fn new(layer: &str) -> Self {
        Self::with_capacity(layer, 0)
    }

    /// Pre-size for `steps` slots; writing past them still works.
    pub fn with_capacity(layer: &str, steps: usize) -> Self {
        Self {
            layer: layer.to_string(),
            slots: Vec::with_capacity(steps),
        }
    }

    pub fn write(&mut self, step: usize, value: StepValue<B>) -> Result<(), ExecError> {
        if step != self.slots.len() {
            return Err(ExecError::AccumulatorOrder {
                layer: self.layer.clone(),
                expected: self.slots.len(),
                got: step,
            });
        }
        if self.slots.len() == self.slots.capacity() {
            debug!(layer = %self.layer, step, "accumulator grows");
        }
        self.slots.push(value);
        Ok(())
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&StepValue<B>> {
        self.slots.get(step)
    }

    pub fn steps(&self) -> &[StepValue<B>] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::value::{labels_tensor, Value};
    use burn::backend::NdArray;

    type B = NdArray;

    fn label(v: i64) -> StepValue<B> {
        let device = Default::default();
        StepValue::beamless(Value::Sparse(labels_tensor(&[v], &device)))
    }

    #[test]
    fn writes_in_order_and_grows() {
        let mut acc = Accumulator::<B>::with_capacity("out", 1);
        for t in 0..4 {
            acc.write(t, label(t as i64)).unwrap();
        }
        assert_eq!(acc.len(), 4);
        assert_eq!(acc.get(3).unwrap().value.to_labels("out").unwrap(), vec![3]);
    }

    #[test]
    fn rejects_gaps_and_rewrites() {
        let mut acc = Accumulator::<B>::new("out");
        acc.write(0, label(0)).unwrap();
        let err = acc.write(2, label(2)).unwrap_err();
        assert!(matches!(
            err,
            ExecError::AccumulatorOrder {
                expected: 1,
                got: 2,
                ..
            }
        ));
        assert!(acc.write(0, label(0)).is_err());
        assert_eq!(acc.len(), 1);
    }
}
