//! Layer catalog.
//!
//! A [`LayerRegistry`] maps class names to [`LayerClass`] tables. Each table
//! holds one function pointer per capability:
//!
//! - `describe`: derive the output descriptor from the input descriptors
//! - `forward`: compute one evaluation (one step, or many steps batched)
//! - `aux_state`: initial auxiliary recurrent state (cells only)
//! - `sub_output`: descriptors of hierarchical sub-outputs (`name/key`)
//!
//! The registry is built once and passed to the template builder and the
//! step-loop driver. Tests extend it with stub classes via
//! [`LayerRegistry::register`].

pub mod basic;
pub mod cell;
pub mod choice;
pub mod loss;
pub mod params;

use std::collections::BTreeMap;

use burn::prelude::*;

use crate::config::LayerSpec;
use crate::error::{BuildError, ExecError};
use crate::exec::value::Value;
use crate::net::descriptor::OutputDesc;

pub use cell::CellUnit;
pub use loss::{LossKind, LossSummary};
pub use params::ParamStore;

/// Closed set of layer kinds the core treats specially.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Linear,
    Copy,
    Combine,
    Constant,
    Compare,
    RecCell,
    Choice,
    StepIndex,
    /// Registered from outside the crate.
    External,
}

/// Inputs to a descriptor derivation.
pub struct DescribeCtx<'a> {
    pub spec: &'a LayerSpec,
    /// Descriptor per declared input; `None` while that input is unknown.
    pub inputs: Vec<Option<OutputDesc>>,
    /// Descriptor of the layer's target data, if it names one.
    pub target: Option<OutputDesc>,
    pub unit: Option<CellUnit>,
    pub search: bool,
}

impl<'a> DescribeCtx<'a> {
    /// Descriptor of input `i`, or a recoverable error if it is unknown.
    pub fn require(&self, i: usize) -> Result<&OutputDesc, BuildError> {
        match self.inputs.get(i) {
            Some(Some(desc)) => Ok(desc),
            Some(None) => Err(BuildError::MissingDescriptor {
                layer: self.spec.name.clone(),
                input: self.input_name(i),
            }),
            None => Err(self.fail(&format!("expected at least {} inputs", i + 1))),
        }
    }

    /// The first input whose descriptor is known.
    pub fn first_known(&self) -> Option<&OutputDesc> {
        self.inputs.iter().flatten().next()
    }

    pub fn all_known(&self) -> bool {
        self.inputs.iter().all(Option::is_some)
    }

    pub fn n_out(&self) -> Result<Option<usize>, BuildError> {
        self.spec.opt_usize("n_out")
    }

    /// Wrap a class-level failure with the full layer description.
    pub fn fail(&self, reason: &str) -> BuildError {
        BuildError::Describe {
            layer: self.spec.name.clone(),
            class: self.spec.class.clone(),
            options: self.spec.describe_options(),
            reason: reason.to_string(),
        }
    }

    fn input_name(&self, i: usize) -> String {
        self.spec
            .from
            .as_ref()
            .and_then(|refs| refs.get(i))
            .map(|r| r.to_string())
            .unwrap_or_else(|| format!("#{}", i))
    }
}

/// Inputs to one forward evaluation.
pub struct ForwardCtx<'a, B: Backend> {
    pub spec: &'a LayerSpec,
    pub desc: &'a OutputDesc,
    /// Input values, already aligned to a common beam.
    pub inputs: Vec<Value<B>>,
    pub input_descs: Vec<OutputDesc>,
    /// Reference strings of the inputs, used for parameter names.
    pub input_names: Vec<String>,
    pub params: &'a mut ParamStore<B>,
    /// Rows of this evaluation.
    pub rows: usize,
    /// The step index, or `None` when evaluated batched outside the loop.
    pub step: Option<usize>,
    /// Auxiliary state from the previous step.
    pub aux: Option<Vec<Tensor<B, 2>>>,
    pub unit: Option<CellUnit>,
    /// Target labels or values, when the layer names a target.
    pub target: Option<Value<B>>,
}

impl<'a, B: Backend> ForwardCtx<'a, B> {
    pub fn device(&self) -> B::Device {
        self.params.device().clone()
    }

    pub fn error(&self, reason: &str) -> ExecError {
        ExecError::ShapeMismatch {
            layer: self.spec.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Result of one forward evaluation.
pub struct Produced<B: Backend> {
    pub value: Value<B>,
    pub aux: Option<Vec<Tensor<B, 2>>>,
    /// Sub-outputs addressable as `name/key`.
    pub extras: Vec<(String, Value<B>)>,
}

impl<B: Backend> Produced<B> {
    pub fn value(value: Value<B>) -> Self {
        Self {
            value,
            aux: None,
            extras: Vec::new(),
        }
    }
}

pub type DescribeFn = fn(&DescribeCtx<'_>) -> Result<OutputDesc, BuildError>;
pub type ForwardFn<B> = fn(&mut ForwardCtx<'_, B>) -> Result<Produced<B>, ExecError>;
pub type AuxInitFn<B> =
    fn(&LayerSpec, &OutputDesc, Option<CellUnit>, usize, &<B as Backend>::Device) -> Vec<Tensor<B, 2>>;
pub type SubOutputFn = fn(&DescribeCtx<'_>, &OutputDesc, &str) -> Option<OutputDesc>;

/// Capability table of one layer class.
pub struct LayerClass<B: Backend> {
    pub kind: LayerKind,
    pub describe: DescribeFn,
    pub forward: ForwardFn<B>,
    pub aux_state: Option<AuxInitFn<B>>,
    pub sub_output: Option<SubOutputFn>,
    /// Rows are independent, so the layer can run once over all steps.
    pub row_wise: bool,
    /// Reads `data:source` when the definition has no `from`.
    pub default_source: bool,
}

impl<B: Backend> Clone for LayerClass<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for LayerClass<B> {}

impl<B: Backend> LayerClass<B> {
    pub fn has_aux_state(&self) -> bool {
        self.aux_state.is_some()
    }
}

/// Class-name → capability-table registry plus the recurrent unit table.
pub struct LayerRegistry<B: Backend> {
    classes: BTreeMap<String, LayerClass<B>>,
    units: BTreeMap<String, CellUnit>,
}

impl<B: Backend> LayerRegistry<B> {
    pub fn empty() -> Self {
        Self {
            classes: BTreeMap::new(),
            units: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        let linear = basic::linear_class::<B>();
        reg.register("linear", linear);
        reg.register("hidden", linear);
        reg.register("forward", linear);
        reg.register("softmax", basic::softmax_class::<B>());
        reg.register("copy", basic::copy_class::<B>());
        reg.register("combine", basic::combine_class::<B>());
        reg.register("constant", basic::constant_class::<B>());
        reg.register("compare", basic::compare_class::<B>());
        reg.register(crate::config::STEP_INDEX, basic::step_index_class::<B>());
        let rec = cell::rec_class::<B>();
        reg.register("rec", rec);
        reg.register("rnn_cell", rec);
        reg.register("choice", choice::choice_class::<B>());
        reg.register_unit("rnn", CellUnit::Rnn);
        reg.register_unit("lstm", CellUnit::Lstm);
        reg
    }

    pub fn register(&mut self, name: &str, class: LayerClass<B>) {
        self.classes.insert(name.to_string(), class);
    }

    pub fn register_unit(&mut self, name: &str, unit: CellUnit) {
        self.units.insert(name.to_string(), unit);
    }

    pub fn class(&self, name: &str) -> Option<&LayerClass<B>> {
        self.classes.get(name)
    }

    pub fn unit(&self, name: &str) -> Option<CellUnit> {
        self.units.get(name).copied()
    }

    /// Resolve the `unit` option of a layer, if it has one.
    pub fn unit_of(&self, spec: &LayerSpec) -> Result<Option<CellUnit>, BuildError> {
        match spec.opt_str("unit")? {
            None => Ok(None),
            Some(name) => self.unit(name).map(Some).ok_or_else(|| BuildError::UnknownUnit {
                layer: spec.name.clone(),
                unit: name.to_string(),
            }),
        }
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

impl<B: Backend> Default for LayerRegistry<B> {
    fn default() -> Self {
        Self::with_builtins()
    }
}
