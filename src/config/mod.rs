//! Declarative subnetwork definitions.
//!
//! A subnetwork is a JSON object mapping layer names to layer objects:
//!
//! ```json
//! {
//!   "lin":    {"class": "linear", "from": ["prev:output", "data:source"], "n_out": 8},
//!   "output": {"class": "copy", "from": "lin"}
//! }
//! ```
//!
//! Layer order is declaration order. Input references are plain names
//! (current step), `prev:<name>` (previous step), `base:<name>` (outer
//! scope), `data:<key>` (extern data, one frame per step) or `:i`
//! (the step counter).

pub mod options;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::BuildError;

pub use options::{InitialOutput, RecOptions};

/// Name of the layer every subnetwork must define.
pub const OUTPUT_LAYER: &str = "output";
/// Name of the dynamic-termination layer.
pub const END_LAYER: &str = "end";
/// Name of the implicit step counter.
pub const STEP_INDEX: &str = ":i";
/// Default extern data key read by `data` references.
pub const SOURCE_KEY: &str = "source";

/// One input reference of a layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceRef {
    Current(String),
    Prev(String),
    Base(String),
    Data(String),
    StepIndex,
}

impl SourceRef {
    pub fn parse(layer: &str, reference: &str) -> Result<SourceRef, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidReference {
            layer: layer.to_string(),
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        if reference == STEP_INDEX {
            return Ok(SourceRef::StepIndex);
        }
        if reference == "data" {
            return Ok(SourceRef::Data(SOURCE_KEY.to_string()));
        }
        let (prefix, rest) = match reference.split_once(':') {
            Some((p, r)) => (Some(p), r),
            None => (None, reference),
        };
        if rest.is_empty() {
            return Err(invalid("empty layer name"));
        }
        match prefix {
            None => Ok(SourceRef::Current(rest.to_string())),
            Some("prev") => {
                if rest.contains(':') {
                    return Err(invalid("'prev:' can only refer to a layer of this subnetwork"));
                }
                Ok(SourceRef::Prev(rest.to_string()))
            }
            Some("base") => Ok(SourceRef::Base(rest.to_string())),
            Some("data") => Ok(SourceRef::Data(rest.to_string())),
            Some(other) => Err(invalid(&format!("unknown prefix '{}:'", other))),
        }
    }

    /// The subnetwork layer this reference points at, if any.
    pub fn layer_name(&self) -> Option<&str> {
        match self {
            SourceRef::Current(n) | SourceRef::Prev(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Current(n) => write!(f, "{}", n),
            SourceRef::Prev(n) => write!(f, "prev:{}", n),
            SourceRef::Base(n) => write!(f, "base:{}", n),
            SourceRef::Data(k) => write!(f, "data:{}", k),
            SourceRef::StepIndex => write!(f, "{}", STEP_INDEX),
        }
    }
}

/// One declared layer: its class, inputs and remaining options.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub class: String,
    /// `None` when the definition has no `from` key.
    pub from: Option<Vec<SourceRef>>,
    pub is_output_layer: bool,
    pub loss: Option<String>,
    pub target: Option<String>,
    pub initial_output: InitialOutput,
    /// Every other key, kept for the layer class to interpret.
    pub options: Map<String, Value>,
}

impl LayerSpec {
    pub fn from_value(name: &str, value: &Value) -> Result<LayerSpec, BuildError> {
        let obj = value.as_object().ok_or_else(|| BuildError::InvalidOption {
            layer: name.to_string(),
            key: "".to_string(),
            reason: "layer definition must be an object".to_string(),
        })?;
        let mut options = obj.clone();
        let class = match options.remove("class") {
            Some(Value::String(c)) => c,
            Some(_) => return Err(option_error(name, "class", "must be a string")),
            None => return Err(option_error(name, "class", "missing")),
        };
        let from = match options.remove("from") {
            None => None,
            Some(Value::String(s)) => Some(vec![SourceRef::parse(name, &s)?]),
            Some(Value::Array(items)) => {
                let mut refs = Vec::with_capacity(items.len());
                for item in &items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| option_error(name, "from", "entries must be strings"))?;
                    refs.push(SourceRef::parse(name, s)?);
                }
                Some(refs)
            }
            Some(_) => return Err(option_error(name, "from", "must be a string or a list")),
        };
        let is_output_layer = match options.remove("is_output_layer") {
            None => false,
            Some(Value::Bool(b)) => b,
            Some(_) => return Err(option_error(name, "is_output_layer", "must be a bool")),
        };
        let loss = take_string(name, &mut options, "loss")?;
        let target = take_string(name, &mut options, "target")?;
        let initial_output = match options.remove("initial_output") {
            None => InitialOutput::Zeros,
            Some(v) => InitialOutput::from_value(name, &v)?,
        };
        Ok(LayerSpec {
            name: name.to_string(),
            class,
            from,
            is_output_layer,
            loss,
            target,
            initial_output,
            options,
        })
    }

    pub fn opt_usize(&self, key: &str) -> Result<Option<usize>, BuildError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| option_error(&self.name, key, "must be a non-negative integer")),
        }
    }

    pub fn opt_f32(&self, key: &str) -> Result<Option<f32>, BuildError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(if *b { 1.0 } else { 0.0 })),
            Some(v) => v
                .as_f64()
                .map(|n| Some(n as f32))
                .ok_or_else(|| option_error(&self.name, key, "must be a number")),
        }
    }

    pub fn opt_bool(&self, key: &str) -> Result<Option<bool>, BuildError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(option_error(&self.name, key, "must be a bool")),
        }
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, BuildError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(option_error(&self.name, key, "must be a string")),
        }
    }

    pub fn opt_usize_list(&self, key: &str) -> Result<Option<Vec<usize>>, BuildError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_u64().map(|n| n as usize).ok_or_else(|| {
                        option_error(&self.name, key, "entries must be non-negative integers")
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(option_error(&self.name, key, "must be a list")),
        }
    }

    /// Compact textual form of the class options, used in diagnostics.
    pub fn describe_options(&self) -> String {
        let mut parts = vec![format!(
            "from=[{}]",
            self.from
                .as_ref()
                .map(|refs| refs
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", "))
                .unwrap_or_default()
        )];
        for (key, value) in &self.options {
            parts.push(format!("{}={}", key, value));
        }
        parts.join(", ")
    }
}

fn option_error(layer: &str, key: &str, reason: &str) -> BuildError {
    BuildError::InvalidOption {
        layer: layer.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn take_string(
    layer: &str,
    options: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<String>, BuildError> {
    match options.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(option_error(layer, key, "must be a string")),
    }
}

/// An ordered subnetwork definition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetDict {
    layers: Vec<LayerSpec>,
    index: BTreeMap<String, usize>,
    /// Original JSON text, kept for diagnostics.
    source: Option<String>,
}

impl NetDict {
    pub fn from_json(text: &str) -> Result<NetDict, BuildError> {
        let value: Value = serde_json::from_str(text).map_err(|e| BuildError::InvalidOption {
            layer: "".to_string(),
            key: "".to_string(),
            reason: format!("cannot parse subnetwork definition: {}", e),
        })?;
        let mut net = NetDict::from_value(&value)?;
        net.source = Some(text.to_string());
        Ok(net)
    }

    pub fn from_value(value: &Value) -> Result<NetDict, BuildError> {
        let obj = value.as_object().ok_or_else(|| BuildError::InvalidOption {
            layer: "".to_string(),
            key: "".to_string(),
            reason: "subnetwork definition must be an object".to_string(),
        })?;
        let mut net = NetDict::default();
        for (name, layer) in obj {
            if name.starts_with("prev:") || name.starts_with("base:") || name.starts_with("data:")
            {
                return Err(option_error(name, "", "layer names cannot carry a reference prefix"));
            }
            net.insert(LayerSpec::from_value(name, layer)?);
        }
        Ok(net)
    }

    /// Load a definition from a JSON file.
    pub fn load(path: &Path) -> Result<NetDict, BuildError> {
        let text = std::fs::read_to_string(path).map_err(|e| BuildError::InvalidOption {
            layer: "".to_string(),
            key: "".to_string(),
            reason: format!("cannot read '{}': {}", path.display(), e),
        })?;
        NetDict::from_json(&text)
    }

    /// Add or replace a layer, keeping its original position when replacing.
    pub fn insert(&mut self, spec: LayerSpec) {
        match self.index.get(&spec.name) {
            Some(&i) => self.layers[i] = spec,
            None => {
                self.index.insert(spec.name.clone(), self.layers.len());
                self.layers.push(spec);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&LayerSpec> {
        self.index.get(name).map(|&i| &self.layers[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}
