use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;

/// Options of one recurrent subnetwork invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecOptions {
    /// Run exactly this many steps.
    pub fixed_length: Option<usize>,
    /// Hard cap on the number of steps when the length is dynamic.
    pub max_seq_len: Option<usize>,
    /// Count the frame whose `end` flag fires as part of the sequence.
    pub include_eos: bool,
    /// Let the loop-hoisting optimizer move layers out of the loop.
    pub optimize_move_layers_out: bool,
    /// Extern data key of the target sequence.
    pub target: Option<String>,
    /// Run beam search in choice layers instead of following the target.
    pub search: bool,
}

impl Default for RecOptions {
    fn default() -> Self {
        Self {
            fixed_length: None,
            max_seq_len: None,
            include_eos: false,
            optimize_move_layers_out: true,
            target: None,
            search: false,
        }
    }
}

/// Step cap used for dynamic lengths when `max_seq_len` is not set.
pub const DEFAULT_MAX_SEQ_LEN: usize = 100;

impl RecOptions {
    pub fn from_json(text: &str) -> Result<RecOptions, BuildError> {
        serde_json::from_str(text).map_err(|e| BuildError::InvalidOption {
            layer: "".to_string(),
            key: "".to_string(),
            reason: format!("cannot parse rec options: {}", e),
        })
    }

    pub fn step_cap(&self) -> usize {
        self.max_seq_len.unwrap_or(DEFAULT_MAX_SEQ_LEN)
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn with_fixed_length(mut self, n: usize) -> Self {
        self.fixed_length = Some(n);
        self
    }

    pub fn with_max_seq_len(mut self, n: usize) -> Self {
        self.max_seq_len = Some(n);
        self
    }

    pub fn with_include_eos(mut self, include: bool) -> Self {
        self.include_eos = include;
        self
    }

    pub fn with_target(mut self, key: &str) -> Self {
        self.target = Some(key.to_string());
        self
    }

    pub fn with_hoisting(mut self, enabled: bool) -> Self {
        self.optimize_move_layers_out = enabled;
        self
    }
}

/// Value a layer's `prev:` reference sees on step 0.
#[derive(Clone, Debug, PartialEq)]
pub enum InitialOutput {
    Zeros,
    Ones,
    Scalar(f32),
    Vector(Vec<f32>),
    /// Forwarded from an outer-scope layer.
    Base(String),
}

impl InitialOutput {
    pub fn from_value(layer: &str, value: &Value) -> Result<InitialOutput, BuildError> {
        let invalid = || BuildError::InvalidOption {
            layer: layer.to_string(),
            key: "initial_output".to_string(),
            reason: "expected \"zeros\", \"ones\", a number, a list of numbers or \"base:<name>\""
                .to_string(),
        };
        match value {
            Value::String(s) if s == "zeros" => Ok(InitialOutput::Zeros),
            Value::String(s) if s == "ones" => Ok(InitialOutput::Ones),
            Value::String(s) => s
                .strip_prefix("base:")
                .filter(|n| !n.is_empty())
                .map(|n| InitialOutput::Base(n.to_string()))
                .ok_or_else(invalid),
            Value::Number(n) => n
                .as_f64()
                .map(|v| InitialOutput::Scalar(v as f32))
                .ok_or_else(invalid),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_f64().map(|x| x as f32).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(InitialOutput::Vector),
            _ => Err(invalid()),
        }
    }
}
