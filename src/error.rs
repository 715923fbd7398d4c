//! Error types for template construction and step-loop execution.
//!
//! Construction errors split into two families: transient construction-order
//! failures, which the template builder retries, and everything else, which
//! aborts construction immediately.

use thiserror::Error;

/// Errors raised while building the subnetwork template.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("layer '{layer}' is not defined in the subnetwork")]
    UnknownLayer { layer: String },

    #[error("layer '{layer}': unknown class '{class}'")]
    UnknownClass { layer: String, class: String },

    #[error("layer '{layer}': unknown recurrent unit '{unit}'")]
    UnknownUnit { layer: String, unit: String },

    #[error("layer '{layer}': invalid reference '{reference}': {reason}")]
    InvalidReference {
        layer: String,
        reference: String,
        reason: String,
    },

    #[error("layer '{layer}': invalid option '{key}': {reason}")]
    InvalidOption {
        layer: String,
        key: String,
        reason: String,
    },

    #[error("the subnetwork has no 'output' layer")]
    MissingOutput,

    #[error("construction loop at layer '{layer}' (constructing: {})", stack.join(" -> "))]
    ConstructionLoop { layer: String, stack: Vec<String> },

    #[error("layer '{layer}': descriptor of input '{input}' is not known yet")]
    MissingDescriptor { layer: String, input: String },

    #[error("cyclic current-step dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error(
        "sequence length is unknown: set a fixed length, provide a target or source sequence, \
         or define an 'end' layer"
    )]
    NoLengthSource,

    #[error("layer '{layer}': beam of choice '{choice}' has size {found}, expected {expected}")]
    InconsistentBeam {
        layer: String,
        choice: String,
        expected: usize,
        found: usize,
    },

    #[error("layer '{layer}': inputs come from unrelated search choices '{first}' and '{second}'")]
    IncompatibleSearch {
        layer: String,
        first: String,
        second: String,
    },

    #[error("node '{layer}' is already initialized")]
    AlreadyInitialized { layer: String },

    #[error("node '{layer}' has no output descriptor yet")]
    NotInitialized { layer: String },

    #[error(
        "template construction did not converge; unfinished layers: {}",
        unfinished.join(", ")
    )]
    TemplateIncomplete {
        unfinished: Vec<String>,
        stack: Vec<String>,
        errors: Vec<String>,
    },

    #[error("{class}.describe({options}) for layer '{layer}' failed: {reason}")]
    Describe {
        layer: String,
        class: String,
        options: String,
        reason: String,
    },

    #[error("layer '{layer}': extern data '{key}' is not declared")]
    UnknownData { layer: String, key: String },

    #[error("layer '{layer}': outer layer '{name}' is not declared")]
    UnknownBase { layer: String, name: String },
}

impl BuildError {
    /// Transient construction-order failures that a later pass may fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BuildError::ConstructionLoop { .. } | BuildError::MissingDescriptor { .. }
        )
    }

    /// The layer an error is attributed to, if any.
    pub fn layer(&self) -> Option<&str> {
        match self {
            BuildError::UnknownLayer { layer }
            | BuildError::UnknownClass { layer, .. }
            | BuildError::UnknownUnit { layer, .. }
            | BuildError::InvalidReference { layer, .. }
            | BuildError::InvalidOption { layer, .. }
            | BuildError::ConstructionLoop { layer, .. }
            | BuildError::MissingDescriptor { layer, .. }
            | BuildError::InconsistentBeam { layer, .. }
            | BuildError::IncompatibleSearch { layer, .. }
            | BuildError::AlreadyInitialized { layer }
            | BuildError::NotInitialized { layer }
            | BuildError::Describe { layer, .. }
            | BuildError::UnknownData { layer, .. }
            | BuildError::UnknownBase { layer, .. } => Some(layer),
            BuildError::CyclicDependency { cycle } => cycle.first().map(String::as_str),
            BuildError::MissingOutput
            | BuildError::NoLengthSource
            | BuildError::TemplateIncomplete { .. } => None,
        }
    }

    /// Short stable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::UnknownLayer { .. } => "unknown-layer",
            BuildError::UnknownClass { .. } => "unknown-class",
            BuildError::UnknownUnit { .. } => "unknown-unit",
            BuildError::InvalidReference { .. } => "invalid-reference",
            BuildError::InvalidOption { .. } => "invalid-option",
            BuildError::MissingOutput => "missing-output",
            BuildError::ConstructionLoop { .. } => "construction-loop",
            BuildError::MissingDescriptor { .. } => "missing-descriptor",
            BuildError::CyclicDependency { .. } => "cyclic-dependency",
            BuildError::NoLengthSource => "no-length-source",
            BuildError::InconsistentBeam { .. } => "inconsistent-beam",
            BuildError::IncompatibleSearch { .. } => "incompatible-search",
            BuildError::AlreadyInitialized { .. } => "already-initialized",
            BuildError::NotInitialized { .. } => "not-initialized",
            BuildError::TemplateIncomplete { .. } => "template-incomplete",
            BuildError::Describe { .. } => "describe",
            BuildError::UnknownData { .. } => "unknown-data",
            BuildError::UnknownBase { .. } => "unknown-base",
        }
    }

    /// Where the error came from, used to deduplicate collected errors.
    pub fn site(&self) -> (String, &'static str) {
        (self.layer().unwrap_or("").to_string(), self.kind())
    }
}

/// Errors raised while running the step loop or resolving its results.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("step {step}, layer '{layer}': {source}")]
    Layer {
        step: usize,
        layer: String,
        source: Box<ExecError>,
    },

    #[error("layer '{layer}': {reason}")]
    ShapeMismatch { layer: String, reason: String },

    #[error("layer '{layer}': auxiliary state shape {found:?} does not match {expected:?}")]
    AuxStateMismatch {
        layer: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("layer '{layer}': runtime beam of size {found} but the template expects {expected:?}")]
    SearchInconsistency {
        layer: String,
        expected: Option<usize>,
        found: usize,
    },

    #[error("sequence lengths of '{first}' and '{second}' disagree")]
    LengthMismatch { first: String, second: String },

    #[error("extern data '{key}' was not supplied")]
    MissingData { key: String },

    #[error("outer layer '{name}' was not supplied")]
    MissingBase { name: String },

    #[error("layer '{layer}' needs target '{target}' but it was not supplied")]
    MissingTarget { layer: String, target: String },

    #[error("layer '{layer}' does not expose a last hidden state")]
    LastHiddenStateUnavailable { layer: String },

    #[error("accumulator '{layer}': write to slot {got} but the next slot is {expected}")]
    AccumulatorOrder {
        layer: String,
        expected: usize,
        got: usize,
    },

    #[error("accumulator '{layer}': step {step} has {found} rows, expected {expected}")]
    StackRagged {
        layer: String,
        step: usize,
        expected: usize,
        found: usize,
    },

    #[error("layer '{layer}': beam at step {step} is not an ancestor of the final hypotheses")]
    NotAncestor { layer: String, step: usize },

    #[error("layer '{layer}': {reason}")]
    Unsupported { layer: String, reason: String },

    #[error("tensor data: {0}")]
    Data(String),
}

impl ExecError {
    /// Attach the step and layer a failure happened in.
    pub fn at(self, step: usize, layer: &str) -> ExecError {
        match self {
            ExecError::Layer { .. } => self,
            other => ExecError::Layer {
                step,
                layer: layer.to_string(),
                source: Box::new(other),
            },
        }
    }
}
