//! Recurrent subnetwork engine.
//!
//! A subnetwork is declared as a set of named layers ([`NetDict`]). Building
//! it ([`RecLayer::build`]) derives every layer's output descriptor, resolves
//! dependencies on the previous step and partitions layers into pre-loop,
//! in-loop and post-loop sets. Running the resulting [`RecPlan`] drives the
//! step loop, records beam-search choices and resolves the surviving
//! hypotheses into time-major outputs.

pub mod config;
pub mod diagnostic;
pub mod error;
pub mod exec;
pub mod layers;
pub mod net;
pub mod rec;

pub use config::{InitialOutput, LayerSpec, NetDict, RecOptions, SourceRef};
pub use diagnostic::Diagnostic;
pub use error::{BuildError, ExecError};
pub use exec::{BeamRef, SearchRecord, Stacked, Value};
pub use layers::{LayerClass, LayerKind, LayerRegistry, LossKind, LossSummary, ParamStore};
pub use net::{
    LengthMode, OutputDesc, Partition, Placement, Template, TemplateBuilder, TemplateEnv,
};
pub use rec::{RecInputs, RecLayer, RecOutput, RecPlan};
