//! Template construction and loop hoisting.
//!
//! Nothing in this module evaluates a layer: it only derives output
//! descriptors, discovers the dependency graph and decides where each layer
//! runs relative to the step loop.

pub mod descriptor;
pub mod hoist;
pub mod node;
pub mod template;

pub use descriptor::{DType, Dim, OutputDesc, SearchBeam};
pub use hoist::{Partition, Placement};
pub use node::{NodeArena, NodeId};
pub use template::{LayerInfo, LengthMode, Template, TemplateBuilder, TemplateEnv, TemplateReport};
