//! Runtime: per-step values, accumulators, beam search and the step loop.

pub mod accum;
pub mod driver;
pub mod search;
pub mod value;

pub use accum::Accumulator;
pub use search::{SearchRecord, SearchStep};
pub use value::{BeamRef, Stacked, StepValue, Value};
