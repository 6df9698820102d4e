//! Knowledge graph construction from extraction candidates.

mod builder;

pub use builder::{BuildOutcome, GraphBuilder};
