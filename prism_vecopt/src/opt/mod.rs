//! Optimization passes over loop traces.

pub mod vectorize;

pub use vectorize::{optimize_vector, Vectorize, VectorizeConfig, VectorizeOutcome};
