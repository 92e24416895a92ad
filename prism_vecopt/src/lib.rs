//! SIMD auto-vectorizer for Prism trace loops.
//!
//! Takes a hot loop trace in SSA form and, when it pays off, produces an
//! equivalent loop that processes several iterations per trip with vector
//! operations:
//! - Loop trace IR with a reference evaluator
//! - Guard hoisting and unrolling with renaming
//! - Dependency graph and pack formation
//! - Vector scheduling with a target cost model
pub mod ir;
pub mod opt;

pub use opt::vectorize::{
    optimize_vector, TargetMachine, VectorizeConfig, VectorizeError, VectorizeOutcome,
    VectorizedLoop,
};
