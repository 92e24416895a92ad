//! Loop Trace Intermediate Representation.
//!
//! Traces are straight-line SSA operation lists closed into a loop by a
//! `label` and a `jump`. Guards leave the trace when their condition fails.
//!
//! # Core Components
//!
//! - **Types** (`types.rs`): element types and array descriptors
//! - **Operators** (`operators.rs`): scalar, guard and vector opcodes
//! - **Arena** (`arena.rs`): typed ids and arena storage
//! - **Trace** (`trace.rs`): values, operations, guards and loops
//! - **Builder** (`builder.rs`): programmatic trace construction
//! - **Renamer** (`renamer.rs`): value substitution
//! - **Eval** (`eval.rs`): reference interpreter

pub mod arena;
pub mod builder;
pub mod eval;
pub mod operators;
pub mod renamer;
pub mod trace;
pub mod types;

// Re-export commonly used types
pub use arena::{Arena, BitSet, Id};
pub use builder::TraceBuilder;
pub use eval::{run_loop, run_vectorized, EvalError, EvalResult, Exit, Memory, Value};
pub use operators::{AccumOp, OpCategory, OpCode};
pub use renamer::Renamer;
pub use trace::{
    Arg, DescrKind, GuardDescr, GuardInfo, Loop, Operation, ShapeError, Snapshot, ValueGen,
    ValueId, Vectorizability,
};
pub use types::{ArrayDescr, Datatype, ElemType, WORD_SIZE};
