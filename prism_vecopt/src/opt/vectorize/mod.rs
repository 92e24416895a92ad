//! Vectorization Optimization Pass
//!
//! SIMD vectorization of loop traces. A loop is unrolled until one trip fills
//! a vector register, isomorphic operations of the copies are grouped into
//! packs, and the packs are emitted as vector operations:
//!
//! - **Guard hoisting**: loop-exit checks move to the loop header
//! - **Unrolling**: body replication with SSA renaming
//! - **Dependency graph**: data, memory, guard and ordering constraints
//! - **Pack formation**: seed, extend, combine, split
//! - **Scheduling**: vector emission with on-demand pack/unpack
//! - **Cost model**: target-aware profitability decision
//!
//! # Module Structure
//!
//! - `index`: linear index forms and memory references
//! - `dependency`: dependency graph over trace operations
//! - `guard`: guard descriptors and guard hoisting
//! - `unroll`: loop unrolling
//! - `pack`: pack set formation and accumulation detection
//! - `schedule`: list scheduler (scalar reorder and vector emission)
//! - `cost`: target cost models
//! - `orchestrator`: the stage pipeline
//! - `observer`: progress reporting
//!
//! # Example
//!
//! ```text
//! Before (4-byte ints, 16-byte registers):
//!   label(i, a, b, c)
//!     x = a[i]; y = b[i]; c[i] = x + y
//!   jump(i + 1, a, b, c)
//!
//! After (unroll factor 4):
//!   label(i, a, b, c)
//!     vx = a[i..i+4]; vy = b[i..i+4]; c[i..i+4] = vx + vy
//!   jump(i + 4, a, b, c)
//! ```

pub mod cost;
pub mod dependency;
pub mod error;
pub mod guard;
pub mod index;
pub mod observer;
pub mod orchestrator;
pub mod pack;
pub mod schedule;
pub mod unroll;

use crate::ir::operators::{AccumOp, OpCode};
use crate::ir::trace::{Arg, Loop, Operation, ValueId};
use crate::ir::types::Datatype;
use std::sync::atomic::{AtomicU64, Ordering};

pub use cost::{cost_model_for, Aarch64CostModel, CostModel, PackCost, SimdLevel, X86CostModel};
pub use dependency::{DependencyGraph, EdgeKind, NodeId};
pub use error::{NotVectorizableReason, VectorizeError, VectorizeResult};
pub use guard::{GuardDescrFactory, GuardHoister};
pub use index::{IndexAnalysis, IndexVar, MemoryRef};
pub use observer::{
    LogObserver, NoopObserver, RecordingObserver, Stage, VectorizeEvent, VectorizeObserver,
};
pub use orchestrator::{optimize_vector, VectorizationOrchestrator};
pub use pack::{Accum, Pack, PackSet};
pub use schedule::{linearize, ScheduledLoop, Scheduler};
pub use unroll::{unroll_count, LoopUnroller};

// =============================================================================
// Target
// =============================================================================

/// Vector capabilities of the compilation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMachine {
    /// SIMD level, which selects the cost model.
    pub level: SimdLevel,
    /// Width of one vector register in bytes; 0 disables vectorization.
    pub vector_register_bytes: usize,
    /// Scalar opcodes the backend cannot emit in vector form.
    pub disabled_opcodes: Vec<OpCode>,
}

impl TargetMachine {
    /// Target for a SIMD level with its full register width.
    pub fn new(level: SimdLevel) -> Self {
        Self {
            level,
            vector_register_bytes: level.max_vector_bytes(),
            disabled_opcodes: Vec::new(),
        }
    }

    /// SSE4.2 target (16-byte registers).
    pub fn sse42() -> Self {
        Self::new(SimdLevel::Sse42)
    }

    /// AVX2 target (32-byte registers).
    pub fn avx2() -> Self {
        Self::new(SimdLevel::Avx2)
    }

    /// AVX-512 target (64-byte registers).
    pub fn avx512() -> Self {
        Self::new(SimdLevel::Avx512)
    }

    /// ARMv8 NEON target (16-byte registers).
    pub fn neon() -> Self {
        Self::new(SimdLevel::Neon)
    }

    /// Fresh cost model for this target.
    pub fn cost_model(&self, threshold: i64) -> Box<dyn CostModel> {
        cost_model_for(self.level, threshold)
    }
}

impl Default for TargetMachine {
    fn default() -> Self {
        Self::sse42()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the vectorization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorizeConfig {
    /// Reject loops containing calls.
    pub forbid_calls: bool,
    /// Longest body considered.
    pub max_trace_length: usize,
    /// Minimum share of operations with a vector form.
    pub min_vector_ratio: f64,
    /// Maximum share of guards in the body.
    pub max_guard_ratio: f64,
    /// Savings required to keep the vector loop.
    pub cost_threshold: i64,
    /// Move header-only guards to the loop header before unrolling.
    pub hoist_guards: bool,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            forbid_calls: true,
            max_trace_length: 60,
            min_vector_ratio: 0.2,
            max_guard_ratio: 0.5,
            cost_threshold: 0,
            hoist_guards: true,
        }
    }
}

impl VectorizeConfig {
    /// Only vectorize short, clearly profitable loops.
    pub fn conservative() -> Self {
        Self {
            max_trace_length: 30,
            min_vector_ratio: 0.5,
            max_guard_ratio: 0.25,
            cost_threshold: 2,
            ..Default::default()
        }
    }

    /// Vectorize anything that does not lose.
    pub fn aggressive() -> Self {
        Self {
            forbid_calls: false,
            max_trace_length: 200,
            min_vector_ratio: 0.0,
            max_guard_ratio: 1.0,
            cost_threshold: 0,
            hoist_guards: true,
        }
    }
}

// =============================================================================
// Result
// =============================================================================

/// A reduction carried by the vector loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    /// Vector values holding partial results: the header value first.
    pub values: Vec<ValueId>,
    /// Operator folding the lanes.
    pub operator: AccumOp,
    /// Lane register class.
    pub datatype: Datatype,
}

/// Summary of an accepted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorizeInfo {
    /// Original iterations per vector iteration.
    pub unroll_factor: usize,
    /// Body operations of the scalar loop.
    pub ops_before: usize,
    /// Body operations of the vector loop.
    pub ops_after: usize,
    /// Packs emitted.
    pub packs: usize,
    /// Final cost model balance.
    pub savings: i64,
}

/// A vectorized loop with everything needed to run it.
#[derive(Debug, Clone)]
pub struct VectorizedLoop {
    /// Operations run once before the vector loop, reading `version`'s
    /// header values.
    pub prefix: Vec<Operation>,
    /// Header values of `body` on entry.
    pub entry_args: Vec<Arg>,
    /// The vector loop.
    pub body: Loop,
    /// Unmodified scalar loop; guards resuming at the loop header continue here.
    pub version: Loop,
    /// Reductions to fold when leaving `body`.
    pub accumulators: Vec<Accumulator>,
    /// Attempt summary.
    pub info: VectorizeInfo,
}

/// Result of running the pass on one loop.
#[derive(Debug, Clone)]
pub enum VectorizeOutcome {
    /// The loop was vectorized.
    Vectorized(Box<VectorizedLoop>),
    /// The scalar loop stays; the error says why.
    Scalar(VectorizeError),
}

impl VectorizeOutcome {
    /// Check if the loop was vectorized.
    pub fn is_vectorized(&self) -> bool {
        matches!(self, VectorizeOutcome::Vectorized(_))
    }

    /// The vectorized loop, if any.
    pub fn vectorized(&self) -> Option<&VectorizedLoop> {
        match self {
            VectorizeOutcome::Vectorized(vl) => Some(vl),
            VectorizeOutcome::Scalar(_) => None,
        }
    }

    /// The rejection, if any.
    pub fn error(&self) -> Option<&VectorizeError> {
        match self {
            VectorizeOutcome::Vectorized(_) => None,
            VectorizeOutcome::Scalar(err) => Some(err),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from vectorization attempts.
///
/// Counters are atomic so one pass object can serve several compiler threads.
#[derive(Debug, Default)]
pub struct VectorizeStats {
    attempts: AtomicU64,
    vectorized: AtomicU64,
    rejected_not_vectorizable: AtomicU64,
    rejected_not_profitable: AtomicU64,
    internal_errors: AtomicU64,
    ops_before: AtomicU64,
    ops_after: AtomicU64,
}

impl VectorizeStats {
    /// Record the outcome of one attempt.
    pub fn record(&self, result: &VectorizeResult<VectorizedLoop>) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(vl) => {
                self.ops_before
                    .fetch_add(vl.info.ops_before as u64, Ordering::Relaxed);
                self.ops_after
                    .fetch_add(vl.info.ops_after as u64, Ordering::Relaxed);
                &self.vectorized
            }
            Err(VectorizeError::NotVectorizable(_)) => &self.rejected_not_vectorizable,
            Err(VectorizeError::NotProfitable { .. }) => &self.rejected_not_profitable,
            Err(VectorizeError::Internal(_)) => &self.internal_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Loops attempted.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Loops vectorized.
    pub fn vectorized(&self) -> u64 {
        self.vectorized.load(Ordering::Relaxed)
    }

    /// Loops rejected as not vectorizable.
    pub fn rejected_not_vectorizable(&self) -> u64 {
        self.rejected_not_vectorizable.load(Ordering::Relaxed)
    }

    /// Loops rejected as unprofitable.
    pub fn rejected_not_profitable(&self) -> u64 {
        self.rejected_not_profitable.load(Ordering::Relaxed)
    }

    /// Attempts that hit an internal error.
    pub fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    /// Scalar body operations of vectorized loops.
    pub fn ops_before(&self) -> u64 {
        self.ops_before.load(Ordering::Relaxed)
    }

    /// Vector body operations of vectorized loops.
    pub fn ops_after(&self) -> u64 {
        self.ops_after.load(Ordering::Relaxed)
    }

    /// Get the vectorization success rate.
    pub fn success_rate(&self) -> f32 {
        let attempts = self.attempts();
        if attempts == 0 {
            0.0
        } else {
            self.vectorized() as f32 / attempts as f32
        }
    }
}

// =============================================================================
// Main Pass
// =============================================================================

/// Vectorization optimization pass.
///
/// Wraps [`optimize_vector`] with a fixed target, configuration and observer,
/// and keeps statistics over all loops it has seen.
pub struct Vectorize {
    target: TargetMachine,
    config: VectorizeConfig,
    observer: Box<dyn VectorizeObserver>,
    stats: VectorizeStats,
}

impl Vectorize {
    /// Create vectorization pass with default configuration.
    pub fn new(target: TargetMachine) -> Self {
        Self::with_config(target, VectorizeConfig::default())
    }

    /// Create vectorization pass with custom configuration.
    pub fn with_config(target: TargetMachine, config: VectorizeConfig) -> Self {
        Self {
            target,
            config,
            observer: Box::new(NoopObserver),
            stats: VectorizeStats::default(),
        }
    }

    /// Report attempts to `observer`.
    pub fn with_observer(mut self, observer: Box<dyn VectorizeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Pass name.
    pub fn name(&self) -> &'static str {
        "vectorize"
    }

    /// Get the target.
    pub fn target(&self) -> &TargetMachine {
        &self.target
    }

    /// Get the configuration.
    pub fn config(&self) -> &VectorizeConfig {
        &self.config
    }

    /// Get accumulated statistics.
    pub fn stats(&self) -> &VectorizeStats {
        &self.stats
    }

    /// Try to vectorize one loop.
    pub fn run(&self, lp: &Loop) -> VectorizeOutcome {
        let result = optimize_vector(lp, &self.target, &self.config, self.observer.as_ref());
        self.stats.record(&result);
        match result {
            Ok(vl) => VectorizeOutcome::Vectorized(Box::new(vl)),
            Err(err) => VectorizeOutcome::Scalar(err),
        }
    }
}

impl Default for Vectorize {
    fn default() -> Self {
        Self::new(TargetMachine::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
