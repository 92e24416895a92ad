//! Vectorization Orchestrator
//!
//! Drives one attempt through its stages:
//!
//! ```text
//! Scan -> HoistGuards -> Unroll -> BuildDepGraph -> SeedPacks -> Extend
//!      -> Combine -> Split -> Schedule -> CostGate -> Accept
//! ```
//!
//! Any stage may reject the loop. The input is only read, so on rejection
//! the caller still holds the scalar loop it passed in.

use super::dependency::DependencyGraph;
use super::error::{NotVectorizableReason, VectorizeError, VectorizeResult};
use super::guard::{GuardDescrFactory, GuardHoister};
use super::observer::{Stage, VectorizeEvent, VectorizeObserver};
use super::pack::PackSet;
use super::schedule::Scheduler;
use super::unroll::{smallest_type_bytes, unroll_count, LoopUnroller};
use super::{TargetMachine, VectorizeConfig, VectorizeInfo, VectorizedLoop};
use crate::ir::operators::OpCode;
use crate::ir::trace::{Loop, ValueGen, Vectorizability};

/// Vectorize `lp` for `target`.
///
/// Returns the vector loop with its scalar version, or why there is none.
pub fn optimize_vector(
    lp: &Loop,
    target: &TargetMachine,
    config: &VectorizeConfig,
    observer: &dyn VectorizeObserver,
) -> VectorizeResult<VectorizedLoop> {
    VectorizationOrchestrator::new(target, config, observer).run(lp)
}

// =============================================================================
// Vectorization Orchestrator
// =============================================================================

/// Runs the stages of one vectorization attempt.
pub struct VectorizationOrchestrator<'a> {
    target: &'a TargetMachine,
    config: &'a VectorizeConfig,
    observer: &'a dyn VectorizeObserver,
}

impl<'a> VectorizationOrchestrator<'a> {
    /// Create an orchestrator.
    pub fn new(
        target: &'a TargetMachine,
        config: &'a VectorizeConfig,
        observer: &'a dyn VectorizeObserver,
    ) -> Self {
        Self {
            target,
            config,
            observer,
        }
    }

    /// Run an attempt and report its outcome.
    pub fn run(&self, lp: &Loop) -> VectorizeResult<VectorizedLoop> {
        self.observer.on_event(&VectorizeEvent::AttemptStarted {
            ops: lp.op_count(),
        });
        let result = self.attempt(lp);
        let event = match &result {
            Ok(vl) => VectorizeEvent::Accepted {
                unroll_factor: vl.info.unroll_factor,
                ops_before: vl.info.ops_before,
                ops_after: vl.info.ops_after,
                savings: vl.info.savings,
            },
            Err(err) => VectorizeEvent::Rejected(err.clone()),
        };
        self.observer.on_event(&event);
        result
    }

    fn enter(&self, stage: Stage) {
        self.observer.on_event(&VectorizeEvent::StageEntered(stage));
    }

    fn attempt(&self, lp: &Loop) -> VectorizeResult<VectorizedLoop> {
        self.enter(Stage::Scan);
        lp.check_shape()?;
        self.bail_fast_path(lp)?;

        let mut values = ValueGen::after(lp);
        let mut descrs = GuardDescrFactory::for_loop(lp);

        let source = if self.config.hoist_guards {
            self.enter(Stage::HoistGuards);
            let (hoisted, count) = GuardHoister::new(&mut descrs).hoist(lp)?;
            self.observer
                .on_event(&VectorizeEvent::GuardsHoisted { count });
            hoisted
        } else {
            lp.clone()
        };

        self.enter(Stage::Unroll);
        let count = unroll_count(&source, self.target.vector_register_bytes)?;
        let unrolled = LoopUnroller::new(&mut values, &mut descrs).unroll(&source, count)?;

        self.enter(Stage::BuildDepGraph);
        let mut graph = DependencyGraph::build(&unrolled);
        if !self.target.disabled_opcodes.is_empty() {
            let body: Vec<_> = graph.body().collect();
            for node in body {
                let op = &mut graph.node_mut(node).op;
                if self.target.disabled_opcodes.contains(&op.opcode) {
                    op.vector = Vectorizability::Ineligible;
                }
            }
        }

        self.enter(Stage::SeedPacks);
        let mut packset =
            PackSet::new(self.target.vector_register_bytes, unrolled.value_types());
        packset.find_adjacent_memory_refs(&graph)?;

        self.enter(Stage::Extend);
        packset.extend_packset(&graph)?;

        self.enter(Stage::Combine);
        packset.combine_packset()?;

        self.enter(Stage::Split);
        packset.split_overloaded_packs(&mut graph)?;
        if packset.pack_count() == 0 {
            return Err(NotVectorizableReason::NoPacks.into());
        }
        let accumulating = packset
            .packs()
            .iter()
            .filter(|p| p.is_accumulating())
            .count();
        self.observer.on_event(&VectorizeEvent::PacksFormed {
            packs: packset.pack_count(),
            accumulating,
        });

        self.enter(Stage::Schedule);
        let mut cost = self.target.cost_model(self.config.cost_threshold);
        let scheduled = Scheduler::new(&graph, &packset, &mut values, cost.as_mut()).run()?;

        self.enter(Stage::CostGate);
        let savings = cost.savings();
        if !cost.profitable() {
            return Err(VectorizeError::NotProfitable { savings });
        }

        let info = VectorizeInfo {
            unroll_factor: count + 1,
            ops_before: lp.op_count(),
            ops_after: scheduled.body.op_count(),
            packs: packset.pack_count(),
            savings,
        };
        Ok(VectorizedLoop {
            prefix: scheduled.prefix,
            entry_args: scheduled.entry_args,
            body: scheduled.body,
            version: lp.clone(),
            accumulators: scheduled.accumulators,
            info,
        })
    }

    /// Cheap checks run before any copy of the loop is made.
    fn bail_fast_path(&self, lp: &Loop) -> VectorizeResult<()> {
        let len = lp.body.len();
        if self.config.forbid_calls && lp.body.iter().any(|op| op.opcode == OpCode::Call) {
            return Err(NotVectorizableReason::CallInLoop.into());
        }
        if len > self.config.max_trace_length {
            return Err(NotVectorizableReason::TraceTooLong {
                len,
                max: self.config.max_trace_length,
            }
            .into());
        }
        if self.target.vector_register_bytes == 0 {
            return Err(NotVectorizableReason::NoVectorRegisters.into());
        }
        if len == 0 || smallest_type_bytes(lp) == 0 {
            return Err(NotVectorizableReason::NoArrayAccess.into());
        }

        let eligible = lp
            .body
            .iter()
            .filter(|op| {
                op.vector != Vectorizability::Ineligible
                    && !self.target.disabled_opcodes.contains(&op.opcode)
            })
            .count();
        if (eligible as f64) < self.config.min_vector_ratio * len as f64 {
            return Err(NotVectorizableReason::LowVectorRatio.into());
        }
        let guards = lp.body.iter().filter(|op| op.is_guard()).count();
        if guards as f64 > self.config.max_guard_ratio * len as f64 {
            return Err(NotVectorizableReason::TooManyGuards.into());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
