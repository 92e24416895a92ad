//! Guard descriptors and guard hoisting.
//!
//! A guard whose condition only depends on loop-header values can be checked
//! before any side effect of the iteration. Failing it then means the
//! iteration has not started yet, so execution can resume at the loop header
//! instead of at the guard. After unrolling, all copies of such a guard
//! stay at the top of the body, which keeps them out of the way of packing.
//!
//! ```text
//! label(i, a)                       label(i, a)
//!   x = a[i]                          i1 = i + 1
//!   a[i] = x                          lt = i1 < n
//!   i1 = i + 1          ==>           guard_true(lt) [i, a]   <- header resume
//!   lt = i1 < n                       x = a[i]
//!   guard_true(lt) [i1, a]            a[i] = x
//! jump(i1, a)                       jump(i1, a)
//! ```

use super::dependency::{DependencyGraph, EdgeKind, NodeId};
use super::error::VectorizeResult;
use super::schedule::linearize;
use crate::ir::operators::OpCode;
use crate::ir::trace::{Arg, DescrKind, GuardDescr, Loop, Snapshot};

/// Priority of operations needed by a hoisted guard.
pub const HOISTED_PRIORITY: i32 = 10;

// =============================================================================
// Descriptor Factory
// =============================================================================

/// Hands out guard descriptors with unique ids.
#[derive(Debug, Clone, Default)]
pub struct GuardDescrFactory {
    next_id: u32,
}

impl GuardDescrFactory {
    /// Factory starting at `next_id`.
    pub fn new(next_id: u32) -> Self {
        GuardDescrFactory { next_id }
    }

    /// Factory whose ids do not collide with any guard of `lp`.
    pub fn for_loop(lp: &Loop) -> Self {
        let next_id = lp
            .body
            .iter()
            .filter_map(|op| op.guard.as_ref().map(|g| g.descr.id + 1))
            .max()
            .unwrap_or(0);
        GuardDescrFactory { next_id }
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Copy of `from` under a new id.
    pub fn clone_descr(&mut self, from: &GuardDescr) -> GuardDescr {
        GuardDescr {
            id: self.fresh_id(),
            ..*from
        }
    }

    /// Descriptor resuming at the loop header.
    pub fn resume_at_loop_header(&mut self, from: &GuardDescr) -> GuardDescr {
        GuardDescr {
            id: self.fresh_id(),
            kind: DescrKind::ResumeAtLoopHeader,
            resume_pc: from.resume_pc,
        }
    }

    /// Descriptor resuming at the loop header of a compiled scalar version.
    pub fn compile_loop_version(&mut self, from: &GuardDescr) -> GuardDescr {
        GuardDescr {
            id: self.fresh_id(),
            kind: DescrKind::CompileLoopVersion,
            resume_pc: from.resume_pc,
        }
    }
}

// =============================================================================
// Guard Hoister
// =============================================================================

/// Moves guards that only read header values to the top of the loop.
pub struct GuardHoister<'a> {
    descrs: &'a mut GuardDescrFactory,
}

impl<'a> GuardHoister<'a> {
    /// Create a hoister drawing descriptors from `descrs`.
    pub fn new(descrs: &'a mut GuardDescrFactory) -> Self {
        GuardHoister { descrs }
    }

    /// Hoist what can be hoisted and return the reordered loop together with
    /// the number of guards moved.
    pub fn hoist(&mut self, lp: &Loop) -> VectorizeResult<(Loop, usize)> {
        let mut graph = DependencyGraph::build(lp);
        let anchor = anchor_of(&graph);
        let resume_args: Vec<Arg> = lp.header.args.to_vec();

        let mut hoisted: Vec<NodeId> = Vec::new();
        for guard in graph.guards().to_vec() {
            if guard == anchor || graph.op(guard).resumes_at_loop_header() {
                continue;
            }
            let Some(path) = hoistable_path(&graph, guard, anchor) else {
                continue;
            };
            for node in path {
                graph.node_mut(node).priority = HOISTED_PRIORITY;
            }
            for source in graph.sources(guard, EdgeKind::FailArg) {
                graph.remove_edge(source, guard, EdgeKind::FailArg);
            }
            graph.add_edge(anchor, guard, EdgeKind::Pullup, None);

            let node = graph.node_mut(guard);
            node.priority = HOISTED_PRIORITY;
            let opcode = node.op.opcode;
            if let Some(info) = node.op.guard.as_deref_mut() {
                info.descr = match opcode {
                    OpCode::GuardTrue | OpCode::GuardFalse => {
                        self.descrs.compile_loop_version(&info.descr)
                    }
                    _ => self.descrs.resume_at_loop_header(&info.descr),
                };
                info.fail_args = resume_args.clone();
                info.snapshot = Snapshot {
                    frames: vec![resume_args.clone()],
                };
            }
            hoisted.push(guard);
        }

        if hoisted.is_empty() {
            return Ok((lp.clone(), 0));
        }

        // hoisted guards run before every effect and every remaining guard
        let targets: Vec<NodeId> = graph
            .body()
            .filter(|&n| {
                let op = graph.op(n);
                op.opcode.has_side_effect() || (op.is_guard() && !op.resumes_at_loop_header())
            })
            .collect();
        for &guard in &hoisted {
            for &target in &targets {
                if target != anchor {
                    graph.add_edge(guard, target, EdgeKind::Control, None);
                }
            }
        }

        if anchor != graph.label() {
            graph.node_mut(anchor).priority = HOISTED_PRIORITY + 1;
        }
        let count = hoisted.len();
        Ok((linearize(&graph)?, count))
    }
}

/// The early-exit guard opening the body, or the label.
fn anchor_of(graph: &DependencyGraph) -> NodeId {
    graph
        .body()
        .next()
        .filter(|&n| graph.op(n).opcode == OpCode::GuardEarlyExit)
        .unwrap_or_else(|| graph.label())
}

/// Pure nodes the guard needs, if everything it depends on (fail arguments
/// aside) reaches back to the anchor through pure operations only.
fn hoistable_path(graph: &DependencyGraph, guard: NodeId, anchor: NodeId) -> Option<Vec<NodeId>> {
    let mut path = Vec::new();
    for edge in &graph.node(guard).depends {
        if edge.kind == EdgeKind::FailArg {
            continue;
        }
        let source = edge.to;
        if source == anchor || source == graph.label() {
            continue;
        }
        if graph.op(source).resumes_at_loop_header() {
            continue;
        }
        path.extend(graph.pure_path_to(source, anchor)?);
    }
    Some(path)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::TraceBuilder;
    use crate::ir::eval::{run_loop, Memory, Value};
    use crate::ir::types::ArrayDescr;

    /// label(i, a); x = a[i*8]; a[i*8] = x + 1; i1 = i + 1; lt = i1 < 10;
    /// guard_true(lt) [i1, a]; jump(i1, a)
    fn increment_loop() -> Loop {
        let descr = ArrayDescr::int(8);
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let off = b.int_mul(i, 8);
        let x = b.raw_load(descr, a, off);
        let y = b.int_add(x, 1);
        b.raw_store(descr, a, off, y);
        let i1 = b.int_add(i, 1);
        let lt = b.int_lt(i1, 10);
        b.guard_true(lt, &[i1.into(), a.into()]);
        b.finish(&[i1.into(), a.into()])
    }

    fn hoist(lp: &Loop) -> (Loop, usize) {
        let mut descrs = GuardDescrFactory::for_loop(lp);
        GuardHoister::new(&mut descrs).hoist(lp).unwrap()
    }

    fn guard_position(lp: &Loop, opcode: OpCode) -> usize {
        lp.body.iter().position(|op| op.opcode == opcode).unwrap()
    }

    #[test]
    fn test_factory_ids_are_unique() {
        let lp = increment_loop();
        let mut descrs = GuardDescrFactory::for_loop(&lp);
        let original = lp.body[6].guard.as_ref().unwrap().descr;
        let a = descrs.clone_descr(&original);
        let b = descrs.compile_loop_version(&original);
        let c = descrs.resume_at_loop_header(&original);
        assert!(a.id > original.id);
        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(a.kind, DescrKind::ResumeGuard);
        assert_eq!(b.kind, DescrKind::CompileLoopVersion);
        assert_eq!(c.kind, DescrKind::ResumeAtLoopHeader);
        assert_eq!(c.resume_pc, original.resume_pc);
    }

    #[test]
    fn test_loop_exit_guard_is_hoisted() {
        let lp = increment_loop();
        let (hoisted, count) = hoist(&lp);
        assert_eq!(count, 1);
        assert!(hoisted.check_shape().is_ok());
        assert_eq!(hoisted.body.len(), lp.body.len());

        let guard = &hoisted.body[guard_position(&hoisted, OpCode::GuardTrue)];
        let info = guard.guard.as_ref().unwrap();
        assert_eq!(info.descr.kind, DescrKind::CompileLoopVersion);
        assert_eq!(info.fail_args, lp.header.args.to_vec());
        assert_eq!(info.snapshot.frames, vec![lp.header.args.to_vec()]);
        assert!(guard_position(&hoisted, OpCode::GuardTrue) < guard_position(&hoisted, OpCode::RawStore));
    }

    #[test]
    fn test_guard_on_loaded_value_stays() {
        let descr = ArrayDescr::int(8);
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let x = b.raw_load(descr, a, i);
        let lt = b.int_lt(x, 10);
        b.guard_true(lt, &[i.into(), a.into()]);
        let i1 = b.int_add(i, 8);
        let lp = b.finish(&[i1.into(), a.into()]);
        let (same, count) = hoist(&lp);
        assert_eq!(count, 0);
        assert_eq!(same, lp);
    }

    #[test]
    fn test_other_guards_resume_at_loop_header() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        b.guard_not_invalidated(&[i.into()]);
        let i1 = b.int_add(i, 1);
        let lp = b.finish(&[i1.into()]);
        let (hoisted, count) = hoist(&lp);
        assert_eq!(count, 1);
        let info = hoisted.body[0].guard.as_ref().unwrap();
        assert_eq!(info.descr.kind, DescrKind::ResumeAtLoopHeader);
    }

    #[test]
    fn test_early_exit_anchor_stays_first() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        b.guard_early_exit(&[i.into(), a.into()]);
        let x = b.raw_load(ArrayDescr::int(8), a, i);
        b.raw_store(ArrayDescr::int(8), a, i, x);
        let i1 = b.int_add(i, 8);
        let lt = b.int_lt(i1, 80);
        b.guard_true(lt, &[i1.into(), a.into()]);
        let lp = b.finish(&[i1.into(), a.into()]);
        let (hoisted, count) = hoist(&lp);
        assert_eq!(count, 1);
        assert_eq!(hoisted.body[0].opcode, OpCode::GuardEarlyExit);
        assert!(guard_position(&hoisted, OpCode::GuardTrue) < guard_position(&hoisted, OpCode::RawStore));
    }

    #[test]
    fn test_hoisting_preserves_memory_effects() {
        let lp = increment_loop();
        let (hoisted, _) = hoist(&lp);

        let run = |lp: &Loop| {
            let mut memory = Memory::new();
            let a = memory.alloc_ints(&[0; 10], 8);
            run_loop(lp, &[Value::Int(0), Value::Int(a)], &mut memory, 100).unwrap();
            memory.ints(a, ArrayDescr::int(8)).unwrap()
        };
        // the hoisted guard leaves one iteration earlier; the scalar version
        // picks up from the header values, here it simply stops
        let scalar = run(&lp);
        let vectorizable = run(&hoisted);
        assert_eq!(scalar, vec![1; 10]);
        assert_eq!(vectorizable[..9], scalar[..9]);
        assert_eq!(vectorizable[9], 0);
    }
}
