//! List scheduling of dependency graphs.
//!
//! The scheduler walks the graph with a ready list. A node is ready once all
//! of its predecessors were emitted; among ready units the highest priority
//! wins, ties go to the earlier trace position. The label is emitted first
//! and the jump last.
//!
//! In scalar mode the ready units are single nodes and the output is just
//! the reordered trace. In vector mode every pack is a unit that becomes
//! ready when all its members are, and is emitted as one vector operation.
//! Operands are turned into vectors on demand:
//!
//! - lanes already in order in one vector are reused as is
//! - an invariant scalar in every lane is expanded once in the prefix and
//!   carried through the loop header
//! - anything else is built with `vec_expand` or `vec_pack` in the body
//!
//! Scalar consumers of a packed value get a `vec_extract` that redefines the
//! original scalar right before its first use.
//!
//! Every emitted pack records its savings with the cost model. A sign
//! extension that changes the element width is charged twice: its pack
//! cost brings no benefit, and `record_cast_int` adds one move per lane for
//! the width change itself.

use super::cost::{CostModel, PackCost};
use super::dependency::{DependencyGraph, NodeId};
use super::error::{NotVectorizableReason, VectorizeError, VectorizeResult};
use super::pack::{lane_arg, Pack, PackSet};
use super::Accumulator;
use crate::ir::arena::BitSet;
use crate::ir::operators::OpCode;
use crate::ir::trace::{Arg, Loop, Operation, ValueGen, ValueId};
use crate::ir::types::{Datatype, ElemType};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

// =============================================================================
// Ready List
// =============================================================================

/// What is emitted in one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// A single operation.
    Single(NodeId),
    /// All members of the pack with this index.
    Pack(usize),
}

/// Topological order of the body honouring priorities.
///
/// With an empty `packs` slice pack assignments are ignored.
pub fn order(graph: &DependencyGraph, packs: &[Pack]) -> VectorizeResult<Vec<Unit>> {
    let pack_of = |n: NodeId| {
        if packs.is_empty() {
            None
        } else {
            graph.node(n).pack
        }
    };
    let same_pack = |a: NodeId, b: NodeId| {
        matches!((pack_of(a), pack_of(b)), (Some(x), Some(y)) if x == y)
    };
    let (label, jump) = (graph.label(), graph.jump());

    let mut pending = vec![0usize; graph.len()];
    for n in graph.body() {
        for edge in &graph.node(n).depends {
            if edge.to != label && !same_pack(edge.to, n) {
                pending[n.as_usize()] += 1;
            }
        }
    }

    let total = graph.len().saturating_sub(2);
    let mut done = BitSet::with_capacity(graph.len());
    let mut units = Vec::new();
    let mut emitted = 0;
    while emitted < total {
        let mut best: Option<(Unit, i32, usize)> = None;
        for n in graph.body() {
            if done.contains(n.as_usize()) || pending[n.as_usize()] > 0 {
                continue;
            }
            let unit = match pack_of(n) {
                None => Unit::Single(n),
                Some(p) => {
                    let pack = &packs[p];
                    if pack.left() != n || pack.nodes.iter().any(|m| pending[m.as_usize()] > 0) {
                        continue;
                    }
                    Unit::Pack(p)
                }
            };
            let node = graph.node(n);
            let better = match best {
                None => true,
                Some((_, priority, position)) => {
                    node.priority > priority || (node.priority == priority && node.position < position)
                }
            };
            if better {
                best = Some((unit, node.priority, node.position));
            }
        }

        let Some((unit, _, _)) = best else {
            let stuck_in_pack = graph
                .body()
                .any(|n| !done.contains(n.as_usize()) && pack_of(n).is_some());
            return Err(if stuck_in_pack {
                NotVectorizableReason::UnschedulablePack.into()
            } else {
                VectorizeError::Internal("dependency cycle in loop body".to_string())
            });
        };

        let members: SmallVec<[NodeId; 8]> = match unit {
            Unit::Single(n) => smallvec![n],
            Unit::Pack(p) => packs[p].nodes.clone(),
        };
        for &m in &members {
            done.insert(m.as_usize());
            emitted += 1;
            for edge in &graph.node(m).provides {
                if edge.to == jump || same_pack(m, edge.to) {
                    continue;
                }
                let count = &mut pending[edge.to.as_usize()];
                *count = count.saturating_sub(1);
            }
        }
        units.push(unit);
    }
    Ok(units)
}

/// Reorder the scalar trace of `graph` by priority.
pub fn linearize(graph: &DependencyGraph) -> VectorizeResult<Loop> {
    let body = order(graph, &[])?
        .into_iter()
        .filter_map(|unit| match unit {
            Unit::Single(n) => Some(graph.op(n).clone()),
            Unit::Pack(_) => None,
        })
        .collect();
    Ok(Loop {
        header: graph.op(graph.label()).clone(),
        body,
        closer: graph.op(graph.jump()).clone(),
    })
}

// =============================================================================
// Vector Emission
// =============================================================================

/// Output of vector scheduling.
#[derive(Debug, Clone)]
pub struct ScheduledLoop {
    /// Operations run once before entering the loop.
    pub prefix: Vec<Operation>,
    /// Initial values of the loop header.
    pub entry_args: Vec<Arg>,
    /// The vector loop.
    pub body: Loop,
    /// Reductions carried by the loop.
    pub accumulators: Vec<Accumulator>,
}

#[derive(Debug, Clone, Copy)]
struct Lane {
    vector: ValueId,
    index: usize,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct AccumSlot {
    slot: usize,
    input: ValueId,
    accumulator: usize,
}

/// Emits the vector loop for a pack set.
pub struct Scheduler<'a> {
    graph: &'a DependencyGraph,
    packset: &'a PackSet,
    values: &'a mut ValueGen,
    cost: &'a mut dyn CostModel,

    prefix: Vec<Operation>,
    body: Vec<Operation>,
    header: Vec<Arg>,
    entry: Vec<Arg>,
    jump: Vec<Arg>,

    lanes: FxHashMap<ValueId, Lane>,
    extracted: FxHashSet<ValueId>,
    expanded: FxHashMap<(Arg, usize), ValueId>,

    accum_inputs: FxHashMap<ValueId, ValueId>,
    accum_members: FxHashSet<ValueId>,
    accum_slots: FxHashMap<usize, AccumSlot>,
    accumulators: Vec<Accumulator>,
}

impl<'a> Scheduler<'a> {
    /// Create a scheduler for `packset` over `graph`.
    pub fn new(
        graph: &'a DependencyGraph,
        packset: &'a PackSet,
        values: &'a mut ValueGen,
        cost: &'a mut dyn CostModel,
    ) -> Self {
        let header = graph.op(graph.label()).args.to_vec();
        let jump = graph.op(graph.jump()).args.to_vec();
        Scheduler {
            graph,
            packset,
            values,
            cost,
            prefix: Vec::new(),
            body: Vec::with_capacity(graph.len()),
            entry: header.clone(),
            header,
            jump,
            lanes: FxHashMap::default(),
            extracted: FxHashSet::default(),
            expanded: FxHashMap::default(),
            accum_inputs: FxHashMap::default(),
            accum_members: FxHashSet::default(),
            accum_slots: FxHashMap::default(),
            accumulators: Vec::new(),
        }
    }

    /// Emit the vector loop, recording costs as it goes.
    pub fn run(mut self) -> VectorizeResult<ScheduledLoop> {
        self.setup_accumulators()?;
        for unit in order(self.graph, self.packset.packs())? {
            match unit {
                Unit::Single(n) => self.emit_single(n)?,
                Unit::Pack(p) => self.emit_pack(p)?,
            }
        }
        let jump_args = std::mem::take(&mut self.jump)
            .into_iter()
            .map(|arg| self.scalar_use(arg, false))
            .collect::<VectorizeResult<Vec<_>>>()?;
        self.eliminate_dead(&jump_args);

        let body = Loop {
            header: Operation::new(OpCode::Label, None, &self.header),
            body: self.body,
            closer: Operation::new(OpCode::Jump, None, &jump_args),
        };
        Ok(ScheduledLoop {
            prefix: self.prefix,
            entry_args: self.entry,
            body,
            accumulators: self.accumulators,
        })
    }

    // =========================================================================
    // Accumulators
    // =========================================================================

    /// Seed every reduction vector in the prefix and thread it through the
    /// loop header in place of its scalar.
    fn setup_accumulators(&mut self) -> VectorizeResult<()> {
        let packset = self.packset;
        for (index, pack) in packset.packs().iter().enumerate() {
            let Some(accum) = pack.accum else {
                continue;
            };
            let slot = self
                .header
                .iter()
                .position(|a| a.is(accum.var))
                .ok_or(NotVectorizableReason::AccumulatorNotLoopCarried(accum.var))?;
            let last = self.graph.op(pack.right()).result.ok_or_else(|| {
                VectorizeError::Internal(format!("accumulator pack {} has no result", pack))
            })?;
            if !self.jump[slot].is(last) {
                return Err(NotVectorizableReason::AccumulatorNotLoopCarried(accum.var).into());
            }

            let datatype = self.datatype_of(accum.var.into());
            let identity = match datatype {
                Datatype::Float => Arg::Float(accum.operator.identity_float()),
                _ => Arg::Int(accum.operator.identity_int()),
            };
            let lanes = pack.len();
            let splat = self.values.fresh();
            self.prefix
                .push(Operation::new(OpCode::VecExpand, Some(splat), &[identity]).with_lanes(lanes));
            let init = self.values.fresh();
            self.prefix.push(
                Operation::new(
                    OpCode::VecInsert,
                    Some(init),
                    &[splat.into(), accum.var.into(), Arg::Int(0)],
                )
                .with_lanes(lanes),
            );

            let input = self.values.fresh();
            self.header[slot] = input.into();
            self.entry[slot] = init.into();
            self.accum_inputs.insert(accum.var, input);
            for &member in &pack.nodes {
                if let Some(result) = self.graph.op(member).result {
                    self.accum_members.insert(result);
                }
            }
            self.accum_slots.insert(
                index,
                AccumSlot {
                    slot,
                    input,
                    accumulator: self.accumulators.len(),
                },
            );
            self.accumulators.push(Accumulator {
                values: vec![input],
                operator: accum.operator,
                datatype,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit_single(&mut self, node: NodeId) -> VectorizeResult<()> {
        let mut op = self.graph.op(node).clone();
        for i in 0..op.args.len() {
            op.args[i] = self.scalar_use(op.args[i], false)?;
        }
        if let Some(guard) = op.guard.as_deref_mut() {
            for arg in guard.fail_args.iter_mut() {
                *arg = self.scalar_use(*arg, true)?;
            }
            for frame in guard.snapshot.frames.iter_mut() {
                for arg in frame.iter_mut() {
                    *arg = self.scalar_use(*arg, true)?;
                }
            }
        }
        self.body.push(op);
        Ok(())
    }

    fn emit_pack(&mut self, index: usize) -> VectorizeResult<()> {
        let pack = self.packset.packs()[index].clone();
        let left = self.graph.op(pack.left()).clone();
        let lanes = pack.len();
        let vector_opcode = left.opcode.to_vector().ok_or_else(|| {
            VectorizeError::Internal(format!("{} has no vector form", left.opcode))
        })?;
        let accum = self.accum_slots.get(&index).copied();

        let mut args: SmallVec<[Arg; 4]> = SmallVec::new();
        for (slot, &arg) in left.args.iter().enumerate() {
            let operand = match left.opcode {
                OpCode::RawLoad | OpCode::RawStore if slot < 2 => self.scalar_use(arg, false)?,
                OpCode::IntSignExt if slot == 1 => arg,
                _ => match (accum, pack.accum) {
                    (Some(acc), Some(info)) if info.position == slot => acc.input.into(),
                    _ => self.vector_operand(&pack, slot)?,
                },
            };
            args.push(operand);
        }

        let result = left.result.map(|_| self.values.fresh());
        let mut op = Operation::new(vector_opcode, result, &args).with_lanes(lanes);
        op.descr = left.descr;
        self.body.push(op);

        if let Some(vector) = result {
            match accum {
                Some(acc) => {
                    self.accumulators[acc.accumulator].values.push(vector);
                    self.jump[acc.slot] = vector.into();
                }
                None => {
                    for (k, &member) in pack.nodes.iter().enumerate() {
                        if let Some(scalar) = self.graph.op(member).result {
                            self.lanes.insert(
                                scalar,
                                Lane {
                                    vector,
                                    index: k,
                                    count: lanes,
                                },
                            );
                        }
                    }
                }
            }
        }

        if left.opcode == OpCode::IntSignExt {
            let from = self.elem_type_of(left.args[0]).bytes;
            let to = left.arg(1).and_then(|a| a.as_int()).unwrap_or(0) as usize;
            self.cost
                .record_pack_savings(&PackCost::cast(left.opcode, lanes, from, to), lanes);
            if from != to {
                self.cost.record_cast_int(from, to, lanes);
            }
        } else {
            self.cost
                .record_pack_savings(&PackCost::new(left.opcode, lanes), lanes);
        }
        Ok(())
    }

    /// Vector holding argument `slot` of every pack member, lane by lane.
    fn vector_operand(&mut self, pack: &Pack, slot: usize) -> VectorizeResult<Arg> {
        let scalars = (0..pack.len())
            .map(|lane| lane_arg(self.graph, pack, lane, slot))
            .collect::<Option<SmallVec<[Arg; 8]>>>()
            .ok_or_else(|| {
                VectorizeError::Internal(format!("pack {} lacks argument {}", pack, slot))
            })?;
        let count = scalars.len();

        if let Some(vector) = self.in_order(&scalars) {
            return Ok(vector.into());
        }

        let first = scalars[0];
        let datatype = self.datatype_of(first);
        if scalars.iter().all(|a| *a == first) {
            if self.is_invariant(first) {
                return Ok(self.expand_invariant(first, count).into());
            }
            let scalar = self.scalar_use(first, false)?;
            let vector = self.values.fresh();
            self.body
                .push(Operation::new(OpCode::VecExpand, Some(vector), &[scalar]).with_lanes(count));
            self.cost.record_vector_pack(datatype, 0, count);
            return Ok(vector.into());
        }

        let mut args: SmallVec<[Arg; 8]> = SmallVec::with_capacity(count);
        for &arg in &scalars {
            args.push(self.scalar_use(arg, false)?);
        }
        let vector = self.values.fresh();
        self.body
            .push(Operation::new(OpCode::VecPack, Some(vector), &args).with_lanes(count));
        self.cost.record_vector_pack(datatype, 0, count);
        Ok(vector.into())
    }

    /// The vector whose lanes are exactly `scalars`, if there is one.
    fn in_order(&self, scalars: &[Arg]) -> Option<ValueId> {
        let first = self.lanes.get(&scalars[0].as_value()?)?;
        if first.count != scalars.len() {
            return None;
        }
        let all = scalars.iter().enumerate().all(|(k, arg)| {
            arg.as_value()
                .and_then(|v| self.lanes.get(&v))
                .is_some_and(|lane| lane.vector == first.vector && lane.index == k)
        });
        all.then_some(first.vector)
    }

    /// Constants and header values the loop passes on unchanged.
    fn is_invariant(&self, arg: Arg) -> bool {
        let Arg::Value(value) = arg else {
            return true;
        };
        let label = &self.graph.op(self.graph.label()).args;
        let jump = &self.graph.op(self.graph.jump()).args;
        label
            .iter()
            .zip(jump.iter())
            .any(|(l, j)| l.is(value) && j.is(value))
    }

    /// Broadcast `arg` once in the prefix and carry it through the header.
    fn expand_invariant(&mut self, arg: Arg, lanes: usize) -> ValueId {
        if let Some(&carried) = self.expanded.get(&(arg, lanes)) {
            return carried;
        }
        let vector = self.values.fresh();
        self.prefix
            .push(Operation::new(OpCode::VecExpand, Some(vector), &[arg]).with_lanes(lanes));
        let carried = self.values.fresh();
        self.header.push(carried.into());
        self.entry.push(vector.into());
        self.jump.push(carried.into());
        self.expanded.insert((arg, lanes), carried);
        carried
    }

    /// Make a scalar available to a non-packed consumer.
    ///
    /// `recovery` marks fail arguments and snapshots, which may name a
    /// reduction by its vector.
    fn scalar_use(&mut self, arg: Arg, recovery: bool) -> VectorizeResult<Arg> {
        let Arg::Value(value) = arg else {
            return Ok(arg);
        };
        if let Some(&input) = self.accum_inputs.get(&value) {
            if recovery {
                return Ok(input.into());
            }
            return Err(NotVectorizableReason::AccumulatorEscapes(value).into());
        }
        if self.accum_members.contains(&value) {
            return Err(NotVectorizableReason::AccumulatorEscapes(value).into());
        }
        if let Some(lane) = self.lanes.get(&value).copied() {
            if self.extracted.insert(value) {
                self.body.push(Operation::new(
                    OpCode::VecExtract,
                    Some(value),
                    &[lane.vector.into(), Arg::Int(lane.index as i64)],
                ));
                let datatype = self.datatype_of(arg);
                self.cost.record_vector_unpack(datatype, lane.index, 1);
            }
        }
        Ok(arg)
    }

    /// Drop pure operations whose results are never read.
    fn eliminate_dead(&mut self, jump_args: &[Arg]) {
        loop {
            let used: FxHashSet<ValueId> = jump_args
                .iter()
                .filter_map(Arg::as_value)
                .chain(self.body.iter().flat_map(|op| op.used_values()))
                .collect();
            let before = self.body.len();
            self.body.retain(|op| {
                !(op.opcode.is_pure() && op.result.is_some_and(|r| !used.contains(&r)))
            });
            if self.body.len() == before {
                break;
            }
        }
    }

    fn elem_type_of(&self, arg: Arg) -> ElemType {
        match arg {
            Arg::Value(v) => self
                .packset
                .types()
                .get(&v)
                .copied()
                .unwrap_or(ElemType::WORD),
            Arg::Int(_) => ElemType::WORD,
            Arg::Float(_) => ElemType::FLOAT,
        }
    }

    fn datatype_of(&self, arg: Arg) -> Datatype {
        self.elem_type_of(arg).datatype
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::TraceBuilder;
    use crate::ir::types::ArrayDescr;
    use crate::opt::vectorize::cost::X86CostModel;
    use crate::opt::vectorize::dependency::EdgeKind;

    fn node(n: u32) -> NodeId {
        NodeId::new(n)
    }

    /// label(i, a); x = a[i]; y = x * 2; z = i + 1; a[i] = y; jump(z, a)
    fn small_loop() -> Loop {
        let descr = ArrayDescr::int(8);
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let x = b.raw_load(descr, a, i);
        let y = b.int_mul(x, 2);
        let z = b.int_add(i, 1);
        b.raw_store(descr, a, i, y);
        b.finish(&[z.into(), a.into()])
    }

    #[test]
    fn test_linearize_keeps_trace_order_by_default() {
        let lp = small_loop();
        let graph = DependencyGraph::build(&lp);
        assert_eq!(linearize(&graph).unwrap(), lp);
    }

    #[test]
    fn test_priority_moves_ready_nodes_up() {
        let lp = small_loop();
        let mut graph = DependencyGraph::build(&lp);
        graph.node_mut(node(3)).priority = 10;
        let reordered = linearize(&graph).unwrap();
        assert_eq!(reordered.body[0].opcode, OpCode::IntAdd);
        assert_eq!(reordered.body.len(), lp.body.len());
    }

    #[test]
    fn test_cycle_is_internal_error() {
        let lp = small_loop();
        let mut graph = DependencyGraph::build(&lp);
        graph.add_edge(node(4), node(1), EdgeKind::Control, None);
        assert!(matches!(linearize(&graph), Err(VectorizeError::Internal(_))));
    }

    #[test]
    fn test_pack_blocked_by_member_is_unschedulable() {
        // pack the load with the store that depends on it
        let lp = small_loop();
        let mut graph = DependencyGraph::build(&lp);
        let pack = Pack::pair(node(1), node(4));
        graph.node_mut(node(1)).pack = Some(0);
        graph.node_mut(node(4)).pack = Some(0);
        assert_eq!(
            order(&graph, &[pack]),
            Err(NotVectorizableReason::UnschedulablePack.into())
        );
    }

    fn two_lane_copy() -> (Loop, ValueId) {
        // label(i, a, b); o0 = i*8; x0 = a[o0]; b[o0] = x0 + k;
        // i1 = i+1; o1 = i1*8; x1 = a[o1]; b[o1] = x1 + k; i2 = i1+1; jump(i2, a, b)
        let descr = ArrayDescr::int(8);
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let dst = b.input();
        let o0 = b.int_mul(i, 8);
        let x0 = b.raw_load(descr, a, o0);
        let y0 = b.int_add(x0, 7);
        b.raw_store(descr, dst, o0, y0);
        let i1 = b.int_add(i, 1);
        let o1 = b.int_mul(i1, 8);
        let x1 = b.raw_load(descr, a, o1);
        let y1 = b.int_add(x1, 7);
        b.raw_store(descr, dst, o1, y1);
        let i2 = b.int_add(i1, 1);
        (b.finish(&[i2.into(), a.into(), dst.into()]), x0)
    }

    fn schedule_with(
        lp: &Loop,
        vreg: usize,
        cost: &mut dyn CostModel,
    ) -> VectorizeResult<ScheduledLoop> {
        let mut graph = DependencyGraph::build(lp);
        let mut set = PackSet::new(vreg, lp.value_types());
        set.find_adjacent_memory_refs(&graph)?;
        set.extend_packset(&graph)?;
        set.combine_packset()?;
        set.split_overloaded_packs(&mut graph)?;
        let mut values = ValueGen::after(lp);
        Scheduler::new(&graph, &set, &mut values, cost).run()
    }

    fn schedule(lp: &Loop) -> (ScheduledLoop, i64) {
        let mut cost = X86CostModel::new(0);
        let scheduled = schedule_with(lp, 16, &mut cost).unwrap();
        (scheduled, cost.savings())
    }

    #[test]
    fn test_invariant_constant_is_expanded_in_prefix() {
        let (lp, _) = two_lane_copy();
        let (scheduled, savings) = schedule(&lp);
        assert!(scheduled.body.check_shape().is_ok());
        let expand = scheduled
            .prefix
            .iter()
            .find(|op| op.opcode == OpCode::VecExpand)
            .unwrap();
        assert_eq!(expand.args[0], Arg::Int(7));
        // carried through label and jump
        assert_eq!(scheduled.body.header.args.len(), 4);
        assert_eq!(scheduled.body.closer.args.len(), 4);
        assert_eq!(scheduled.entry_args.len(), 4);
        assert_eq!(scheduled.body.header.args[3], scheduled.body.closer.args[3]);
        // load, add, store packs
        assert_eq!(savings, 3);
    }

    #[test]
    fn test_vector_body_replaces_scalar_copies() {
        let (lp, _) = two_lane_copy();
        let (scheduled, _) = schedule(&lp);
        let opcodes: Vec<OpCode> = scheduled.body.body.iter().map(|op| op.opcode).collect();
        assert!(opcodes.contains(&OpCode::VecRawLoad));
        assert!(opcodes.contains(&OpCode::VecIntAdd));
        assert!(opcodes.contains(&OpCode::VecRawStore));
        assert!(!opcodes.contains(&OpCode::RawLoad));
        // the second offset is dead once the pack addresses from lane 0
        let muls = opcodes.iter().filter(|&&o| o == OpCode::IntMul).count();
        assert_eq!(muls, 1);
        assert!(scheduled.body.body.len() < lp.body.len());
    }

    #[test]
    fn test_scalar_consumer_gets_extract() {
        let (mut lp, x0) = two_lane_copy();
        let lt = ValueId(100);
        lp.body
            .push(Operation::new(OpCode::IntLt, Some(lt), &[x0.into(), Arg::Int(100)]));
        lp.body
            .push(Operation::new(OpCode::Call, Some(ValueId(101)), &[lt.into()]));
        let (scheduled, savings) = schedule(&lp);
        let extract = scheduled
            .body
            .body
            .iter()
            .find(|op| op.opcode == OpCode::VecExtract)
            .unwrap();
        assert_eq!(extract.result, Some(x0));
        assert_eq!(extract.args[1], Arg::Int(0));
        // three packs minus one lane move
        assert_eq!(savings, 2);
    }

    #[test]
    fn test_partial_sum_read_by_call_escapes() {
        // label(i, sum, a); s0 = sum + a[i*8]; s1 = s0 + a[(i+1)*8];
        // call(s0); jump(i+2, s1, a)
        let descr = ArrayDescr::float();
        let mut b = TraceBuilder::new();
        let i = b.input();
        let sum = b.input();
        let a = b.input();
        let o0 = b.int_mul(i, 8);
        let x0 = b.raw_load(descr, a, o0);
        let s0 = b.float_add(sum, x0);
        let i1 = b.int_add(i, 1);
        let o1 = b.int_mul(i1, 8);
        let x1 = b.raw_load(descr, a, o1);
        let s1 = b.float_add(s0, x1);
        let i2 = b.int_add(i1, 1);
        b.call(&[s0.into()]);
        let lp = b.finish(&[i2.into(), s1.into(), a.into()]);

        let mut cost = X86CostModel::new(0);
        assert_eq!(
            schedule_with(&lp, 16, &mut cost).err(),
            Some(VectorizeError::from(NotVectorizableReason::AccumulatorEscapes(s0)))
        );
    }

    /// Logs every width change and delegates pricing to the x86 model.
    #[derive(Default)]
    struct CastLog {
        inner: X86CostModel,
        casts: Vec<(usize, usize, usize)>,
        packs: Vec<OpCode>,
    }

    impl CostModel for CastLog {
        fn record_pack_savings(&mut self, pack: &PackCost, times: usize) {
            self.packs.push(pack.opcode);
            self.inner.record_pack_savings(pack, times);
        }

        fn record_cast_int(&mut self, from_bytes: usize, to_bytes: usize, count: usize) {
            self.casts.push((from_bytes, to_bytes, count));
            self.inner.record_cast_int(from_bytes, to_bytes, count);
        }

        fn record_vector_pack(&mut self, datatype: Datatype, index: usize, count: usize) {
            self.inner.record_vector_pack(datatype, index, count);
        }

        fn savings(&self) -> i64 {
            self.inner.savings()
        }

        fn threshold(&self) -> i64 {
            self.inner.threshold()
        }

        fn reset_savings(&mut self) {
            self.inner.reset_savings();
        }
    }

    #[test]
    fn test_widening_sign_extension_pays_pack_and_moves() {
        // two copies of: x = a[i*2] (i16); y = signext(x, 4); c[i*4] = y
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let c = b.input();
        let mut index = i;
        for _ in 0..2 {
            let src = b.int_mul(index, 2);
            let x = b.raw_load(ArrayDescr::int(2), a, src);
            let y = b.int_signext(x, 4);
            let dst = b.int_mul(index, 4);
            b.raw_store(ArrayDescr::int(4), c, dst, y);
            index = b.int_add(index, 1);
        }
        let lp = b.finish(&[index.into(), a.into(), c.into()]);

        // the 4-byte load pack underfills an 8-byte register and is dropped
        let mut cost = CastLog::default();
        let scheduled = schedule_with(&lp, 8, &mut cost).unwrap();
        assert!(scheduled
            .body
            .body
            .iter()
            .any(|op| op.opcode == OpCode::VecIntSignExt));
        assert!(cost.packs.contains(&OpCode::IntSignExt));
        assert_eq!(cost.casts, vec![(2, 4, 2)]);
    }
}
