//! Pack set formation.
//!
//! A pack is a group of isomorphic, independent operations of the unrolled
//! loop that becomes one vector operation. Packs are grown in four steps:
//!
//! 1. **Seed**: pair every two adjacent memory accesses
//! 2. **Extend**: follow def-use and use-def chains from existing pairs
//! 3. **Combine**: merge pairs `[a, b]` and `[b, c]` into `[a, b, c]`
//! 4. **Split**: cut packs to exactly one vector register
//!
//! Dependent pairs are only accepted when they form an accumulation, i.e. a
//! loop-carried reduction such as `sum = sum + a[i]`.

use super::dependency::{DependencyGraph, NodeId};
use super::error::{NotVectorizableReason, VectorizeResult};
use crate::ir::operators::{AccumOp, OpCode};
use crate::ir::trace::{Arg, Operation, ValueId, Vectorizability};
use crate::ir::types::{ElemType, WORD_SIZE};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Priority given to members of dropped packs.
pub const DROPPED_PACK_PRIORITY: i32 = -100;

// =============================================================================
// Pack
// =============================================================================

/// A recognized reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Accum {
    /// Associative operator.
    pub operator: AccumOp,
    /// Loop-carried accumulator value.
    pub var: ValueId,
    /// Argument slot of the accumulator in each member.
    pub position: usize,
}

/// Ordered group of isomorphic operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    /// Members in lane order.
    pub nodes: SmallVec<[NodeId; 8]>,
    /// Reduction carried by the pack.
    pub accum: Option<Accum>,
}

impl Pack {
    /// A two-element pack.
    pub fn pair(left: NodeId, right: NodeId) -> Self {
        Pack {
            nodes: smallvec![left, right],
            accum: None,
        }
    }

    /// First member.
    #[inline]
    pub fn left(&self) -> NodeId {
        self.nodes[0]
    }

    /// Last member.
    #[inline]
    pub fn right(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    /// Number of lanes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the pack has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if this pack carries a reduction.
    #[inline]
    pub fn is_accumulating(&self) -> bool {
        self.accum.is_some()
    }

    /// `other` continues where `self` ends and both agree on accumulation.
    pub fn rightmost_match_leftmost(&self, other: &Pack) -> bool {
        if self.right() != other.left() {
            return false;
        }
        match (&self.accum, &other.accum) {
            (None, None) => true,
            (Some(a), Some(b)) => a.position == b.position && a.operator == b.operator,
            _ => false,
        }
    }
}

impl fmt::Display for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", node)?;
        }
        write!(f, "]")?;
        if let Some(accum) = &self.accum {
            write!(f, " accum({} {} @{})", accum.operator, accum.var, accum.position)?;
        }
        Ok(())
    }
}

// =============================================================================
// Pack Set
// =============================================================================

/// The packs of one vectorization attempt.
#[derive(Debug, Clone)]
pub struct PackSet {
    packs: Vec<Pack>,
    vec_reg_bytes: usize,
    types: FxHashMap<ValueId, ElemType>,
}

impl PackSet {
    /// Create an empty set for registers of `vec_reg_bytes` bytes.
    pub fn new(vec_reg_bytes: usize, types: FxHashMap<ValueId, ElemType>) -> Self {
        PackSet {
            packs: Vec::new(),
            vec_reg_bytes,
            types,
        }
    }

    /// All packs.
    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    /// Number of packs.
    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Add a pack.
    pub fn add_pack(&mut self, pack: Pack) {
        self.packs.push(pack);
    }

    /// Vector register width.
    pub fn vec_reg_bytes(&self) -> usize {
        self.vec_reg_bytes
    }

    /// Element types of the loop values.
    pub fn types(&self) -> &FxHashMap<ValueId, ElemType> {
        &self.types
    }

    /// Element type written or produced by an operation.
    pub fn elem_type(&self, op: &Operation) -> ElemType {
        if op.opcode.is_store() {
            if let Some(descr) = op.descr {
                return descr.elem_type();
            }
        }
        op.result
            .and_then(|r| self.types.get(&r).copied())
            .unwrap_or(ElemType::WORD)
    }

    /// Bytes a pack occupies beyond one register; zero means full.
    pub fn pack_load(&self, graph: &DependencyGraph, pack: &Pack) -> isize {
        let bytes = self.elem_type(graph.op(pack.left())).bytes;
        (pack.len() * bytes) as isize - self.vec_reg_bytes as isize
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Pair adjacent memory accesses.
    pub fn find_adjacent_memory_refs(&mut self, graph: &DependencyGraph) -> VectorizeResult<()> {
        let refs = graph.memory_refs();
        for (node_a, ref_a) in refs {
            for (node_b, ref_b) in refs {
                if node_a == node_b {
                    continue;
                }
                if ref_a.is_adjacent_after(ref_b) {
                    if let Some(pair) = self.can_be_packed(graph, *node_a, *node_b, None, false)? {
                        self.add_pack(pair);
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Extension
    // =========================================================================

    /// Follow dependency chains until no new pair is found.
    pub fn extend_packset(&mut self, graph: &DependencyGraph) -> VectorizeResult<()> {
        let mut pack_count = self.pack_count();
        loop {
            let mut i = 0;
            while i < self.packs.len() {
                self.follow_def_uses(graph, i)?;
                i += 1;
            }
            if pack_count == self.pack_count() {
                let mut i = 0;
                while i < self.packs.len() {
                    self.follow_use_defs(graph, i)?;
                    i += 1;
                }
                if pack_count == self.pack_count() {
                    break;
                }
            }
            pack_count = self.pack_count();
        }
        Ok(())
    }

    fn follow_def_uses(&mut self, graph: &DependencyGraph, index: usize) -> VectorizeResult<()> {
        let pack = self.packs[index].clone();
        let (Some(lres), Some(rres)) = (graph.op(pack.left()).result, graph.op(pack.right()).result)
        else {
            return Ok(());
        };
        for lnode in successors(graph, pack.left()) {
            for rnode in successors(graph, pack.right()) {
                if !same_slot(graph.op(lnode), lres, graph.op(rnode), rres) {
                    continue;
                }
                if isomorphic(graph.op(lnode), graph.op(rnode)) && graph.is_before(lnode, rnode) {
                    if let Some(pair) = self.can_be_packed(graph, lnode, rnode, Some(&pack), true)? {
                        self.add_pack(pair);
                    }
                }
            }
        }
        Ok(())
    }

    fn follow_use_defs(&mut self, graph: &DependencyGraph, index: usize) -> VectorizeResult<()> {
        let pack = self.packs[index].clone();
        for lnode in predecessors(graph, pack.left()) {
            for rnode in predecessors(graph, pack.right()) {
                let (Some(lres), Some(rres)) = (graph.op(lnode).result, graph.op(rnode).result)
                else {
                    continue;
                };
                if !same_slot(graph.op(pack.left()), lres, graph.op(pack.right()), rres) {
                    continue;
                }
                if isomorphic(graph.op(lnode), graph.op(rnode)) && graph.is_before(lnode, rnode) {
                    if let Some(pair) = self.can_be_packed(graph, lnode, rnode, Some(&pack), false)? {
                        self.add_pack(pair);
                    }
                }
            }
        }
        Ok(())
    }

    /// Decide whether `lnode` and `rnode` may form a pair.
    pub fn can_be_packed(
        &self,
        graph: &DependencyGraph,
        lnode: NodeId,
        rnode: NodeId,
        origin: Option<&Pack>,
        forward: bool,
    ) -> VectorizeResult<Option<Pack>> {
        let (lop, rop) = (graph.op(lnode), graph.op(rnode));
        if !isomorphic(lop, rop) {
            return Ok(None);
        }
        if graph.independent(lnode, rnode) {
            if forward && origin.is_some_and(Pack::is_accumulating) {
                // the accumulator would have to be split
                return Err(NotVectorizableReason::SplitAccumulator.into());
            }
            if self.contains_pair(lnode, rnode) {
                return Ok(None);
            }
            if (lop.opcode.is_load() || lop.opcode.is_store()) && !adjacent(graph, lnode, rnode) {
                return Ok(None);
            }
            let Some(origin) = origin else {
                let eligible = lop.vector != Vectorizability::Ineligible
                    && rop.vector != Vectorizability::Ineligible;
                return Ok(eligible.then(|| Pack::pair(lnode, rnode)));
            };
            if self.profitable_pack(graph, lnode, rnode, origin, forward) {
                return Ok(Some(Pack::pair(lnode, rnode)));
            }
        } else {
            if self.contains_pair(lnode, rnode) {
                return Ok(None);
            }
            if let Some(origin) = origin {
                return Ok(self.accumulates_pair(graph, lnode, rnode, origin));
            }
        }
        Ok(None)
    }

    /// Some pack already starts at `lnode` or ends at `rnode`.
    pub fn contains_pair(&self, lnode: NodeId, rnode: NodeId) -> bool {
        self.packs
            .iter()
            .any(|p| p.left() == lnode || p.right() == rnode)
    }

    fn profitable_pack(
        &self,
        graph: &DependencyGraph,
        lnode: NodeId,
        rnode: NodeId,
        origin: &Pack,
        forward: bool,
    ) -> bool {
        !prohibit_packing(graph.op(origin.left()), graph.op(lnode), forward)
            && !prohibit_packing(graph.op(origin.right()), graph.op(rnode), forward)
    }

    fn accumulates_pair(
        &self,
        graph: &DependencyGraph,
        lnode: NodeId,
        rnode: NodeId,
        origin: &Pack,
    ) -> Option<Pack> {
        let (lop, rop) = (graph.op(lnode), graph.op(rnode));
        let operator = lop.opcode.accum_operator()?;
        let lresult = lop.result?;
        if lop.args.len() != 2 || rop.args.len() != 2 {
            return None;
        }
        let position = rop.args.iter().position(|a| a.is(lresult))?;
        // the dependency exists only because of the left result
        if graph.because_of(lnode, rnode).as_slice() != [lresult] {
            return None;
        }
        let var = lop.args[position].as_value()?;

        // the other operand must come lane-wise from the origin pack
        let var_pos = (position + 1) % 2;
        let origin_left = graph.op(origin.left()).result?;
        let origin_right = graph.op(origin.right()).result?;
        if !lop.args[var_pos].is(origin_left) || !rop.args[var_pos].is(origin_right) {
            return None;
        }
        if graph.reaches(lnode, origin.right()) {
            return None;
        }
        // narrower lanes would need the width conversions in front of the
        // reduction to be matched as well
        if self.elem_type(graph.op(origin.left())).bytes != WORD_SIZE {
            return None;
        }
        Some(Pack {
            nodes: smallvec![lnode, rnode],
            accum: Some(Accum {
                operator,
                var,
                position,
            }),
        })
    }

    // =========================================================================
    // Combination
    // =========================================================================

    /// Merge chained pairs into wider packs.
    pub fn combine_packset(&mut self) -> VectorizeResult<()> {
        if self.packs.is_empty() {
            return Err(NotVectorizableReason::NoPacks.into());
        }
        loop {
            let len_before = self.packs.len();
            let mut i = 0;
            while i < self.packs.len() {
                let mut j = 0;
                while j < self.packs.len() {
                    if i != j && self.packs[i].rightmost_match_leftmost(&self.packs[j]) {
                        self.combine(i, j);
                        if j < i {
                            i -= 1;
                        }
                        j = 0;
                        continue;
                    }
                    j += 1;
                }
                i += 1;
            }
            if len_before == self.packs.len() {
                break;
            }
        }
        Ok(())
    }

    /// Append pack `j` (minus its shared first member) to pack `i`.
    fn combine(&mut self, i: usize, j: usize) {
        let tail: SmallVec<[NodeId; 8]> = self.packs[j].nodes[1..].iter().copied().collect();
        self.packs[i].nodes.extend(tail);
        self.packs.remove(j);
    }

    // =========================================================================
    // Splitting
    // =========================================================================

    /// Fit every pack to one vector register.
    ///
    /// Overloaded packs are cut into full packs; parts that do not fill a
    /// register are dropped and their members scheduled last.
    pub fn split_overloaded_packs(&mut self, graph: &mut DependencyGraph) -> VectorizeResult<()> {
        let mut kept = Vec::with_capacity(self.packs.len());
        for pack in std::mem::take(&mut self.packs) {
            let load = self.pack_load(graph, &pack);
            if load == 0 {
                kept.push(pack);
                continue;
            }
            if load > 0 && pack.is_accumulating() {
                return Err(NotVectorizableReason::SplitAccumulator.into());
            }
            let bytes = self.elem_type(graph.op(pack.left())).bytes.max(1);
            let lanes = self.vec_reg_bytes / bytes;
            let mut rest: &[NodeId] = &pack.nodes;
            if load > 0 && lanes >= 2 {
                while rest.len() >= lanes {
                    kept.push(Pack {
                        nodes: rest[..lanes].iter().copied().collect(),
                        accum: None,
                    });
                    rest = &rest[lanes..];
                }
            }
            for &node in rest {
                graph.node_mut(node).priority = DROPPED_PACK_PRIORITY;
            }
        }
        self.packs = kept;
        for (index, pack) in self.packs.iter().enumerate() {
            for &node in &pack.nodes {
                graph.node_mut(node).pack = Some(index);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Isomorphism: same operation kind.
#[inline]
pub fn isomorphic(l: &Operation, r: &Operation) -> bool {
    l.opcode.same_shape(r.opcode)
}

/// Block packing of operations whose vector form cannot be determined.
fn prohibit_packing(packed: &Operation, inquestion: &Operation, forward: bool) -> bool {
    if inquestion.vector == Vectorizability::Ineligible {
        return true;
    }
    if packed.opcode.is_primitive_array_access() {
        if let (Some(index), Some(result)) = (packed.arg(1), inquestion.result) {
            if index.is(result) {
                return true;
            }
        }
    }
    // the source width of a sign extension is unknown walking backwards
    !forward && inquestion.opcode == OpCode::IntSignExt
}

/// The two accesses address neighbouring elements.
fn adjacent(graph: &DependencyGraph, lnode: NodeId, rnode: NodeId) -> bool {
    let refs = graph.memory_refs();
    let find = |node: NodeId| refs.iter().find(|(n, _)| *n == node).map(|(_, r)| r);
    match (find(lnode), find(rnode)) {
        (Some(a), Some(b)) => a.is_adjacent_after(b),
        _ => false,
    }
}

/// `lvalue` and `rvalue` are read through the same argument slot.
fn same_slot(lop: &Operation, lvalue: ValueId, rop: &Operation, rvalue: ValueId) -> bool {
    lop.args
        .iter()
        .zip(rop.args.iter())
        .any(|(l, r)| l.is(lvalue) && r.is(rvalue))
}

fn successors(graph: &DependencyGraph, node: NodeId) -> SmallVec<[NodeId; 8]> {
    let mut out: SmallVec<[NodeId; 8]> = SmallVec::new();
    for edge in &graph.node(node).provides {
        if edge.to != graph.jump() && !out.contains(&edge.to) {
            out.push(edge.to);
        }
    }
    out
}

fn predecessors(graph: &DependencyGraph, node: NodeId) -> SmallVec<[NodeId; 8]> {
    let mut out: SmallVec<[NodeId; 8]> = SmallVec::new();
    for edge in &graph.node(node).depends {
        if edge.to != graph.label() && !out.contains(&edge.to) {
            out.push(edge.to);
        }
    }
    out
}

/// Scalar argument of lane `lane` at `slot`.
pub fn lane_arg(graph: &DependencyGraph, pack: &Pack, lane: usize, slot: usize) -> Option<Arg> {
    graph.op(*pack.nodes.get(lane)?).arg(slot)
}

// =============================================================================
// Tests
// =============================================================================
