//! Dependency graph over the operations of one loop trace.
//!
//! Every operation becomes a node in an arena, addressed by `NodeId`. Edges
//! are stored twice, as `provides` on the source and `depends` on the target,
//! so both directions can be walked in O(degree):
//!
//! - **Data**: a value defined by the source is read by the target
//! - **FailArg**: the target guard keeps a source value alive, or must stay
//!   behind an earlier effect or guard so that it resumes in the right state
//! - **Memory**: aliasing accesses where at least one writes
//! - **Control**: a guard protects a later memory access, or a loop-header
//!   guard must run before every effect
//! - **Pullup**: a guard moved up to the loop header hangs off the anchor
//!
//! Node 0 is the label and defines the loop-carried values; the last node is
//! the jump.

use super::index::{IndexAnalysis, MemoryRef};
use crate::ir::arena::{Arena, BitSet, Id};
use crate::ir::operators::OpCode;
use crate::ir::trace::{Loop, Operation, ValueId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Nodes and Edges
// =============================================================================

/// Identifier of a dependency node.
pub type NodeId = Id<DepNode>;

/// Reason for an ordering constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Value flow.
    Data,
    /// Recovery state of a guard.
    FailArg,
    /// Aliasing memory accesses.
    Memory,
    /// Guard protection or effect ordering.
    Control,
    /// Guard relocated to the loop header.
    Pullup,
}

/// One half of an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// The node at the other end.
    pub to: NodeId,
    /// Constraint kind.
    pub kind: EdgeKind,
    /// Values the constraint exists for.
    pub values: SmallVec<[ValueId; 2]>,
}

impl Edge {
    /// Check if the edge exists only because of `value`.
    pub fn because_of(&self, value: ValueId) -> bool {
        self.values.iter().all(|&v| v == value) && !self.values.is_empty()
    }
}

/// A trace operation placed in the dependency graph.
#[derive(Debug, Clone)]
pub struct DepNode {
    /// The operation.
    pub op: Operation,
    /// Position in the linear trace (label is 0).
    pub position: usize,
    /// Scheduling priority; higher is emitted earlier.
    pub priority: i32,
    /// Pack the node belongs to.
    pub pack: Option<usize>,
    /// Outgoing edges.
    pub provides: Vec<Edge>,
    /// Incoming edges, `to` naming the source.
    pub depends: Vec<Edge>,
}

impl DepNode {
    fn new(op: Operation, position: usize) -> Self {
        DepNode {
            op,
            position,
            priority: 0,
            pack: None,
            provides: Vec::new(),
            depends: Vec::new(),
        }
    }

    /// Check if this node has a side effect.
    #[inline]
    pub fn has_side_effect(&self) -> bool {
        self.op.opcode.has_side_effect()
    }

    /// Check if this node is pure.
    #[inline]
    pub fn is_pure(&self) -> bool {
        self.op.opcode.is_pure()
    }
}

// =============================================================================
// Dependency Graph
// =============================================================================

/// Dependency graph of one loop.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Arena<DepNode>,
    guards: Vec<NodeId>,
    memory_refs: Vec<(NodeId, MemoryRef)>,
    defs: FxHashMap<ValueId, NodeId>,
}

impl DependencyGraph {
    /// Build the graph of `lp`.
    pub fn build(lp: &Loop) -> Self {
        let indices = IndexAnalysis::analyze(lp);
        let mut nodes = Arena::with_capacity(lp.body.len() + 2);
        for (position, op) in lp.operations().enumerate() {
            nodes.alloc(DepNode::new(op.clone(), position));
        }
        let mut graph = DependencyGraph {
            nodes,
            guards: Vec::new(),
            memory_refs: Vec::new(),
            defs: FxHashMap::default(),
        };
        graph.wire(&indices);
        graph
    }

    fn wire(&mut self, indices: &IndexAnalysis) {
        let ids: Vec<NodeId> = self.nodes.ids().collect();
        let label = ids[0];
        for value in self.nodes[label].op.value_args().collect::<Vec<_>>() {
            self.defs.insert(value, label);
        }

        let mut last_effect: Option<NodeId> = None;
        let mut last_guard: Option<NodeId> = None;
        let mut last_ordinary_guard: Option<NodeId> = None;
        let mut header_guards = Vec::new();
        let mut effects = Vec::new();
        let mut ordinary_guards = Vec::new();
        let mut accesses: Vec<NodeId> = Vec::new();

        for &id in &ids[1..] {
            let op = self.nodes[id].op.clone();

            for value in op.value_args() {
                if let Some(def) = self.def_of(value) {
                    self.add_edge(def, id, EdgeKind::Data, Some(value));
                }
            }

            if op.is_guard() {
                self.guards.push(id);
                if op.resumes_at_loop_header() {
                    header_guards.push(id);
                } else {
                    for value in op.recovery_values() {
                        if let Some(def) = self.def_of(value) {
                            self.add_edge(def, id, EdgeKind::FailArg, Some(value));
                        }
                    }
                    if let Some(effect) = last_effect {
                        self.add_edge(effect, id, EdgeKind::FailArg, None);
                    }
                    if let Some(prev) = last_ordinary_guard {
                        self.add_edge(prev, id, EdgeKind::FailArg, None);
                    }
                    last_ordinary_guard = Some(id);
                    ordinary_guards.push(id);
                }
            }

            let is_access = op.opcode.is_load() || op.opcode.is_store();
            let is_call = op.opcode == OpCode::Call;
            if is_access || is_call {
                for guard in last_guard.into_iter().chain(last_ordinary_guard) {
                    self.add_edge(guard, id, EdgeKind::Control, None);
                }
            }

            if let Some(memref) = MemoryRef::of(&op, indices) {
                let conflicts: Vec<NodeId> = self
                    .memory_refs
                    .iter()
                    .filter(|(prev, prev_ref)| {
                        let prev_store = self.nodes[*prev].op.opcode.is_store();
                        (prev_store || op.opcode.is_store()) && prev_ref.alias(&memref)
                    })
                    .map(|(prev, _)| *prev)
                    .collect();
                for prev in conflicts {
                    self.add_edge(prev, id, EdgeKind::Memory, None);
                }
                self.memory_refs.push((id, memref));
            }

            if is_access || is_call {
                for &prev in &accesses {
                    let prev_call = self.nodes[prev].op.opcode == OpCode::Call;
                    if is_call || prev_call {
                        self.add_edge(prev, id, EdgeKind::Memory, None);
                    }
                }
                accesses.push(id);
            }

            if op.is_guard() {
                last_guard = Some(id);
            }
            if op.opcode.has_side_effect() {
                last_effect = Some(id);
                effects.push(id);
            }
            if let Some(result) = op.result {
                self.defs.insert(result, id);
            }
        }

        for &guard in &header_guards {
            for &target in effects.iter().chain(ordinary_guards.iter()) {
                self.add_edge(guard, target, EdgeKind::Control, None);
            }
        }
    }

    // =========================================================================
    // Edges
    // =========================================================================

    /// Add an edge, merging it into an existing one of the same kind.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind, value: Option<ValueId>) {
        if from == to {
            return;
        }
        let existing = self.nodes[from]
            .provides
            .iter()
            .position(|e| e.to == to && e.kind == kind);
        match existing {
            Some(i) => {
                if let Some(value) = value {
                    let out = &mut self.nodes[from].provides[i];
                    if !out.values.contains(&value) {
                        out.values.push(value);
                    }
                    if let Some(inc) = self.nodes[to]
                        .depends
                        .iter_mut()
                        .find(|e| e.to == from && e.kind == kind)
                    {
                        if !inc.values.contains(&value) {
                            inc.values.push(value);
                        }
                    }
                }
            }
            None => {
                let values: SmallVec<[ValueId; 2]> = value.into_iter().collect();
                self.nodes[from].provides.push(Edge {
                    to,
                    kind,
                    values: values.clone(),
                });
                self.nodes[to].depends.push(Edge {
                    to: from,
                    kind,
                    values,
                });
            }
        }
    }

    /// Remove the edge `from -> to` of the given kind.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.nodes[from]
            .provides
            .retain(|e| !(e.to == to && e.kind == kind));
        self.nodes[to]
            .depends
            .retain(|e| !(e.to == from && e.kind == kind));
    }

    /// Sources of incoming edges of `kind` into `to`.
    pub fn sources(&self, to: NodeId, kind: EdgeKind) -> Vec<NodeId> {
        self.nodes[to]
            .depends
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.to)
            .collect()
    }

    /// Values carried by all direct edges `from -> to`.
    pub fn because_of(&self, from: NodeId, to: NodeId) -> SmallVec<[ValueId; 2]> {
        let mut values = SmallVec::new();
        for edge in self.nodes[from].provides.iter().filter(|e| e.to == to) {
            for &v in &edge.values {
                if !values.contains(&v) {
                    values.push(v);
                }
            }
        }
        values
    }

    /// Check if there is a direct edge `from -> to`.
    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.nodes[from].provides.iter().any(|e| e.to == to)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Check if `to` is reachable from `from` along outgoing edges.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = BitSet::with_capacity(self.nodes.len());
        let mut stack = vec![from];
        visited.insert(from.as_usize());
        while let Some(node) = stack.pop() {
            for edge in &self.nodes[node].provides {
                if edge.to == to {
                    return true;
                }
                if visited.insert(edge.to.as_usize()) {
                    stack.push(edge.to);
                }
            }
        }
        false
    }

    /// No path connects the two nodes in either direction.
    pub fn independent(&self, a: NodeId, b: NodeId) -> bool {
        a != b && !self.reaches(a, b) && !self.reaches(b, a)
    }

    /// Pure nodes between `start` and `anchor`.
    ///
    /// Walks backwards from `start` (inclusive) and succeeds when every path
    /// ends at `anchor` or the label after passing only pure operations.
    pub fn pure_path_to(&self, start: NodeId, anchor: NodeId) -> Option<Vec<NodeId>> {
        let label = self.label();
        let mut path = Vec::new();
        let mut visited = BitSet::with_capacity(self.nodes.len());
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node == anchor || node == label || !visited.insert(node.as_usize()) {
                continue;
            }
            if !self.nodes[node].is_pure() {
                return None;
            }
            path.push(node);
            stack.extend(self.nodes[node].depends.iter().map(|e| e.to));
        }
        Some(path)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The label node.
    #[inline]
    pub fn label(&self) -> NodeId {
        Id::new(0)
    }

    /// The jump node.
    #[inline]
    pub fn jump(&self) -> NodeId {
        Id::new(self.nodes.len() as u32 - 1)
    }

    /// Body nodes in trace order.
    pub fn body(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..self.nodes.len() as u32 - 1).map(Id::new)
    }

    /// Guard nodes in trace order.
    pub fn guards(&self) -> &[NodeId] {
        &self.guards
    }

    /// Memory accesses and their references, in trace order.
    pub fn memory_refs(&self) -> &[(NodeId, MemoryRef)] {
        &self.memory_refs
    }

    /// Node defining `value`.
    pub fn def_of(&self, value: ValueId) -> Option<NodeId> {
        self.defs.get(&value).copied()
    }

    /// Get a node.
    #[inline]
    pub fn node(&self, id: NodeId) -> &DepNode {
        &self.nodes[id]
    }

    /// Get a node mutably.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut DepNode {
        &mut self.nodes[id]
    }

    /// Operation of a node.
    #[inline]
    pub fn op(&self, id: NodeId) -> &Operation {
        &self.nodes[id].op
    }

    /// `a` comes before `b` in the trace.
    #[inline]
    pub fn is_before(&self, a: NodeId, b: NodeId) -> bool {
        self.nodes[a].position < self.nodes[b].position
    }

    /// Number of nodes including label and jump.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
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

    fn id(n: u32) -> NodeId {
        Id::new(n)
    }

    /// label(i, a, b); x = load a[i]; store b[i] = x; i1 = i + 4;
    /// lt = i1 < 64; guard_true(lt) [i1, a, b]; jump(i1, a, b)
    fn copy_loop() -> Loop {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let src = b.input();
        let dst = b.input();
        let x = b.raw_load(ArrayDescr::int(4), src, i);
        b.raw_store(ArrayDescr::int(4), dst, i, x);
        let i1 = b.int_add(i, 4);
        let lt = b.int_lt(i1, 64);
        b.guard_true(lt, &[i1.into(), src.into(), dst.into()]);
        b.finish(&[i1.into(), src.into(), dst.into()])
    }

    #[test]
    fn test_data_edges_carry_values() {
        let graph = DependencyGraph::build(&copy_loop());
        assert_eq!(graph.len(), 7);
        // load (1) -> store (2) because of x
        assert!(graph.has_edge(id(1), id(2)));
        let x = graph.op(id(1)).result.unwrap();
        assert_eq!(graph.because_of(id(1), id(2)).as_slice(), &[x]);
        // label provides i to load, store and add
        assert!(graph.has_edge(graph.label(), id(3)));
    }

    #[test]
    fn test_guard_edges() {
        let graph = DependencyGraph::build(&copy_loop());
        let guard = id(5);
        assert_eq!(graph.guards(), &[guard]);
        // the store precedes the guard through a fail-arg edge
        assert!(graph.sources(guard, EdgeKind::FailArg).contains(&id(2)));
        // i1 is a fail argument and feeds the comparison
        assert!(graph.sources(guard, EdgeKind::FailArg).contains(&id(3)));
        assert!(graph.sources(guard, EdgeKind::Data).contains(&id(4)));
    }

    #[test]
    fn test_distinct_arrays_do_not_conflict() {
        let graph = DependencyGraph::build(&copy_loop());
        assert!(graph.sources(id(2), EdgeKind::Memory).is_empty());
    }

    #[test]
    fn test_same_array_store_load_conflict() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        b.raw_store(ArrayDescr::int(8), a, i, 1);
        b.raw_load(ArrayDescr::int(8), a, i);
        let lp = b.finish(&[i.into(), a.into()]);
        let graph = DependencyGraph::build(&lp);
        assert_eq!(graph.sources(id(2), EdgeKind::Memory), vec![id(1)]);
        assert!(!graph.independent(id(1), id(2)));
    }

    #[test]
    fn test_independent_and_reaches() {
        let graph = DependencyGraph::build(&copy_loop());
        assert!(graph.reaches(id(1), id(2)));
        assert!(graph.reaches(id(3), id(5)));
        assert!(!graph.reaches(id(5), id(3)));
        assert!(graph.independent(id(1), id(3)));
        assert!(!graph.independent(id(1), id(1)));
    }

    #[test]
    fn test_pure_path_to_label() {
        let graph = DependencyGraph::build(&copy_loop());
        let path = graph.pure_path_to(id(4), graph.label()).unwrap();
        assert_eq!(path.len(), 2);
        assert!(path.contains(&id(3)) && path.contains(&id(4)));
        // the store is not pure
        assert!(graph.pure_path_to(id(2), graph.label()).is_none());
    }

    #[test]
    fn test_remove_edge_updates_both_sides() {
        let mut graph = DependencyGraph::build(&copy_loop());
        graph.remove_edge(id(2), id(5), EdgeKind::FailArg);
        assert!(!graph.has_edge(id(2), id(5)));
        assert!(!graph.sources(id(5), EdgeKind::FailArg).contains(&id(2)));
    }
}
