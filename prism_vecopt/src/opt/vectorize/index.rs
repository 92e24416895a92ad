//! Index variables and memory references.
//!
//! The trace is in SSA form, so an array index is just a value. Walking back
//! through additions, subtractions and multiplications by constants turns
//! each index into a linear form `coefficient * var + constant` over some
//! root value. After unrolling, `i1 = i0 + 1` and `off1 = i1 * 4` resolve to
//! `4 * i0 + 4`, which is what makes neighbouring accesses recognizable.

use crate::ir::operators::OpCode;
use crate::ir::trace::{Arg, Loop, Operation, ValueId};
use crate::ir::types::ArrayDescr;
use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Index Variable
// =============================================================================

/// Linear form `coefficient * var + constant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexVar {
    /// Root value.
    pub var: ValueId,
    /// Multiplier of the root.
    pub coefficient: i64,
    /// Added constant.
    pub constant: i64,
}

impl IndexVar {
    /// The identity form of `var`.
    pub fn new(var: ValueId) -> Self {
        IndexVar {
            var,
            coefficient: 1,
            constant: 0,
        }
    }

    /// `self + c`
    pub fn add(self, c: i64) -> Self {
        IndexVar {
            constant: self.constant.wrapping_add(c),
            ..self
        }
    }

    /// `self * c`
    pub fn mul(self, c: i64) -> Self {
        IndexVar {
            coefficient: self.coefficient.wrapping_mul(c),
            constant: self.constant.wrapping_mul(c),
            ..self
        }
    }

    /// `c - self`
    pub fn sub_from(self, c: i64) -> Self {
        IndexVar {
            coefficient: self.coefficient.wrapping_neg(),
            constant: c.wrapping_sub(self.constant),
            ..self
        }
    }

    /// Check if both forms scale the same root the same way.
    #[inline]
    pub fn same_variable(&self, other: &IndexVar) -> bool {
        self.var == other.var && self.coefficient == other.coefficient
    }

    /// `other - self`, when both share variable and coefficient.
    pub fn distance_to(&self, other: &IndexVar) -> Option<i64> {
        self.same_variable(other)
            .then(|| other.constant.wrapping_sub(self.constant))
    }
}

impl fmt::Display for IndexVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}+{}", self.coefficient, self.var, self.constant)
    }
}

// =============================================================================
// Index Analysis
// =============================================================================

/// Linear forms of every value defined in a loop.
#[derive(Debug, Clone, Default)]
pub struct IndexAnalysis {
    vars: FxHashMap<ValueId, IndexVar>,
}

impl IndexAnalysis {
    /// Resolve the linear form of each body value.
    pub fn analyze(lp: &Loop) -> Self {
        let mut analysis = IndexAnalysis::default();
        for op in &lp.body {
            analysis.visit(op);
        }
        analysis
    }

    fn visit(&mut self, op: &Operation) {
        let Some(result) = op.result else {
            return;
        };
        let (Some(a), Some(b)) = (op.arg(0), op.arg(1)) else {
            return;
        };
        let derived = match (op.opcode, a, b) {
            (OpCode::IntAdd, Arg::Value(v), Arg::Int(c))
            | (OpCode::IntAdd, Arg::Int(c), Arg::Value(v)) => Some(self.of_value(v).add(c)),
            (OpCode::IntSub, Arg::Value(v), Arg::Int(c)) => {
                Some(self.of_value(v).add(c.wrapping_neg()))
            }
            (OpCode::IntSub, Arg::Int(c), Arg::Value(v)) => Some(self.of_value(v).sub_from(c)),
            (OpCode::IntMul, Arg::Value(v), Arg::Int(c))
            | (OpCode::IntMul, Arg::Int(c), Arg::Value(v)) => Some(self.of_value(v).mul(c)),
            _ => None,
        };
        if let Some(var) = derived {
            self.vars.insert(result, var);
        }
    }

    /// Linear form of a value; values without a derivation are their own root.
    pub fn of_value(&self, value: ValueId) -> IndexVar {
        self.vars
            .get(&value)
            .copied()
            .unwrap_or_else(|| IndexVar::new(value))
    }

    /// Linear form of an argument; constants have none.
    pub fn of_arg(&self, arg: Arg) -> Option<IndexVar> {
        arg.as_value().map(|v| self.of_value(v))
    }
}

// =============================================================================
// Memory Reference
// =============================================================================

/// The memory touched by one array access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryRef {
    /// Array base.
    pub base: Arg,
    /// Element descriptor.
    pub descr: ArrayDescr,
    /// Byte offset, if it is a linear form.
    pub index: Option<IndexVar>,
    /// Bytes covered by the access.
    pub width: usize,
}

impl MemoryRef {
    /// Describe the access performed by `op`, if it is one.
    pub fn of(op: &Operation, indices: &IndexAnalysis) -> Option<MemoryRef> {
        if !(op.opcode.is_load() || op.opcode.is_store()) {
            return None;
        }
        let descr = op.descr?;
        Some(MemoryRef {
            base: op.arg(0)?,
            descr,
            index: indices.of_arg(op.arg(1)?),
            width: descr.item_size * op.lanes(),
        })
    }

    /// `other` addresses the element right after `self`.
    pub fn is_adjacent_after(&self, other: &MemoryRef) -> bool {
        if self.base != other.base || self.descr != other.descr {
            return false;
        }
        match (&self.index, &other.index) {
            (Some(a), Some(b)) => a.distance_to(b) == Some(self.descr.item_size as i64),
            _ => false,
        }
    }

    /// Whether the two accesses may touch the same bytes.
    ///
    /// Distinct bases are distinct arrays. On the same base, accesses only
    /// provably miss each other when their offsets share a variable and the
    /// byte ranges do not overlap.
    pub fn alias(&self, other: &MemoryRef) -> bool {
        if self.base != other.base {
            return false;
        }
        match (&self.index, &other.index) {
            (Some(a), Some(b)) => match a.distance_to(b) {
                Some(d) => d < self.width as i64 && -d < other.width as i64,
                None => true,
            },
            _ => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::TraceBuilder;

    fn access(var: ValueId, coefficient: i64, constant: i64) -> MemoryRef {
        MemoryRef {
            base: Arg::Value(ValueId(100)),
            descr: ArrayDescr::int(4),
            index: Some(IndexVar {
                var,
                coefficient,
                constant,
            }),
            width: 4,
        }
    }

    #[test]
    fn test_adjacency_by_element_size() {
        let i = ValueId(0);
        assert!(access(i, 4, 0).is_adjacent_after(&access(i, 4, 4)));
        assert!(!access(i, 4, 0).is_adjacent_after(&access(i, 4, 8)));
        assert!(!access(i, 4, 4).is_adjacent_after(&access(i, 4, 0)));
        assert!(!access(i, 4, 0).is_adjacent_after(&access(i, 8, 4)));
    }

    #[test]
    fn test_adjacency_requires_same_base() {
        let i = ValueId(0);
        let mut other = access(i, 4, 4);
        other.base = Arg::Value(ValueId(101));
        assert!(!access(i, 4, 0).is_adjacent_after(&other));
    }

    #[test]
    fn test_alias() {
        let i = ValueId(0);
        assert!(access(i, 4, 0).alias(&access(i, 4, 0)));
        assert!(!access(i, 4, 0).alias(&access(i, 4, 4)));
        assert!(access(i, 4, 0).alias(&access(i, 8, 4)));
        let mut wide = access(i, 4, 0);
        wide.width = 16;
        assert!(wide.alias(&access(i, 4, 12)));
        assert!(!wide.alias(&access(i, 4, 16)));
        let mut other = access(i, 4, 0);
        other.base = Arg::Value(ValueId(7));
        assert!(!access(i, 4, 0).alias(&other));
    }

    #[test]
    fn test_analysis_follows_unrolled_index_chain() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let off0 = b.int_mul(i, 4);
        let i1 = b.int_add(i, 1);
        let off1 = b.int_mul(i1, 4);
        let back = b.int_sub(off1, 2);
        let lp = b.finish(&[i1.into()]);
        let analysis = IndexAnalysis::analyze(&lp);

        assert_eq!(analysis.of_value(off0), IndexVar { var: i, coefficient: 4, constant: 0 });
        assert_eq!(analysis.of_value(off1), IndexVar { var: i, coefficient: 4, constant: 4 });
        assert_eq!(analysis.of_value(back).constant, 2);
        assert_eq!(analysis.of_value(i), IndexVar::new(i));
    }
}
