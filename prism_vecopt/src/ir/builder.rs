//! Trace builder: convenient construction of loop traces.
//!
//! The recorder upstream of the vectorizer produces traces operation by
//! operation; the builder mirrors that interface so tests, benchmarks and
//! embedders can assemble loops without hand-numbering values:
//!
//! ```text
//! let mut b = TraceBuilder::new();
//! let i = b.input();
//! let i1 = b.int_add(i, 1);
//! let lt = b.int_lt(i1, 100);
//! b.guard_true(lt, &[i1.into()]);
//! let lp = b.finish(&[i1.into()]);
//! ```

use super::operators::OpCode;
use super::trace::{
    Arg, DescrKind, GuardDescr, GuardInfo, Loop, Operation, Snapshot, ValueGen, ValueId,
};
use super::types::ArrayDescr;

// =============================================================================
// Trace Builder
// =============================================================================

/// Builder for loop traces.
#[derive(Debug)]
pub struct TraceBuilder {
    /// Label arguments in declaration order.
    inputs: Vec<ValueId>,
    /// Body operations recorded so far.
    body: Vec<Operation>,
    /// Value numbering.
    values: ValueGen,
    /// Next guard descriptor id.
    next_guard: u32,
}

impl TraceBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        TraceBuilder {
            inputs: Vec::new(),
            body: Vec::new(),
            values: ValueGen::new(0),
            next_guard: 0,
        }
    }

    /// Declare a loop-carried value.
    pub fn input(&mut self) -> ValueId {
        let value = self.values.fresh();
        self.inputs.push(value);
        value
    }

    /// Close the loop with the given jump arguments.
    pub fn finish(self, jump_args: &[Arg]) -> Loop {
        Loop::new(&self.inputs, self.body, jump_args)
    }

    /// Number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Check if no operation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Record an arbitrary operation defining a fresh value.
    pub fn emit(&mut self, opcode: OpCode, args: &[Arg]) -> ValueId {
        let result = self.values.fresh();
        self.body.push(Operation::new(opcode, Some(result), args));
        result
    }

    /// Record an operation without a result.
    pub fn emit_void(&mut self, op: Operation) {
        self.body.push(op);
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Integer add.
    pub fn int_add(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntAdd, &[lhs.into(), rhs.into()])
    }

    /// Integer subtract.
    pub fn int_sub(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntSub, &[lhs.into(), rhs.into()])
    }

    /// Integer multiply.
    pub fn int_mul(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntMul, &[lhs.into(), rhs.into()])
    }

    /// Bitwise and.
    pub fn int_and(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntAnd, &[lhs.into(), rhs.into()])
    }

    /// Integer less-than.
    pub fn int_lt(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntLt, &[lhs.into(), rhs.into()])
    }

    /// Integer less-or-equal.
    pub fn int_le(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::IntLe, &[lhs.into(), rhs.into()])
    }

    /// Sign extend the low `bytes` of a value.
    pub fn int_signext(&mut self, value: impl Into<Arg>, bytes: i64) -> ValueId {
        self.emit(OpCode::IntSignExt, &[value.into(), Arg::Int(bytes)])
    }

    /// Float add.
    pub fn float_add(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::FloatAdd, &[lhs.into(), rhs.into()])
    }

    /// Float multiply.
    pub fn float_mul(&mut self, lhs: impl Into<Arg>, rhs: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::FloatMul, &[lhs.into(), rhs.into()])
    }

    /// Float negation.
    pub fn float_neg(&mut self, value: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::FloatNeg, &[value.into()])
    }

    /// Integer to double conversion.
    pub fn cast_int_to_float(&mut self, value: impl Into<Arg>) -> ValueId {
        self.emit(OpCode::CastIntToFloat, &[value.into()])
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Load the element at `byte_index` of the array at `base`.
    pub fn raw_load(
        &mut self,
        descr: ArrayDescr,
        base: impl Into<Arg>,
        byte_index: impl Into<Arg>,
    ) -> ValueId {
        let result = self.values.fresh();
        self.body.push(
            Operation::new(OpCode::RawLoad, Some(result), &[base.into(), byte_index.into()])
                .with_descr(descr),
        );
        result
    }

    /// Store `value` at `byte_index` of the array at `base`.
    pub fn raw_store(
        &mut self,
        descr: ArrayDescr,
        base: impl Into<Arg>,
        byte_index: impl Into<Arg>,
        value: impl Into<Arg>,
    ) {
        self.body.push(
            Operation::new(
                OpCode::RawStore,
                None,
                &[base.into(), byte_index.into(), value.into()],
            )
            .with_descr(descr),
        );
    }

    /// Opaque call.
    pub fn call(&mut self, args: &[Arg]) -> ValueId {
        self.emit(OpCode::Call, args)
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Record a guard of the given kind with a fresh descriptor.
    pub fn guard(&mut self, opcode: OpCode, args: &[Arg], fail_args: &[Arg]) {
        let descr = GuardDescr {
            id: self.next_guard,
            kind: DescrKind::ResumeGuard,
            resume_pc: self.body.len() as u32,
        };
        self.next_guard += 1;
        let info = GuardInfo {
            descr,
            fail_args: fail_args.to_vec(),
            snapshot: Snapshot {
                frames: vec![fail_args.to_vec()],
            },
        };
        self.body
            .push(Operation::new(opcode, None, args).with_guard(info));
    }

    /// Leave the trace unless `cond` holds.
    pub fn guard_true(&mut self, cond: impl Into<Arg>, fail_args: &[Arg]) {
        self.guard(OpCode::GuardTrue, &[cond.into()], fail_args);
    }

    /// Leave the trace if `cond` holds.
    pub fn guard_false(&mut self, cond: impl Into<Arg>, fail_args: &[Arg]) {
        self.guard(OpCode::GuardFalse, &[cond.into()], fail_args);
    }

    /// Loop entry marker guard.
    pub fn guard_early_exit(&mut self, fail_args: &[Arg]) {
        self.guard(OpCode::GuardEarlyExit, &[], fail_args);
    }

    /// Invalidation check.
    pub fn guard_not_invalidated(&mut self, fail_args: &[Arg]) {
        self.guard(OpCode::GuardNotInvalidated, &[], fail_args);
    }
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_numbers_values_in_order() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let n = b.input();
        let i1 = b.int_add(i, 1);
        let lt = b.int_lt(i1, n);
        b.guard_true(lt, &[i1.into(), n.into()]);
        let lp = b.finish(&[i1.into(), n.into()]);

        assert_eq!(lp.header_values(), vec![ValueId(0), ValueId(1)]);
        assert_eq!(i1, ValueId(2));
        assert_eq!(lp.op_count(), 3);
        assert!(lp.check_shape().is_ok());
        let guard = lp.body[2].guard.as_ref().unwrap();
        assert_eq!(guard.descr.kind, DescrKind::ResumeGuard);
        assert_eq!(guard.fail_args, vec![Arg::Value(i1), Arg::Value(n)]);
    }

    #[test]
    fn test_builder_attaches_descriptors() {
        let mut b = TraceBuilder::new();
        let i = b.input();
        let a = b.input();
        let x = b.raw_load(ArrayDescr::int(2), a, i);
        b.raw_store(ArrayDescr::int(2), a, i, x);
        let lp = b.finish(&[i.into(), a.into()]);

        assert_eq!(lp.body[0].descr, Some(ArrayDescr::int(2)));
        assert_eq!(lp.body[1].descr, Some(ArrayDescr::int(2)));
        assert_eq!(lp.body[1].result, None);
    }
}
