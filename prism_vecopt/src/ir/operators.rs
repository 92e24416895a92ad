//! Opcode definitions for trace operations.
//!
//! Opcodes are organized by category:
//! - **Markers**: loop header (`Label`) and closing `Jump`
//! - **Arithmetic**: integer and float, binary and unary
//! - **Comparison**: integer relational tests feeding guards
//! - **Casts**: sign extension and int/float conversion
//! - **Memory**: raw loads and stores addressed by a byte offset
//! - **Guards**: runtime checks that leave the trace on failure
//! - **Vector**: the packed counterparts emitted by the vectorizer
//!
//! The instruction set is closed, so isomorphism of two operations is a plain
//! opcode comparison (`same_shape`) rather than a runtime type inspection.

use std::fmt;

// =============================================================================
// Operator Categories
// =============================================================================

/// Opcode category for fast dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCategory {
    /// Loop header and closing jump.
    Marker = 0,
    /// Integer or float arithmetic.
    Arithmetic = 1,
    /// Comparisons.
    Comparison = 2,
    /// Width and representation changes.
    Cast = 3,
    /// Raw memory accesses.
    Memory = 4,
    /// Guards.
    Guard = 5,
    /// Opaque calls.
    Call = 6,
    /// Packed operations.
    Vector = 7,
}

// =============================================================================
// Reduction Operators
// =============================================================================

/// Associative operator of an accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumOp {
    /// Running sum.
    Plus,
    /// Running product.
    Multiply,
}

impl AccumOp {
    /// Integer identity element.
    #[inline]
    pub const fn identity_int(self) -> i64 {
        match self {
            AccumOp::Plus => 0,
            AccumOp::Multiply => 1,
        }
    }

    /// Float identity element.
    #[inline]
    pub const fn identity_float(self) -> f64 {
        match self {
            AccumOp::Plus => 0.0,
            AccumOp::Multiply => 1.0,
        }
    }
}

impl fmt::Display for AccumOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccumOp::Plus => write!(f, "+"),
            AccumOp::Multiply => write!(f, "*"),
        }
    }
}

// =============================================================================
// Opcode
// =============================================================================

/// Trace operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // Markers
    /// Loop header; its arguments are the loop-carried values.
    Label,
    /// Back edge to the label; one argument per label argument.
    Jump,

    // Integer arithmetic
    /// a + b (wrapping)
    IntAdd,
    /// a - b (wrapping)
    IntSub,
    /// a * b (wrapping)
    IntMul,
    /// a & b
    IntAnd,
    /// a | b
    IntOr,
    /// a ^ b
    IntXor,

    // Comparisons
    /// a < b
    IntLt,
    /// a <= b
    IntLe,
    /// a == b
    IntEq,
    /// a != b
    IntNe,

    // Casts
    /// Sign extend the low `bytes` of a value: `int_signext(v, bytes)`.
    IntSignExt,
    /// Integer to double.
    CastIntToFloat,
    /// Double to integer (truncating).
    CastFloatToInt,

    // Float arithmetic
    /// a + b
    FloatAdd,
    /// a - b
    FloatSub,
    /// a * b
    FloatMul,
    /// a / b
    FloatTrueDiv,
    /// -a
    FloatNeg,
    /// |a|
    FloatAbs,

    // Memory
    /// `raw_load(base, byte_index)` through an array descriptor.
    RawLoad,
    /// `raw_store(base, byte_index, value)` through an array descriptor.
    RawStore,

    /// Opaque call with unknown effects.
    Call,

    // Guards
    /// Leave the trace unless the argument is non-zero.
    GuardTrue,
    /// Leave the trace unless the argument is zero.
    GuardFalse,
    /// Marks the loop entry; always passes.
    GuardEarlyExit,
    /// Invariant check recorded once per trace; always passes.
    GuardFutureCondition,
    /// Invalidation check recorded once per trace; always passes.
    GuardNotInvalidated,

    // Vector operations
    /// Load consecutive lanes starting at the byte index.
    VecRawLoad,
    /// Store consecutive lanes starting at the byte index.
    VecRawStore,
    /// Lane-wise integer add.
    VecIntAdd,
    /// Lane-wise integer subtract.
    VecIntSub,
    /// Lane-wise integer multiply.
    VecIntMul,
    /// Lane-wise and.
    VecIntAnd,
    /// Lane-wise or.
    VecIntOr,
    /// Lane-wise xor.
    VecIntXor,
    /// Lane-wise sign extension.
    VecIntSignExt,
    /// Lane-wise int to double.
    VecCastIntToFloat,
    /// Lane-wise double to int.
    VecCastFloatToInt,
    /// Lane-wise float add.
    VecFloatAdd,
    /// Lane-wise float subtract.
    VecFloatSub,
    /// Lane-wise float multiply.
    VecFloatMul,
    /// Lane-wise float divide.
    VecFloatTrueDiv,
    /// Lane-wise negation.
    VecFloatNeg,
    /// Lane-wise absolute value.
    VecFloatAbs,
    /// Broadcast one scalar into every lane.
    VecExpand,
    /// Build a vector from one scalar per lane.
    VecPack,
    /// Replace one lane: `vec_insert(vector, scalar, lane)`.
    VecInsert,
    /// Read one lane: `vec_extract(vector, lane)`.
    VecExtract,
}

impl OpCode {
    /// Get the category of this opcode.
    pub const fn category(self) -> OpCategory {
        use OpCode::*;
        match self {
            Label | Jump => OpCategory::Marker,
            IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor | FloatAdd | FloatSub
            | FloatMul | FloatTrueDiv | FloatNeg | FloatAbs => OpCategory::Arithmetic,
            IntLt | IntLe | IntEq | IntNe => OpCategory::Comparison,
            IntSignExt | CastIntToFloat | CastFloatToInt => OpCategory::Cast,
            RawLoad | RawStore => OpCategory::Memory,
            Call => OpCategory::Call,
            GuardTrue | GuardFalse | GuardEarlyExit | GuardFutureCondition
            | GuardNotInvalidated => OpCategory::Guard,
            _ => OpCategory::Vector,
        }
    }

    /// Check if this is a guard.
    #[inline]
    pub const fn is_guard(self) -> bool {
        matches!(self.category(), OpCategory::Guard)
    }

    /// Check if this opcode is a packed operation.
    #[inline]
    pub const fn is_vector(self) -> bool {
        matches!(self.category(), OpCategory::Vector)
    }

    /// Pure operations neither read nor write memory and cannot fail.
    pub const fn is_pure(self) -> bool {
        match self.category() {
            OpCategory::Arithmetic | OpCategory::Comparison | OpCategory::Cast => true,
            OpCategory::Vector => !matches!(self, OpCode::VecRawLoad | OpCode::VecRawStore),
            _ => false,
        }
    }

    /// Check if this opcode writes memory or has unknown effects.
    #[inline]
    pub const fn has_side_effect(self) -> bool {
        matches!(self, OpCode::RawStore | OpCode::VecRawStore | OpCode::Call)
    }

    /// Check if this opcode reads memory.
    #[inline]
    pub const fn is_load(self) -> bool {
        matches!(self, OpCode::RawLoad | OpCode::VecRawLoad)
    }

    /// Check if this opcode writes memory through an array descriptor.
    #[inline]
    pub const fn is_store(self) -> bool {
        matches!(self, OpCode::RawStore | OpCode::VecRawStore)
    }

    /// Scalar array access through a descriptor.
    #[inline]
    pub const fn is_primitive_array_access(self) -> bool {
        matches!(self, OpCode::RawLoad | OpCode::RawStore)
    }

    /// Check if this opcode defines a value.
    pub const fn has_result(self) -> bool {
        !matches!(
            self.category(),
            OpCategory::Marker | OpCategory::Guard
        ) && !self.is_store()
    }

    /// Check if this opcode produces a float.
    pub const fn returns_float(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            FloatAdd
                | FloatSub
                | FloatMul
                | FloatTrueDiv
                | FloatNeg
                | FloatAbs
                | CastIntToFloat
                | VecFloatAdd
                | VecFloatSub
                | VecFloatMul
                | VecFloatTrueDiv
                | VecFloatNeg
                | VecFloatAbs
                | VecCastIntToFloat
        )
    }

    /// Guards recorded once per trace; unrolling must not replicate them.
    #[inline]
    pub const fn is_unrolled_once(self) -> bool {
        matches!(
            self,
            OpCode::GuardEarlyExit | OpCode::GuardFutureCondition | OpCode::GuardNotInvalidated
        )
    }

    /// Whether operations of this kind can be fused into a vector operation.
    pub const fn is_vectorizable(self) -> bool {
        self.to_vector().is_some()
    }

    /// The packed counterpart of a scalar opcode.
    pub const fn to_vector(self) -> Option<OpCode> {
        use OpCode::*;
        Some(match self {
            RawLoad => VecRawLoad,
            RawStore => VecRawStore,
            IntAdd => VecIntAdd,
            IntSub => VecIntSub,
            IntMul => VecIntMul,
            IntAnd => VecIntAnd,
            IntOr => VecIntOr,
            IntXor => VecIntXor,
            IntSignExt => VecIntSignExt,
            CastIntToFloat => VecCastIntToFloat,
            CastFloatToInt => VecCastFloatToInt,
            FloatAdd => VecFloatAdd,
            FloatSub => VecFloatSub,
            FloatMul => VecFloatMul,
            FloatTrueDiv => VecFloatTrueDiv,
            FloatNeg => VecFloatNeg,
            FloatAbs => VecFloatAbs,
            _ => return None,
        })
    }

    /// The scalar opcode a lane-wise vector opcode applies per lane.
    pub const fn to_scalar(self) -> Option<OpCode> {
        use OpCode::*;
        Some(match self {
            VecIntAdd => IntAdd,
            VecIntSub => IntSub,
            VecIntMul => IntMul,
            VecIntAnd => IntAnd,
            VecIntOr => IntOr,
            VecIntXor => IntXor,
            VecIntSignExt => IntSignExt,
            VecCastIntToFloat => CastIntToFloat,
            VecCastFloatToInt => CastFloatToInt,
            VecFloatAdd => FloatAdd,
            VecFloatSub => FloatSub,
            VecFloatMul => FloatMul,
            VecFloatTrueDiv => FloatTrueDiv,
            VecFloatNeg => FloatNeg,
            VecFloatAbs => FloatAbs,
            _ => return None,
        })
    }

    /// Operator of a reduction this opcode can implement.
    pub const fn accum_operator(self) -> Option<AccumOp> {
        match self {
            OpCode::IntAdd | OpCode::FloatAdd => Some(AccumOp::Plus),
            OpCode::IntMul | OpCode::FloatMul => Some(AccumOp::Multiply),
            _ => None,
        }
    }

    /// Isomorphism: two operations can share a pack iff they have the same shape.
    #[inline]
    pub fn same_shape(self, other: OpCode) -> bool {
        self == other
    }

    /// Lower-case mnemonic.
    pub const fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Label => "label",
            Jump => "jump",
            IntAdd => "int_add",
            IntSub => "int_sub",
            IntMul => "int_mul",
            IntAnd => "int_and",
            IntOr => "int_or",
            IntXor => "int_xor",
            IntLt => "int_lt",
            IntLe => "int_le",
            IntEq => "int_eq",
            IntNe => "int_ne",
            IntSignExt => "int_signext",
            CastIntToFloat => "cast_int_to_float",
            CastFloatToInt => "cast_float_to_int",
            FloatAdd => "float_add",
            FloatSub => "float_sub",
            FloatMul => "float_mul",
            FloatTrueDiv => "float_truediv",
            FloatNeg => "float_neg",
            FloatAbs => "float_abs",
            RawLoad => "raw_load",
            RawStore => "raw_store",
            Call => "call",
            GuardTrue => "guard_true",
            GuardFalse => "guard_false",
            GuardEarlyExit => "guard_early_exit",
            GuardFutureCondition => "guard_future_condition",
            GuardNotInvalidated => "guard_not_invalidated",
            VecRawLoad => "vec_raw_load",
            VecRawStore => "vec_raw_store",
            VecIntAdd => "vec_int_add",
            VecIntSub => "vec_int_sub",
            VecIntMul => "vec_int_mul",
            VecIntAnd => "vec_int_and",
            VecIntOr => "vec_int_or",
            VecIntXor => "vec_int_xor",
            VecIntSignExt => "vec_int_signext",
            VecCastIntToFloat => "vec_cast_int_to_float",
            VecCastFloatToInt => "vec_cast_float_to_int",
            VecFloatAdd => "vec_float_add",
            VecFloatSub => "vec_float_sub",
            VecFloatMul => "vec_float_mul",
            VecFloatTrueDiv => "vec_float_truediv",
            VecFloatNeg => "vec_float_neg",
            VecFloatAbs => "vec_float_abs",
            VecExpand => "vec_expand",
            VecPack => "vec_pack",
            VecInsert => "vec_insert",
            VecExtract => "vec_extract",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
