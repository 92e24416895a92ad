//! Trace IR: the straight-line loop the vectorizer consumes and produces.
//!
//! A loop trace is a `Label` carrying the loop-carried values, a body of
//! SSA operations, and a closing `Jump` that passes the next iteration's
//! values back to the label. Every value is defined exactly once, either as a
//! label argument or as an operation result.
//!
//! Guards carry the state needed to leave the trace: a descriptor naming the
//! recovery strategy, the list of fail arguments and an opaque snapshot.

use super::operators::OpCode;
use super::types::{ArrayDescr, Datatype, ElemType, WORD_SIZE};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

// =============================================================================
// Values
// =============================================================================

/// SSA value identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Hands out value ids that are not yet used in a loop.
#[derive(Debug, Clone)]
pub struct ValueGen {
    next: u32,
}

impl ValueGen {
    /// Start numbering at `next`.
    pub fn new(next: u32) -> Self {
        ValueGen { next }
    }

    /// Generator producing ids above every id mentioned in `lp`.
    pub fn after(lp: &Loop) -> Self {
        let next = lp.max_value_id().map_or(0, |v| v.0 + 1);
        ValueGen { next }
    }

    /// Allocate a fresh value id.
    #[inline]
    pub fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        id
    }

    /// Keep future ids above `seen`.
    pub fn observe(&mut self, seen: ValueId) {
        if seen.0 >= self.next {
            self.next = seen.0 + 1;
        }
    }
}

/// Operation argument: a value or a constant.
#[derive(Debug, Clone, Copy)]
pub enum Arg {
    /// An SSA value.
    Value(ValueId),
    /// Integer constant.
    Int(i64),
    /// Float constant.
    Float(f64),
}

impl Arg {
    /// The value this argument names, if it is not a constant.
    #[inline]
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Arg::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer constant, if this is one.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(c) => Some(*c),
            _ => None,
        }
    }

    /// Check if this is a constant.
    #[inline]
    pub fn is_const(&self) -> bool {
        !matches!(self, Arg::Value(_))
    }

    /// Check if this argument names `value`.
    #[inline]
    pub fn is(&self, value: ValueId) -> bool {
        self.as_value() == Some(value)
    }
}

impl From<ValueId> for Arg {
    fn from(value: ValueId) -> Self {
        Arg::Value(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl PartialEq for Arg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Arg::Value(a), Arg::Value(b)) => a == b,
            (Arg::Int(a), Arg::Int(b)) => a == b,
            (Arg::Float(a), Arg::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Arg {}

impl Hash for Arg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Arg::Value(v) => v.hash(state),
            Arg::Int(c) => c.hash(state),
            Arg::Float(c) => c.to_bits().hash(state),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => write!(f, "{}", v),
            Arg::Int(c) => write!(f, "{}", c),
            Arg::Float(c) => write!(f, "{:?}", c),
        }
    }
}

// =============================================================================
// Vectorizability
// =============================================================================

/// Whether an operation may take part in a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vectorizability {
    /// Never packed.
    Ineligible,
    /// Scalar operation with a vector counterpart.
    Scalar,
    /// Packed operation over this many lanes.
    Vector(usize),
}

impl Vectorizability {
    /// Default tag of a freshly created operation.
    pub const fn for_opcode(opcode: OpCode) -> Self {
        if opcode.is_vectorizable() {
            Vectorizability::Scalar
        } else {
            Vectorizability::Ineligible
        }
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Recovery strategy of a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescrKind {
    /// Resume the interpreter at the guard's own position.
    ResumeGuard,
    /// Resume at the loop header with the header's values.
    ResumeAtLoopHeader,
    /// Like `ResumeAtLoopHeader`, and a scalar loop version is compiled as
    /// the resume target.
    CompileLoopVersion,
}

/// Guard descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardDescr {
    /// Unique descriptor id.
    pub id: u32,
    /// How execution resumes when the guard fails.
    pub kind: DescrKind,
    /// Interpreter position to resume at.
    pub resume_pc: u32,
}

impl GuardDescr {
    /// Check if failing this guard restarts the current iteration.
    #[inline]
    pub fn resumes_at_loop_header(&self) -> bool {
        matches!(
            self.kind,
            DescrKind::ResumeAtLoopHeader | DescrKind::CompileLoopVersion
        )
    }
}

/// Frames of live values needed to rebuild interpreter state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Innermost frame last.
    pub frames: Vec<Vec<Arg>>,
}

impl Snapshot {
    /// Iterate over all values mentioned by the snapshot.
    pub fn values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.frames
            .iter()
            .flat_map(|frame| frame.iter().filter_map(Arg::as_value))
    }
}

/// Guard-only state attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardInfo {
    /// Recovery descriptor.
    pub descr: GuardDescr,
    /// Values handed to the recovery code.
    pub fail_args: Vec<Arg>,
    /// Resume snapshot.
    pub snapshot: Snapshot,
}

// =============================================================================
// Operation
// =============================================================================

/// A single trace operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Operation kind.
    pub opcode: OpCode,
    /// Defined value, if the opcode produces one.
    pub result: Option<ValueId>,
    /// Ordered arguments.
    pub args: SmallVec<[Arg; 4]>,
    /// Element descriptor of memory accesses.
    pub descr: Option<ArrayDescr>,
    /// Pack eligibility.
    pub vector: Vectorizability,
    /// Recovery state of guards.
    pub guard: Option<Box<GuardInfo>>,
}

impl Operation {
    /// Create an operation with the default vectorizability of its opcode.
    pub fn new(opcode: OpCode, result: Option<ValueId>, args: &[Arg]) -> Self {
        Operation {
            opcode,
            result,
            args: SmallVec::from_slice(args),
            descr: None,
            vector: Vectorizability::for_opcode(opcode),
            guard: None,
        }
    }

    /// Attach an array descriptor.
    pub fn with_descr(mut self, descr: ArrayDescr) -> Self {
        self.descr = Some(descr);
        self
    }

    /// Attach guard state.
    pub fn with_guard(mut self, guard: GuardInfo) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Mark this operation as packed over `lanes` lanes.
    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.vector = Vectorizability::Vector(lanes);
        self
    }

    /// Number of lanes the operation works on.
    #[inline]
    pub fn lanes(&self) -> usize {
        match self.vector {
            Vectorizability::Vector(lanes) => lanes,
            _ => 1,
        }
    }

    /// Get the argument at `index`.
    #[inline]
    pub fn arg(&self, index: usize) -> Option<Arg> {
        self.args.get(index).copied()
    }

    /// Values read through regular arguments.
    pub fn value_args(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.args.iter().filter_map(Arg::as_value)
    }

    /// Values kept alive by the guard's fail arguments and snapshot.
    pub fn recovery_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.guard.iter().flat_map(|g| {
            g.fail_args
                .iter()
                .filter_map(Arg::as_value)
                .chain(g.snapshot.values())
        })
    }

    /// Every value the operation mentions.
    pub fn used_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.value_args().chain(self.recovery_values())
    }

    /// Check if the operation is a guard.
    #[inline]
    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    /// Check if this guard restarts the iteration at the loop header.
    #[inline]
    pub fn resumes_at_loop_header(&self) -> bool {
        self.guard
            .as_ref()
            .is_some_and(|g| g.descr.resumes_at_loop_header())
    }

    /// Copy with a fresh result identity.
    pub fn clone_fresh(&self, gen: &mut ValueGen) -> Operation {
        let mut op = self.clone();
        if op.result.is_some() {
            op.result = Some(gen.fresh());
        }
        op
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}(", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")?;
        if let Some(descr) = &self.descr {
            write!(f, " <{}>", descr.elem_type())?;
        }
        if let Vectorizability::Vector(lanes) = self.vector {
            write!(f, " x{}", lanes)?;
        }
        if let Some(guard) = &self.guard {
            write!(f, " [")?;
            for (i, arg) in guard.fail_args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Structural defect of a loop trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// The header is not a `Label`.
    MissingLabel,
    /// The closer is not a `Jump`.
    MissingJump,
    /// Label and jump disagree on the number of loop-carried values.
    ArityMismatch { label: usize, jump: usize },
    /// A label argument is a constant.
    ConstantLabelArg(usize),
    /// A value is defined twice.
    Redefined(ValueId),
    /// A marker appears inside the body.
    MarkerInBody(usize),
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::MissingLabel => write!(f, "loop does not start with a label"),
            ShapeError::MissingJump => write!(f, "loop does not end with a jump"),
            ShapeError::ArityMismatch { label, jump } => {
                write!(f, "label has {} arguments, jump has {}", label, jump)
            }
            ShapeError::ConstantLabelArg(i) => write!(f, "label argument {} is a constant", i),
            ShapeError::Redefined(v) => write!(f, "value {} defined twice", v),
            ShapeError::MarkerInBody(i) => write!(f, "marker at body position {}", i),
        }
    }
}

impl std::error::Error for ShapeError {}

/// A loop trace: label, body and closing jump.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// The `Label` operation.
    pub header: Operation,
    /// Straight-line body.
    pub body: Vec<Operation>,
    /// The closing `Jump`.
    pub closer: Operation,
}

impl Loop {
    /// Assemble a loop from label arguments, body and jump arguments.
    pub fn new(label_args: &[ValueId], body: Vec<Operation>, jump_args: &[Arg]) -> Self {
        let label: SmallVec<[Arg; 4]> = label_args.iter().map(|&v| Arg::Value(v)).collect();
        Loop {
            header: Operation::new(OpCode::Label, None, &label),
            body,
            closer: Operation::new(OpCode::Jump, None, jump_args),
        }
    }

    /// Validate the structural invariants the vectorizer relies on.
    pub fn check_shape(&self) -> Result<(), ShapeError> {
        if self.header.opcode != OpCode::Label {
            return Err(ShapeError::MissingLabel);
        }
        if self.closer.opcode != OpCode::Jump {
            return Err(ShapeError::MissingJump);
        }
        if self.header.args.len() != self.closer.args.len() {
            return Err(ShapeError::ArityMismatch {
                label: self.header.args.len(),
                jump: self.closer.args.len(),
            });
        }
        let mut defined = FxHashSet::default();
        for (i, arg) in self.header.args.iter().enumerate() {
            let value = arg.as_value().ok_or(ShapeError::ConstantLabelArg(i))?;
            if !defined.insert(value) {
                return Err(ShapeError::Redefined(value));
            }
        }
        for (i, op) in self.body.iter().enumerate() {
            if matches!(op.opcode, OpCode::Label | OpCode::Jump) {
                return Err(ShapeError::MarkerInBody(i));
            }
            if let Some(result) = op.result {
                if !defined.insert(result) {
                    return Err(ShapeError::Redefined(result));
                }
            }
        }
        Ok(())
    }

    /// Loop-carried values named by the label.
    pub fn header_values(&self) -> Vec<ValueId> {
        self.header.value_args().collect()
    }

    /// Number of body operations.
    #[inline]
    pub fn op_count(&self) -> usize {
        self.body.len()
    }

    /// Largest value id mentioned anywhere in the loop.
    pub fn max_value_id(&self) -> Option<ValueId> {
        std::iter::once(&self.header)
            .chain(self.body.iter())
            .chain(std::iter::once(&self.closer))
            .flat_map(|op| op.result.into_iter().chain(op.used_values()))
            .max()
    }

    /// Iterate over header, body and closer in order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        std::iter::once(&self.header)
            .chain(self.body.iter())
            .chain(std::iter::once(&self.closer))
    }

    /// Infer the element type of every value.
    ///
    /// Loads take their width from the array descriptor, integer arithmetic
    /// takes the widest of its value operands, sign extension its target
    /// width. Label arguments are words unless the jump feeds them a float.
    pub fn value_types(&self) -> FxHashMap<ValueId, ElemType> {
        let mut types = FxHashMap::default();
        for value in self.header.value_args() {
            types.insert(value, ElemType::WORD);
        }
        for op in &self.body {
            if let Some(result) = op.result {
                let ty = result_type(op, &types);
                types.insert(result, ty);
            }
        }
        let refined: Vec<(ValueId, ElemType)> = self
            .header
            .args
            .iter()
            .zip(self.closer.args.iter())
            .filter_map(|(label, jump)| {
                let label = label.as_value()?;
                let ty = match jump {
                    Arg::Float(_) => ElemType::FLOAT,
                    Arg::Value(v) => *types.get(v)?,
                    Arg::Int(_) => return None,
                };
                ty.is_float().then_some((label, ElemType::FLOAT))
            })
            .collect();
        if refined.is_empty() {
            return types;
        }
        for (value, ty) in refined {
            types.insert(value, ty);
        }
        // Re-derive body types that read refined label values.
        for op in &self.body {
            if let Some(result) = op.result {
                let ty = result_type(op, &types);
                types.insert(result, ty);
            }
        }
        types
    }
}

/// Element type of an operation's result given the types of its operands.
pub fn result_type(op: &Operation, types: &FxHashMap<ValueId, ElemType>) -> ElemType {
    let arg_type = |index: usize| -> Option<ElemType> {
        match op.args.get(index)? {
            Arg::Value(v) => types.get(v).copied(),
            Arg::Float(_) => Some(ElemType::FLOAT),
            Arg::Int(_) => None,
        }
    };
    let opcode = op.opcode.to_scalar().unwrap_or(op.opcode);
    match opcode {
        OpCode::RawLoad | OpCode::VecRawLoad => op
            .descr
            .map(|d| d.elem_type())
            .unwrap_or(ElemType::WORD),
        OpCode::IntSignExt => {
            let bytes = op
                .arg(1)
                .and_then(|a| a.as_int())
                .map_or(WORD_SIZE, |b| b as usize);
            ElemType::int(bytes, true)
        }
        OpCode::IntAdd
        | OpCode::IntSub
        | OpCode::IntMul
        | OpCode::IntAnd
        | OpCode::IntOr
        | OpCode::IntXor => {
            let widest = op
                .args
                .iter()
                .filter_map(|a| a.as_value())
                .filter_map(|v| types.get(&v))
                .filter(|t| t.datatype == Datatype::Int)
                .max_by_key(|t| t.bytes)
                .copied();
            widest.unwrap_or(ElemType::WORD)
        }
        OpCode::IntLt | OpCode::IntLe | OpCode::IntEq | OpCode::IntNe => ElemType::WORD,
        OpCode::CastFloatToInt | OpCode::Call => ElemType::WORD,
        OpCode::VecExpand | OpCode::VecPack => arg_type(0).unwrap_or(ElemType::WORD),
        OpCode::VecInsert | OpCode::VecExtract => arg_type(0).unwrap_or(ElemType::WORD),
        _ if opcode.returns_float() => ElemType::FLOAT,
        _ if opcode.has_result() => ElemType::WORD,
        _ => ElemType::VOID,
    }
}

impl fmt::Display for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;
        for op in &self.body {
            writeln!(f, "    {}", op)?;
        }
        write!(f, "{}", self.closer)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u32) -> ValueId {
        ValueId(n)
    }

    fn counting_loop() -> Loop {
        let body = vec![
            Operation::new(OpCode::IntAdd, Some(v(1)), &[v(0).into(), Arg::Int(1)]),
            Operation::new(OpCode::IntLt, Some(v(2)), &[v(1).into(), Arg::Int(10)]),
        ];
        Loop::new(&[v(0)], body, &[v(1).into()])
    }

    #[test]
    fn test_check_shape_accepts_well_formed_loop() {
        assert_eq!(counting_loop().check_shape(), Ok(()));
    }

    #[test]
    fn test_check_shape_rejects_arity_mismatch() {
        let mut lp = counting_loop();
        lp.closer.args.push(Arg::Int(0));
        assert_eq!(
            lp.check_shape(),
            Err(ShapeError::ArityMismatch { label: 1, jump: 2 })
        );
    }

    #[test]
    fn test_check_shape_rejects_redefinition() {
        let mut lp = counting_loop();
        lp.body[1].result = Some(v(1));
        assert_eq!(lp.check_shape(), Err(ShapeError::Redefined(v(1))));
    }

    #[test]
    fn test_value_gen_starts_above_loop() {
        let lp = counting_loop();
        let mut gen = ValueGen::after(&lp);
        assert_eq!(gen.fresh(), v(3));
        let op = lp.body[0].clone_fresh(&mut gen);
        assert_eq!(op.result, Some(v(4)));
        assert_eq!(op.args, lp.body[0].args);
    }

    #[test]
    fn test_float_constant_args_compare_by_bits() {
        assert_eq!(Arg::Float(1.5), Arg::Float(1.5));
        assert_ne!(Arg::Float(0.0), Arg::Float(-0.0));
        assert_ne!(Arg::Int(1), Arg::Float(1.0));
    }

    #[test]
    fn test_value_types_follow_loads_and_label_floats() {
        let body = vec![
            Operation::new(OpCode::RawLoad, Some(v(3)), &[v(1).into(), v(0).into()])
                .with_descr(ArrayDescr::int(4)),
            Operation::new(OpCode::IntAdd, Some(v(4)), &[v(3).into(), Arg::Int(1)]),
            Operation::new(OpCode::FloatAdd, Some(v(5)), &[v(2).into(), Arg::Float(1.0)]),
        ];
        let lp = Loop::new(
            &[v(0), v(1), v(2)],
            body,
            &[v(0).into(), v(1).into(), v(5).into()],
        );
        let types = lp.value_types();
        assert_eq!(types[&v(3)].bytes, 4);
        assert_eq!(types[&v(4)].bytes, 4);
        assert!(types[&v(2)].is_float());
        assert_eq!(types[&v(0)], ElemType::WORD);
    }

    #[test]
    fn test_display_lists_fail_args() {
        let guard = Operation::new(OpCode::GuardTrue, None, &[v(2).into()]).with_guard(GuardInfo {
            descr: GuardDescr {
                id: 1,
                kind: DescrKind::ResumeGuard,
                resume_pc: 0,
            },
            fail_args: vec![v(1).into()],
            snapshot: Snapshot::default(),
        });
        assert_eq!(guard.to_string(), "guard_true(v2) [v1]");
    }
}
