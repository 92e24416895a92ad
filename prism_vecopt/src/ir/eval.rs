//! Reference evaluator for loop traces.
//!
//! Executes scalar and vectorized traces over a byte-addressed memory so that
//! a rewritten loop can be checked against the loop it came from. Arrays are
//! little-endian byte buffers addressed by integer handles; narrow integer
//! elements are sign or zero extended on load and truncated on store.
//!
//! A loop runs until one of its guards fails. Guards that resume at the loop
//! header hand their values to the scalar version loop, which then runs to
//! its own exit, the same way the runtime falls back to the compiled version.

use super::operators::{AccumOp, OpCode};
use super::trace::{Arg, GuardDescr, Loop, Operation, ValueId};
use super::types::{ArrayDescr, Datatype};
use crate::opt::vectorize::{Accumulator, VectorizedLoop};
use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Values
// =============================================================================

/// Runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Machine word.
    Int(i64),
    /// Double.
    Float(f64),
    /// Vector of scalar lanes.
    Vector(Vec<Value>),
}

impl Value {
    fn as_int(&self, op: OpCode) -> EvalResult<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            _ => Err(EvalError::TypeMismatch { opcode: op }),
        }
    }

    fn as_float(&self, op: OpCode) -> EvalResult<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            _ => Err(EvalError::TypeMismatch { opcode: op }),
        }
    }

    fn lane(&self, index: usize) -> Value {
        match self {
            Value::Vector(lanes) => lanes.get(index).cloned().unwrap_or(Value::Int(0)),
            scalar => scalar.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Vector(lanes) => {
                write!(f, "<")?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", lane)?;
                }
                write!(f, ">")
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Evaluation failure.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// Access outside an array.
    OutOfBounds { base: i64, offset: i64, size: usize },
    /// Base handle does not name an array.
    UnknownArray(i64),
    /// Value read before it was defined.
    Unbound(ValueId),
    /// Operand of the wrong kind.
    TypeMismatch { opcode: OpCode },
    /// Memory access without descriptor.
    MissingDescr(OpCode),
    /// Opcode the evaluator does not execute.
    Unsupported(OpCode),
    /// Operation with too few arguments.
    MissingArg { opcode: OpCode, index: usize },
    /// The loop did not exit within the iteration budget.
    IterationLimit(usize),
    /// Label and entry values disagree in number.
    EntryArity { expected: usize, actual: usize },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::OutOfBounds { base, offset, size } => write!(
                f,
                "access of {} bytes at offset {} outside array {}",
                size, offset, base
            ),
            EvalError::UnknownArray(base) => write!(f, "no array with handle {}", base),
            EvalError::Unbound(v) => write!(f, "value {} is not defined", v),
            EvalError::TypeMismatch { opcode } => write!(f, "operand type mismatch in {}", opcode),
            EvalError::MissingDescr(op) => write!(f, "{} without array descriptor", op),
            EvalError::Unsupported(op) => write!(f, "cannot evaluate {}", op),
            EvalError::MissingArg { opcode, index } => {
                write!(f, "{} is missing argument {}", opcode, index)
            }
            EvalError::IterationLimit(n) => write!(f, "loop did not exit within {} iterations", n),
            EvalError::EntryArity { expected, actual } => {
                write!(f, "loop expects {} entry values, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// Result type for evaluation.
pub type EvalResult<T> = Result<T, EvalError>;

// =============================================================================
// Memory
// =============================================================================

/// Byte-addressed arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Memory {
    arrays: Vec<Vec<u8>>,
}

impl Memory {
    /// Create an empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed array and return its handle.
    pub fn alloc(&mut self, bytes: usize) -> i64 {
        self.arrays.push(vec![0; bytes]);
        (self.arrays.len() - 1) as i64
    }

    /// Allocate an integer array with `item_size`-byte elements.
    pub fn alloc_ints(&mut self, values: &[i64], item_size: usize) -> i64 {
        let base = self.alloc(values.len() * item_size);
        let buf = &mut self.arrays[base as usize];
        for (i, v) in values.iter().enumerate() {
            let bytes = v.to_le_bytes();
            buf[i * item_size..(i + 1) * item_size].copy_from_slice(&bytes[..item_size]);
        }
        base
    }

    /// Allocate an array of doubles.
    pub fn alloc_floats(&mut self, values: &[f64]) -> i64 {
        let base = self.alloc(values.len() * 8);
        let buf = &mut self.arrays[base as usize];
        for (i, v) in values.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
        base
    }

    /// Raw bytes of an array.
    pub fn bytes(&self, base: i64) -> Option<&[u8]> {
        usize::try_from(base)
            .ok()
            .and_then(|b| self.arrays.get(b))
            .map(Vec::as_slice)
    }

    /// Decode an integer array.
    pub fn ints(&self, base: i64, descr: ArrayDescr) -> EvalResult<Vec<i64>> {
        let len = self.bytes(base).ok_or(EvalError::UnknownArray(base))?.len();
        (0..len / descr.item_size)
            .map(|i| match self.read(base, (i * descr.item_size) as i64, descr)? {
                Value::Int(v) => Ok(v),
                _ => Err(EvalError::TypeMismatch {
                    opcode: OpCode::RawLoad,
                }),
            })
            .collect()
    }

    /// Decode an array of doubles.
    pub fn floats(&self, base: i64) -> EvalResult<Vec<f64>> {
        let len = self.bytes(base).ok_or(EvalError::UnknownArray(base))?.len();
        (0..len / 8)
            .map(|i| self.read(base, (i * 8) as i64, ArrayDescr::float())?.as_float(OpCode::RawLoad))
            .collect()
    }

    fn slot(&self, base: i64, offset: i64, size: usize) -> EvalResult<std::ops::Range<usize>> {
        let buf = self.bytes(base).ok_or(EvalError::UnknownArray(base))?;
        let oob = EvalError::OutOfBounds { base, offset, size };
        let start = usize::try_from(offset).map_err(|_| oob.clone())?;
        let end = start.checked_add(size).ok_or(oob.clone())?;
        if end > buf.len() {
            return Err(oob);
        }
        Ok(start..end)
    }

    /// Read one element.
    pub fn read(&self, base: i64, offset: i64, descr: ArrayDescr) -> EvalResult<Value> {
        let range = self.slot(base, offset, descr.item_size)?;
        let raw = &self.arrays[base as usize][range];
        let mut word = [0u8; 8];
        word[..raw.len()].copy_from_slice(raw);
        let bits = u64::from_le_bytes(word);
        Ok(match descr.datatype {
            Datatype::Float if descr.item_size == 4 => {
                Value::Float(f32::from_bits(bits as u32) as f64)
            }
            Datatype::Float => Value::Float(f64::from_bits(bits)),
            _ => Value::Int(extend(bits as i64, descr.item_size, descr.signed)),
        })
    }

    /// Write one element, truncating integers to the element width.
    pub fn write(&mut self, base: i64, offset: i64, descr: ArrayDescr, value: &Value) -> EvalResult<()> {
        let range = self.slot(base, offset, descr.item_size)?;
        let bytes = match (value, descr.datatype) {
            (Value::Float(v), Datatype::Float) if descr.item_size == 4 => {
                (*v as f32).to_bits().to_le_bytes().to_vec()
            }
            (Value::Float(v), Datatype::Float) => v.to_le_bytes().to_vec(),
            (Value::Int(v), Datatype::Int) => v.to_le_bytes()[..descr.item_size].to_vec(),
            _ => {
                return Err(EvalError::TypeMismatch {
                    opcode: OpCode::RawStore,
                })
            }
        };
        self.arrays[base as usize][range].copy_from_slice(&bytes);
        Ok(())
    }
}

/// Extend the low `bytes` of `value`.
fn extend(value: i64, bytes: usize, signed: bool) -> i64 {
    if bytes >= 8 || bytes == 0 {
        return value;
    }
    let shift = 64 - bytes as u32 * 8;
    if signed {
        (value << shift) >> shift
    } else {
        ((value as u64) << shift >> shift) as i64
    }
}

// =============================================================================
// Execution
// =============================================================================

/// How a loop left the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Exit {
    /// Descriptor of the failing guard.
    pub descr: GuardDescr,
    /// Values handed to the recovery code.
    pub fail_values: Vec<Value>,
    /// Completed iterations before the exit.
    pub iterations: usize,
}

type Env = FxHashMap<ValueId, Value>;

fn read_arg(env: &Env, arg: Arg) -> EvalResult<Value> {
    match arg {
        Arg::Value(v) => env.get(&v).cloned().ok_or(EvalError::Unbound(v)),
        Arg::Int(c) => Ok(Value::Int(c)),
        Arg::Float(c) => Ok(Value::Float(c)),
    }
}

fn operand(env: &Env, op: &Operation, index: usize) -> EvalResult<Value> {
    let arg = op.arg(index).ok_or(EvalError::MissingArg {
        opcode: op.opcode,
        index,
    })?;
    read_arg(env, arg)
}

fn scalar(opcode: OpCode, operands: &[Value]) -> EvalResult<Value> {
    let int = |i: usize| -> EvalResult<i64> {
        operands
            .get(i)
            .ok_or(EvalError::MissingArg { opcode, index: i })?
            .as_int(opcode)
    };
    let float = |i: usize| -> EvalResult<f64> {
        operands
            .get(i)
            .ok_or(EvalError::MissingArg { opcode, index: i })?
            .as_float(opcode)
    };
    Ok(match opcode {
        OpCode::IntAdd => Value::Int(int(0)?.wrapping_add(int(1)?)),
        OpCode::IntSub => Value::Int(int(0)?.wrapping_sub(int(1)?)),
        OpCode::IntMul => Value::Int(int(0)?.wrapping_mul(int(1)?)),
        OpCode::IntAnd => Value::Int(int(0)? & int(1)?),
        OpCode::IntOr => Value::Int(int(0)? | int(1)?),
        OpCode::IntXor => Value::Int(int(0)? ^ int(1)?),
        OpCode::IntLt => Value::Int((int(0)? < int(1)?) as i64),
        OpCode::IntLe => Value::Int((int(0)? <= int(1)?) as i64),
        OpCode::IntEq => Value::Int((int(0)? == int(1)?) as i64),
        OpCode::IntNe => Value::Int((int(0)? != int(1)?) as i64),
        OpCode::IntSignExt => Value::Int(extend(int(0)?, int(1)? as usize, true)),
        OpCode::CastIntToFloat => Value::Float(int(0)? as f64),
        OpCode::CastFloatToInt => Value::Int(float(0)? as i64),
        OpCode::FloatAdd => Value::Float(float(0)? + float(1)?),
        OpCode::FloatSub => Value::Float(float(0)? - float(1)?),
        OpCode::FloatMul => Value::Float(float(0)? * float(1)?),
        OpCode::FloatTrueDiv => Value::Float(float(0)? / float(1)?),
        OpCode::FloatNeg => Value::Float(-float(0)?),
        OpCode::FloatAbs => Value::Float(float(0)?.abs()),
        other => return Err(EvalError::Unsupported(other)),
    })
}

/// Horizontal reduction of an accumulator vector.
pub fn reduce(operator: AccumOp, vector: &Value) -> EvalResult<Value> {
    let Value::Vector(lanes) = vector else {
        return Ok(vector.clone());
    };
    let mut lanes = lanes.iter();
    let Some(first) = lanes.next() else {
        return Err(EvalError::TypeMismatch {
            opcode: OpCode::VecExtract,
        });
    };
    lanes.try_fold(first.clone(), |acc, lane| {
        let opcode = match (operator, &acc) {
            (AccumOp::Plus, Value::Float(_)) => OpCode::FloatAdd,
            (AccumOp::Plus, _) => OpCode::IntAdd,
            (AccumOp::Multiply, Value::Float(_)) => OpCode::FloatMul,
            (AccumOp::Multiply, _) => OpCode::IntMul,
        };
        scalar(opcode, &[acc, lane.clone()])
    })
}

/// Outcome of executing one operation.
enum Step {
    Continue,
    Fail(GuardDescr, Vec<Value>),
}

fn execute(op: &Operation, env: &mut Env, memory: &mut Memory) -> EvalResult<Step> {
    let opcode = op.opcode;
    let lanes = op.lanes();
    let descr = || op.descr.ok_or(EvalError::MissingDescr(opcode));
    let value = match opcode {
        OpCode::RawLoad => {
            let base = operand(env, op, 0)?.as_int(opcode)?;
            let offset = operand(env, op, 1)?.as_int(opcode)?;
            memory.read(base, offset, descr()?)?
        }
        OpCode::VecRawLoad => {
            let d = descr()?;
            let base = operand(env, op, 0)?.as_int(opcode)?;
            let offset = operand(env, op, 1)?.as_int(opcode)?;
            let values = (0..lanes)
                .map(|k| memory.read(base, offset + (k * d.item_size) as i64, d))
                .collect::<EvalResult<Vec<_>>>()?;
            Value::Vector(values)
        }
        OpCode::RawStore | OpCode::VecRawStore => {
            let d = descr()?;
            let base = operand(env, op, 0)?.as_int(opcode)?;
            let offset = operand(env, op, 1)?.as_int(opcode)?;
            let stored = operand(env, op, 2)?;
            if opcode == OpCode::RawStore {
                memory.write(base, offset, d, &stored)?;
            } else {
                for k in 0..lanes {
                    memory.write(base, offset + (k * d.item_size) as i64, d, &stored.lane(k))?;
                }
            }
            return Ok(Step::Continue);
        }
        OpCode::GuardTrue | OpCode::GuardFalse => {
            let cond = operand(env, op, 0)?.as_int(opcode)? != 0;
            let passes = if opcode == OpCode::GuardTrue { cond } else { !cond };
            if passes {
                return Ok(Step::Continue);
            }
            let guard = op.guard.as_deref().ok_or(EvalError::Unsupported(opcode))?;
            let values = guard
                .fail_args
                .iter()
                .map(|&a| read_arg(env, a))
                .collect::<EvalResult<Vec<_>>>()?;
            return Ok(Step::Fail(guard.descr, values));
        }
        OpCode::GuardEarlyExit | OpCode::GuardFutureCondition | OpCode::GuardNotInvalidated => {
            return Ok(Step::Continue)
        }
        OpCode::VecExpand => Value::Vector(vec![operand(env, op, 0)?; lanes]),
        OpCode::VecPack => Value::Vector(
            op.args
                .iter()
                .map(|&a| read_arg(env, a))
                .collect::<EvalResult<Vec<_>>>()?,
        ),
        OpCode::VecInsert => {
            let mut vector = match operand(env, op, 0)? {
                Value::Vector(lanes) => lanes,
                _ => return Err(EvalError::TypeMismatch { opcode }),
            };
            let lane = operand(env, op, 2)?.as_int(opcode)? as usize;
            let slot = vector
                .get_mut(lane)
                .ok_or(EvalError::TypeMismatch { opcode })?;
            *slot = operand(env, op, 1)?;
            Value::Vector(vector)
        }
        OpCode::VecExtract => {
            let lane = operand(env, op, 1)?.as_int(opcode)? as usize;
            match operand(env, op, 0)? {
                Value::Vector(lanes) => lanes
                    .get(lane)
                    .cloned()
                    .ok_or(EvalError::TypeMismatch { opcode })?,
                _ => return Err(EvalError::TypeMismatch { opcode }),
            }
        }
        _ => {
            let operands = op
                .args
                .iter()
                .map(|&a| read_arg(env, a))
                .collect::<EvalResult<Vec<_>>>()?;
            match opcode.to_scalar() {
                Some(lane_op) => {
                    let values = (0..lanes)
                        .map(|k| {
                            let lane: Vec<Value> = operands.iter().map(|v| v.lane(k)).collect();
                            scalar(lane_op, &lane)
                        })
                        .collect::<EvalResult<Vec<_>>>()?;
                    Value::Vector(values)
                }
                None => scalar(opcode, &operands)?,
            }
        }
    };
    if let Some(result) = op.result {
        env.insert(result, value);
    }
    Ok(Step::Continue)
}

fn bind_header(lp: &Loop, env: &mut Env, values: Vec<Value>) -> EvalResult<()> {
    let header = lp.header_values();
    if header.len() != values.len() {
        return Err(EvalError::EntryArity {
            expected: header.len(),
            actual: values.len(),
        });
    }
    for (id, value) in header.into_iter().zip(values) {
        env.insert(id, value);
    }
    Ok(())
}

/// Iterate `lp` until a guard fails, giving the failing guard and its values.
fn iterate(
    lp: &Loop,
    env: &mut Env,
    memory: &mut Memory,
    max_iterations: usize,
) -> EvalResult<(GuardDescr, Vec<Value>, usize)> {
    for iteration in 0..max_iterations {
        for op in &lp.body {
            if let Step::Fail(descr, values) = execute(op, env, memory)? {
                return Ok((descr, values, iteration));
            }
        }
        let next = lp
            .closer
            .args
            .iter()
            .map(|&a| read_arg(env, a))
            .collect::<EvalResult<Vec<_>>>()?;
        bind_header(lp, env, next)?;
    }
    Err(EvalError::IterationLimit(max_iterations))
}

/// Run a scalar loop from `inputs` until a guard fails.
pub fn run_loop(
    lp: &Loop,
    inputs: &[Value],
    memory: &mut Memory,
    max_iterations: usize,
) -> EvalResult<Exit> {
    let mut env = Env::default();
    bind_header(lp, &mut env, inputs.to_vec())?;
    let (descr, fail_values, iterations) = iterate(lp, &mut env, memory, max_iterations)?;
    Ok(Exit {
        descr,
        fail_values,
        iterations,
    })
}

fn reduce_accumulators(
    fail_args: &[Arg],
    values: Vec<Value>,
    accumulators: &[Accumulator],
) -> EvalResult<Vec<Value>> {
    fail_args
        .iter()
        .zip(values)
        .map(|(arg, value)| {
            let acc = arg
                .as_value()
                .and_then(|v| accumulators.iter().find(|a| a.values.contains(&v)));
            match acc {
                Some(acc) => reduce(acc.operator, &value),
                None => Ok(value),
            }
        })
        .collect()
}

/// Run a vectorized loop: prefix, vector loop, and the scalar version loop
/// when a guard resumes at the loop header.
pub fn run_vectorized(
    vl: &VectorizedLoop,
    inputs: &[Value],
    memory: &mut Memory,
    max_iterations: usize,
) -> EvalResult<Exit> {
    let mut env = Env::default();
    bind_header(&vl.version, &mut env, inputs.to_vec())?;
    for op in &vl.prefix {
        execute(op, &mut env, memory)?;
    }
    let entry = vl
        .entry_args
        .iter()
        .map(|&a| read_arg(&env, a))
        .collect::<EvalResult<Vec<_>>>()?;
    bind_header(&vl.body, &mut env, entry)?;

    let (descr, values, iterations) = iterate(&vl.body, &mut env, memory, max_iterations)?;
    let guard = vl
        .body
        .body
        .iter()
        .filter_map(|op| op.guard.as_deref())
        .find(|g| g.descr == descr);
    let values = match guard {
        Some(g) => reduce_accumulators(&g.fail_args, values, &vl.accumulators)?,
        None => values,
    };
    let logical = iterations * vl.info.unroll_factor;

    if !descr.resumes_at_loop_header() {
        return Ok(Exit {
            descr,
            fail_values: values,
            iterations: logical,
        });
    }
    let rest = run_loop(&vl.version, &values, memory, max_iterations)?;
    Ok(Exit {
        iterations: logical + rest.iterations,
        ..rest
    })
}

// =============================================================================
// Tests
// =============================================================================
