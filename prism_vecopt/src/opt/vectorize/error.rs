//! Vectorization errors.
//!
//! A rejected loop is not a compilation failure: the caller keeps running
//! the scalar trace it already owns. `NotVectorizable` and `NotProfitable`
//! are the expected outcomes; `Internal` marks a broken invariant inside the
//! pass and is reported separately.

use crate::ir::trace::{ShapeError, ValueId};
use std::fmt;

/// Why a loop cannot be vectorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotVectorizableReason {
    /// The loop trace is malformed.
    Shape(ShapeError),
    /// The body calls out while calls are forbidden.
    CallInLoop,
    /// The body exceeds the configured length.
    TraceTooLong { len: usize, max: usize },
    /// Too few operations have a vector form.
    LowVectorRatio,
    /// Too large a share of the body are guards.
    TooManyGuards,
    /// No primitive array access in the body.
    NoArrayAccess,
    /// The target has no vector registers.
    NoVectorRegisters,
    /// No pair of adjacent accesses could be packed.
    NoPacks,
    /// An accumulation would have to be split across packs.
    SplitAccumulator,
    /// A pack cannot be scheduled as a unit.
    UnschedulablePack,
    /// A partial accumulator value is used outside its reduction.
    AccumulatorEscapes(ValueId),
    /// The accumulated value is not carried by the loop header.
    AccumulatorNotLoopCarried(ValueId),
}

impl fmt::Display for NotVectorizableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotVectorizableReason::Shape(err) => write!(f, "malformed loop: {}", err),
            NotVectorizableReason::CallInLoop => write!(f, "loop contains a call"),
            NotVectorizableReason::TraceTooLong { len, max } => {
                write!(f, "trace of {} operations exceeds {}", len, max)
            }
            NotVectorizableReason::LowVectorRatio => write!(f, "too few vectorizable operations"),
            NotVectorizableReason::TooManyGuards => write!(f, "too many guards"),
            NotVectorizableReason::NoArrayAccess => write!(f, "no array access"),
            NotVectorizableReason::NoVectorRegisters => write!(f, "target has no vector registers"),
            NotVectorizableReason::NoPacks => write!(f, "no packable operations"),
            NotVectorizableReason::SplitAccumulator => {
                write!(f, "accumulator would be split across packs")
            }
            NotVectorizableReason::UnschedulablePack => write!(f, "pack cannot be scheduled"),
            NotVectorizableReason::AccumulatorEscapes(v) => {
                write!(f, "partial accumulator {} escapes its reduction", v)
            }
            NotVectorizableReason::AccumulatorNotLoopCarried(v) => {
                write!(f, "accumulator {} is not loop carried", v)
            }
        }
    }
}

/// Error produced by a vectorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorizeError {
    /// The loop cannot be vectorized.
    NotVectorizable(NotVectorizableReason),
    /// Vectorizing would not pay off.
    NotProfitable { savings: i64 },
    /// An invariant of the pass was violated.
    Internal(String),
}

impl VectorizeError {
    /// Check if this is an expected rejection rather than a fault.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, VectorizeError::Internal(_))
    }
}

impl fmt::Display for VectorizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorizeError::NotVectorizable(reason) => write!(f, "not vectorizable: {}", reason),
            VectorizeError::NotProfitable { savings } => {
                write!(f, "not profitable: savings {}", savings)
            }
            VectorizeError::Internal(msg) => write!(f, "internal vectorizer error: {}", msg),
        }
    }
}

impl std::error::Error for VectorizeError {}

impl From<NotVectorizableReason> for VectorizeError {
    fn from(reason: NotVectorizableReason) -> Self {
        VectorizeError::NotVectorizable(reason)
    }
}

impl From<ShapeError> for VectorizeError {
    fn from(err: ShapeError) -> Self {
        VectorizeError::NotVectorizable(NotVectorizableReason::Shape(err))
    }
}

/// Result type for vectorization.
pub type VectorizeResult<T> = Result<T, VectorizeError>;
