//! Cost model for trace vectorization.
//!
//! The model keeps a running `savings` counter while the scheduler emits the
//! vector loop. Every pack that replaces `n` scalar operations by one vector
//! operation adds to it; every lane shuffle needed to move values between
//! scalar and vector registers subtracts from it. The loop is kept only if
//! the final balance reaches the configured threshold.
//!
//! # Target Models
//!
//! - `X86CostModel`: SSE/AVX; moving a single float lane costs two
//!   instructions
//! - `Aarch64CostModel`: NEON; single lane moves are one instruction
//!
//! # Example
//!
//! ```text
//! let mut model = X86CostModel::new(0);
//! model.record_pack_savings(&PackCost::new(OpCode::IntAdd, 4), 4);
//! model.record_vector_unpack(Datatype::Int, 0, 1);
//! assert!(model.profitable());
//! ```

use crate::ir::operators::OpCode;
use crate::ir::types::{Datatype, ElemType};

// =============================================================================
// SIMD Level
// =============================================================================

/// Target SIMD capability level.
///
/// Higher x86 levels include all capabilities of lower levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimdLevel {
    /// SSE4.2 (128-bit vectors)
    ///
    /// - 2×i64, 2×f64, 4×i32, 8×i16
    Sse42,

    /// AVX2 (256-bit vectors)
    ///
    /// - 4×i64, 4×f64, 8×i32
    Avx2,

    /// AVX-512 (512-bit vectors)
    ///
    /// - 8×i64, 8×f64, 16×i32
    Avx512,

    /// ARMv8 NEON (128-bit vectors)
    Neon,
}

impl SimdLevel {
    /// Get vector register width in bytes.
    pub const fn max_vector_bytes(self) -> usize {
        match self {
            SimdLevel::Sse42 | SimdLevel::Neon => 16,
            SimdLevel::Avx2 => 32,
            SimdLevel::Avx512 => 64,
        }
    }

    /// Get vector register width in bits.
    pub const fn max_vector_bits(self) -> usize {
        self.max_vector_bytes() * 8
    }

    /// Lanes of `element` that fit one register.
    pub fn max_lanes(self, element: ElemType) -> usize {
        if element.bytes == 0 {
            return 0;
        }
        self.max_vector_bytes() / element.bytes
    }

    /// Check if this is an x86 level.
    pub const fn is_x86(self) -> bool {
        !matches!(self, SimdLevel::Neon)
    }
}

impl Default for SimdLevel {
    fn default() -> Self {
        SimdLevel::Sse42
    }
}

// =============================================================================
// Pack Cost
// =============================================================================

/// What the cost model needs to know about an emitted pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackCost {
    /// Scalar opcode of the pack members.
    pub opcode: OpCode,
    /// Number of scalar operations replaced.
    pub numops: usize,
    /// Element width read by the operation.
    pub from_bytes: usize,
    /// Element width produced by the operation.
    pub to_bytes: usize,
}

impl PackCost {
    /// A pack whose element width does not change.
    pub fn new(opcode: OpCode, numops: usize) -> Self {
        PackCost {
            opcode,
            numops,
            from_bytes: 8,
            to_bytes: 8,
        }
    }

    /// A width-changing pack.
    pub fn cast(opcode: OpCode, numops: usize, from_bytes: usize, to_bytes: usize) -> Self {
        PackCost {
            opcode,
            numops,
            from_bytes,
            to_bytes,
        }
    }

    /// `(cost, benefit factor)` of the pack.
    pub fn cost_benefit(&self) -> (i64, i64) {
        if self.opcode == OpCode::IntSignExt {
            if self.from_bytes == self.to_bytes {
                return (0, 0);
            }
            // needs several instructions per lane
            return (1, 0);
        }
        (1, 1)
    }
}

// =============================================================================
// Cost Model Trait
// =============================================================================

/// Running profitability estimate of a vectorized loop.
pub trait CostModel: Send {
    /// Record a pack replacing `times` scalar operations.
    fn record_pack_savings(&mut self, pack: &PackCost, times: usize);

    /// Record a scalar integer width change for `count` lanes.
    fn record_cast_int(&mut self, from_bytes: usize, to_bytes: usize, count: usize);

    /// Record moving `count` scalars into a vector starting at lane `index`.
    fn record_vector_pack(&mut self, datatype: Datatype, index: usize, count: usize);

    /// Record moving `count` lanes starting at `index` out of a vector.
    fn record_vector_unpack(&mut self, datatype: Datatype, index: usize, count: usize) {
        self.record_vector_pack(datatype, index, count);
    }

    /// Current balance.
    fn savings(&self) -> i64;

    /// Minimum balance for the loop to be kept.
    fn threshold(&self) -> i64;

    /// Forget everything recorded.
    fn reset_savings(&mut self);

    /// The balance reaches the threshold.
    fn profitable(&self) -> bool {
        self.savings() >= self.threshold()
    }
}

// =============================================================================
// x86
// =============================================================================

/// Cost model for SSE/AVX targets.
#[derive(Debug, Clone, Default)]
pub struct X86CostModel {
    savings: i64,
    threshold: i64,
}

impl X86CostModel {
    /// Create a model with the given threshold.
    pub fn new(threshold: i64) -> Self {
        X86CostModel {
            savings: 0,
            threshold,
        }
    }
}

impl CostModel for X86CostModel {
    fn record_pack_savings(&mut self, pack: &PackCost, times: usize) {
        let (cost, benefit_factor) = pack.cost_benefit();
        self.savings += benefit_factor * times as i64 - cost;
    }

    fn record_cast_int(&mut self, _from_bytes: usize, _to_bytes: usize, count: usize) {
        // one instruction per moved lane
        self.savings -= count as i64;
    }

    fn record_vector_pack(&mut self, datatype: Datatype, index: usize, count: usize) {
        if datatype == Datatype::Float && index == 1 && count == 1 {
            self.savings -= 2;
            return;
        }
        self.savings -= count as i64;
    }

    fn savings(&self) -> i64 {
        self.savings
    }

    fn threshold(&self) -> i64 {
        self.threshold
    }

    fn reset_savings(&mut self) {
        self.savings = 0;
    }
}

// =============================================================================
// AArch64
// =============================================================================

/// Cost model for NEON targets.
#[derive(Debug, Clone, Default)]
pub struct Aarch64CostModel {
    savings: i64,
    threshold: i64,
}

impl Aarch64CostModel {
    /// Create a model with the given threshold.
    pub fn new(threshold: i64) -> Self {
        Aarch64CostModel {
            savings: 0,
            threshold,
        }
    }
}

impl CostModel for Aarch64CostModel {
    fn record_pack_savings(&mut self, pack: &PackCost, times: usize) {
        let (cost, benefit_factor) = pack.cost_benefit();
        self.savings += benefit_factor * times as i64 - cost;
    }

    fn record_cast_int(&mut self, _from_bytes: usize, _to_bytes: usize, count: usize) {
        self.savings -= count as i64;
    }

    fn record_vector_pack(&mut self, _datatype: Datatype, _index: usize, count: usize) {
        // ins/dup move any lane in one instruction
        self.savings -= count as i64;
    }

    fn savings(&self) -> i64 {
        self.savings
    }

    fn threshold(&self) -> i64 {
        self.threshold
    }

    fn reset_savings(&mut self) {
        self.savings = 0;
    }
}

/// Cost model matching a SIMD level.
pub fn cost_model_for(level: SimdLevel, threshold: i64) -> Box<dyn CostModel> {
    if level.is_x86() {
        Box::new(X86CostModel::new(threshold))
    } else {
        Box::new(Aarch64CostModel::new(threshold))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simd_level_widths() {
        assert_eq!(SimdLevel::Sse42.max_vector_bytes(), 16);
        assert_eq!(SimdLevel::Avx2.max_vector_bytes(), 32);
        assert_eq!(SimdLevel::Avx512.max_vector_bits(), 512);
        assert_eq!(SimdLevel::Neon.max_vector_bytes(), 16);
        assert_eq!(SimdLevel::Sse42.max_lanes(ElemType::int(4, true)), 4);
        assert_eq!(SimdLevel::Avx2.max_lanes(ElemType::FLOAT), 4);
    }

    #[test]
    fn test_pack_savings() {
        let mut model = X86CostModel::new(0);
        model.record_pack_savings(&PackCost::new(OpCode::IntAdd, 4), 4);
        assert_eq!(model.savings(), 3);
        assert!(model.profitable());
    }

    #[test]
    fn test_cast_int_decreases_by_lane_count() {
        let mut model = X86CostModel::new(0);
        model.record_pack_savings(&PackCost::new(OpCode::FloatAdd, 2), 2);
        let before = model.savings();
        model.record_cast_int(4, 8, 2);
        assert_eq!(model.savings(), before - 2);
    }

    #[test]
    fn test_signext_pack_cost() {
        let mut model = X86CostModel::new(0);
        model.record_pack_savings(&PackCost::cast(OpCode::IntSignExt, 4, 4, 4), 4);
        assert_eq!(model.savings(), 0);
        model.record_pack_savings(&PackCost::cast(OpCode::IntSignExt, 4, 4, 2), 4);
        assert_eq!(model.savings(), -1);
    }

    #[test]
    fn test_single_float_lane_moves() {
        let mut x86 = X86CostModel::new(0);
        x86.record_vector_unpack(Datatype::Float, 1, 1);
        assert_eq!(x86.savings(), -2);
        x86.record_vector_pack(Datatype::Int, 1, 1);
        assert_eq!(x86.savings(), -3);

        let mut arm = Aarch64CostModel::new(0);
        arm.record_vector_unpack(Datatype::Float, 1, 1);
        assert_eq!(arm.savings(), -1);
        assert!(!arm.profitable());
        arm.reset_savings();
        assert!(arm.profitable());
    }

    #[test]
    fn test_threshold() {
        let mut model = cost_model_for(SimdLevel::Avx2, 2);
        model.record_pack_savings(&PackCost::new(OpCode::IntMul, 2), 2);
        assert_eq!(model.savings(), 1);
        assert!(!model.profitable());
        assert_eq!(cost_model_for(SimdLevel::Neon, 0).savings(), 0);
    }
}
