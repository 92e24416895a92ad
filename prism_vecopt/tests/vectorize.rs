//! End-to-end tests of the vectorization pass.
//!
//! Every accepted loop is executed next to its scalar source over the same
//! memory; both runs must leave identical memory and exit the same way.

use prism_vecopt::ir::{
    run_loop, run_vectorized, AccumOp, Arg, ArrayDescr, Exit, Loop, Memory, OpCode, TraceBuilder,
    Value, ValueGen,
};
use prism_vecopt::opt::vectorize::{
    optimize_vector, DependencyGraph, GuardDescrFactory, LoopUnroller, NoopObserver,
    NotVectorizableReason, PackSet, RecordingObserver, Stage, TargetMachine, VectorizeConfig,
    VectorizeError, VectorizeEvent, VectorizeResult, VectorizedLoop,
};

const MAX_ITERATIONS: usize = 10_000;

// =============================================================================
// Loops
// =============================================================================

/// c[i] = a[i] + b[i] over `size`-byte integers while i + 1 < n.
fn add_arrays(size: usize) -> Loop {
    let descr = ArrayDescr::int(size);
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let a = b.input();
    let bb = b.input();
    let c = b.input();
    let off = b.int_mul(i, size as i64);
    let x = b.raw_load(descr, a, off);
    let y = b.raw_load(descr, bb, off);
    let s = b.int_add(x, y);
    b.raw_store(descr, c, off, s);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 5] = [i1.into(), n.into(), a.into(), bb.into(), c.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

/// Same as `add_arrays`, but every sum is also passed to a call.
fn add_arrays_with_call(size: usize) -> Loop {
    let descr = ArrayDescr::int(size);
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let a = b.input();
    let bb = b.input();
    let c = b.input();
    let off = b.int_mul(i, size as i64);
    let x = b.raw_load(descr, a, off);
    let y = b.raw_load(descr, bb, off);
    let s = b.int_add(x, y);
    b.raw_store(descr, c, off, s);
    b.call(&[s.into()]);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 5] = [i1.into(), n.into(), a.into(), bb.into(), c.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

/// s += a[i] over doubles while i + 1 < n.
fn float_sum() -> Loop {
    let descr = ArrayDescr::float();
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let a = b.input();
    let s = b.input();
    let off = b.int_mul(i, 8);
    let x = b.raw_load(descr, a, off);
    let s1 = b.float_add(s, x);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 4] = [i1.into(), n.into(), a.into(), s1.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

/// dst[i] = -src[i] over doubles while i + 1 < n.
fn negate() -> Loop {
    let descr = ArrayDescr::float();
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let src = b.input();
    let dst = b.input();
    let off = b.int_mul(i, 8);
    let x = b.raw_load(descr, src, off);
    let y = b.float_neg(x);
    b.raw_store(descr, dst, off, y);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 4] = [i1.into(), n.into(), src.into(), dst.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

fn vectorize(lp: &Loop) -> VectorizeResult<VectorizedLoop> {
    optimize_vector(
        lp,
        &TargetMachine::sse42(),
        &VectorizeConfig::default(),
        &NoopObserver,
    )
}

fn count(lp: &Loop, opcode: OpCode) -> usize {
    lp.body.iter().filter(|op| op.opcode == opcode).count()
}

// =============================================================================
// Execution
// =============================================================================

struct AddRun {
    exit: Exit,
    out: Vec<i64>,
}

fn run_add(size: usize, n: usize, vector: Option<&VectorizedLoop>, scalar: &Loop) -> AddRun {
    let lhs: Vec<i64> = (0..n as i64).map(|v| v * 3 - 7).collect();
    let rhs: Vec<i64> = (0..n as i64).map(|v| 100 - v).collect();
    let mut memory = Memory::new();
    let a = memory.alloc_ints(&lhs, size);
    let b = memory.alloc_ints(&rhs, size);
    let c = memory.alloc_ints(&vec![0; n], size);
    let inputs = [
        Value::Int(0),
        Value::Int(n as i64),
        Value::Int(a),
        Value::Int(b),
        Value::Int(c),
    ];
    let exit = match vector {
        Some(vl) => run_vectorized(vl, &inputs, &mut memory, MAX_ITERATIONS).unwrap(),
        None => run_loop(scalar, &inputs, &mut memory, MAX_ITERATIONS).unwrap(),
    };
    let out = memory.ints(c, ArrayDescr::int(size)).unwrap();
    AddRun { exit, out }
}

// =============================================================================
// Acceptance
// =============================================================================

#[test]
fn test_i32_add_is_packed_four_wide() {
    let lp = add_arrays(4);
    let vl = vectorize(&lp).unwrap();

    assert_eq!(vl.info.unroll_factor, 4);
    assert!(vl.body.body.len() < 32);
    assert_eq!(count(&vl.body, OpCode::VecIntAdd), 1);
    assert_eq!(count(&vl.body, OpCode::VecRawLoad), 2);
    assert_eq!(count(&vl.body, OpCode::VecRawStore), 1);
    let add = vl
        .body
        .body
        .iter()
        .find(|op| op.opcode == OpCode::VecIntAdd)
        .unwrap();
    assert_eq!(add.lanes(), 4);
    assert!(vl.info.savings >= 0);
}

#[test]
fn test_wider_registers_unroll_further() {
    let lp = add_arrays(4);
    let vl = optimize_vector(
        &lp,
        &TargetMachine::avx2(),
        &VectorizeConfig::default(),
        &NoopObserver,
    )
    .unwrap();
    assert_eq!(vl.info.unroll_factor, 8);
}

#[test]
fn test_vector_loop_keeps_loop_shape() {
    for lp in [add_arrays(4), add_arrays(8), add_arrays(2), negate(), float_sum()] {
        let vl = vectorize(&lp).unwrap();
        assert!(vl.body.check_shape().is_ok());
        assert_eq!(vl.body.header.args.len(), vl.body.closer.args.len());
        assert_eq!(vl.entry_args.len(), vl.body.header.args.len());
        assert_eq!(vl.version, lp);
    }
}

#[test]
fn test_stage_order_of_accepted_attempt() {
    let observer = RecordingObserver::new();
    optimize_vector(
        &add_arrays(4),
        &TargetMachine::sse42(),
        &VectorizeConfig::default(),
        &observer,
    )
    .unwrap();
    assert_eq!(
        observer.stages(),
        vec![
            Stage::Scan,
            Stage::HoistGuards,
            Stage::Unroll,
            Stage::BuildDepGraph,
            Stage::SeedPacks,
            Stage::Extend,
            Stage::Combine,
            Stage::Split,
            Stage::Schedule,
            Stage::CostGate,
        ]
    );
    assert!(matches!(
        observer.events().last(),
        Some(VectorizeEvent::Accepted { unroll_factor: 4, .. })
    ));
}

// =============================================================================
// Equivalence
// =============================================================================

#[test]
fn test_add_loop_matches_scalar_run() {
    for size in [2, 4, 8] {
        let lp = add_arrays(size);
        let vl = vectorize(&lp).unwrap();
        for n in [1, 3, 4, 10, 16, 33] {
            let scalar = run_add(size, n, None, &lp);
            let vector = run_add(size, n, Some(&vl), &lp);
            assert_eq!(vector.out, scalar.out, "size {} n {}", size, n);
            assert_eq!(vector.exit, scalar.exit, "size {} n {}", size, n);
        }
    }
}

#[test]
fn test_negate_matches_scalar_run() {
    let lp = negate();
    let vl = vectorize(&lp).unwrap();
    for n in [2, 7, 12] {
        let src: Vec<f64> = (0..n).map(|v| v as f64 * 0.5 - 1.0).collect();
        let run = |vector: bool| {
            let mut memory = Memory::new();
            let s = memory.alloc_floats(&src);
            let d = memory.alloc_floats(&vec![0.0; n]);
            let inputs = [
                Value::Int(0),
                Value::Int(n as i64),
                Value::Int(s),
                Value::Int(d),
            ];
            let exit = if vector {
                run_vectorized(&vl, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            } else {
                run_loop(&lp, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            };
            (exit, memory.floats(d).unwrap())
        };
        assert_eq!(run(true), run(false));
    }
}

#[test]
fn test_float_sum_is_accumulated() {
    let lp = float_sum();
    let vl = vectorize(&lp).unwrap();

    assert_eq!(vl.accumulators.len(), 1);
    let acc = &vl.accumulators[0];
    assert_eq!(acc.operator, AccumOp::Plus);
    assert!(!acc.values.is_empty());
    assert!(vl
        .body
        .header
        .args
        .iter()
        .any(|a| a.as_value().map_or(false, |v| acc.values.contains(&v))));
    assert_eq!(count(&vl.body, OpCode::VecFloatAdd), 1);

    for n in [1, 2, 5, 8, 11] {
        let data: Vec<f64> = (0..n).map(|v| v as f64 + 0.25).collect();
        let run = |vector: bool| {
            let mut memory = Memory::new();
            let a = memory.alloc_floats(&data);
            let inputs = [
                Value::Int(0),
                Value::Int(n as i64),
                Value::Int(a),
                Value::Float(1.5),
            ];
            if vector {
                run_vectorized(&vl, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            } else {
                run_loop(&lp, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            }
        };
        assert_eq!(run(true), run(false), "n {}", n);
    }
}

/// s += a[i] over 4-byte integers while i + 1 < n.
fn int_sum() -> Loop {
    let descr = ArrayDescr::int(4);
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let a = b.input();
    let s = b.input();
    let off = b.int_mul(i, 4);
    let x = b.raw_load(descr, a, off);
    let s1 = b.int_add(s, x);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 4] = [i1.into(), n.into(), a.into(), s1.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

/// c[i] = signext(a[i], 8) + 1 from 4-byte into 8-byte integers while i + 1 < n.
fn widen_add_one() -> Loop {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let a = b.input();
    let c = b.input();
    let src = b.int_mul(i, 4);
    let x = b.raw_load(ArrayDescr::int(4), a, src);
    let y = b.int_signext(x, 8);
    let z = b.int_add(y, 1);
    let dst = b.int_mul(i, 8);
    b.raw_store(ArrayDescr::int(8), c, dst, z);
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    let carried: [Arg; 4] = [i1.into(), n.into(), a.into(), c.into()];
    b.guard_true(lt, &carried);
    b.finish(&carried)
}

fn vectorize_at_any_cost(lp: &Loop) -> VectorizeResult<VectorizedLoop> {
    let config = VectorizeConfig {
        cost_threshold: -1000,
        ..VectorizeConfig::default()
    };
    optimize_vector(lp, &TargetMachine::sse42(), &config, &NoopObserver)
}

#[test]
fn test_narrow_int_sum_stays_scalar_reduction() {
    let lp = int_sum();
    let vl = vectorize_at_any_cost(&lp).unwrap();

    assert!(vl.accumulators.is_empty());
    assert_eq!(count(&vl.body, OpCode::VecIntAdd), 0);
    assert!(count(&vl.body, OpCode::VecRawLoad) > 0);

    for n in [1, 3, 4, 8, 9] {
        let data: Vec<i64> = (0..n as i64).map(|v| v * 5 - 11).collect();
        let run = |vector: bool| {
            let mut memory = Memory::new();
            let a = memory.alloc_ints(&data, 4);
            let inputs = [
                Value::Int(0),
                Value::Int(n as i64),
                Value::Int(a),
                Value::Int(40),
            ];
            if vector {
                run_vectorized(&vl, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            } else {
                run_loop(&lp, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            }
        };
        assert_eq!(run(true), run(false), "n {}", n);
    }
}

#[test]
fn test_sign_extension_matches_scalar_run() {
    let lp = widen_add_one();
    let vl = vectorize_at_any_cost(&lp).unwrap();
    assert!(count(&vl.body, OpCode::VecIntSignExt) > 0);

    for n in [1, 3, 4, 8, 9] {
        let data: Vec<i64> = (0..n as i64)
            .map(|v| if v % 2 == 0 { -v - 3 } else { v * 7 })
            .collect();
        let run = |vector: bool| {
            let mut memory = Memory::new();
            let a = memory.alloc_ints(&data, 4);
            let c = memory.alloc_ints(&vec![0; n], 8);
            let inputs = [
                Value::Int(0),
                Value::Int(n as i64),
                Value::Int(a),
                Value::Int(c),
            ];
            let exit = if vector {
                run_vectorized(&vl, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            } else {
                run_loop(&lp, &inputs, &mut memory, MAX_ITERATIONS).unwrap()
            };
            (exit, memory.ints(c, ArrayDescr::int(8)).unwrap())
        };
        let (vector_exit, vector_out) = run(true);
        let (scalar_exit, scalar_out) = run(false);
        assert_eq!(vector_exit, scalar_exit, "n {}", n);
        assert_eq!(vector_out, scalar_out, "n {}", n);
    }
}

// =============================================================================
// Rejection
// =============================================================================

#[test]
fn test_call_rejects_before_unrolling() {
    let lp = add_arrays_with_call(4);
    let observer = RecordingObserver::new();
    let err = optimize_vector(
        &lp,
        &TargetMachine::sse42(),
        &VectorizeConfig::default(),
        &observer,
    )
    .unwrap_err();
    assert_eq!(err, VectorizeError::from(NotVectorizableReason::CallInLoop));
    assert!(observer.entered(Stage::Scan));
    assert!(!observer.entered(Stage::Unroll));
    assert_eq!(observer.stages(), vec![Stage::Scan]);
}

#[test]
fn test_rejection_is_repeatable_and_leaves_input_alone() {
    let lp = add_arrays_with_call(4);
    let before = lp.clone();
    let first = vectorize(&lp).unwrap_err();
    let second = vectorize(&lp).unwrap_err();
    assert_eq!(first, second);
    assert!(first.is_rejection());
    assert_eq!(lp, before);
}

#[test]
fn test_loop_without_memory_is_rejected() {
    let mut b = TraceBuilder::new();
    let i = b.input();
    let n = b.input();
    let i1 = b.int_add(i, 1);
    let lt = b.int_lt(i1, n);
    b.guard_true(lt, &[i1.into(), n.into()]);
    let lp = b.finish(&[i1.into(), n.into()]);
    let err = vectorize(&lp).unwrap_err();
    assert!(err.is_rejection());
}

#[test]
fn test_scalar_consumers_cost_savings() {
    let config = VectorizeConfig {
        forbid_calls: false,
        ..VectorizeConfig::default()
    };
    let savings = |lp: &Loop| {
        match optimize_vector(lp, &TargetMachine::sse42(), &config, &NoopObserver) {
            Ok(vl) => vl.info.savings,
            Err(VectorizeError::NotProfitable { savings }) => savings,
            Err(other) => panic!("unexpected rejection: {}", other),
        }
    };
    let plain = savings(&add_arrays(4));
    let with_call = savings(&add_arrays_with_call(4));
    assert!(with_call < plain, "{} >= {}", with_call, plain);
}

#[test]
fn test_raising_the_threshold_never_accepts_more() {
    let lp = add_arrays(4);
    let accepted = |threshold: i64| {
        let config = VectorizeConfig {
            cost_threshold: threshold,
            ..VectorizeConfig::default()
        };
        optimize_vector(&lp, &TargetMachine::sse42(), &config, &NoopObserver).is_ok()
    };
    let results: Vec<bool> = [0, 2, 4, 8, 16, 64, 1024]
        .iter()
        .map(|&t| accepted(t))
        .collect();
    assert!(results[0]);
    assert!(!results[results.len() - 1]);
    assert!(results.windows(2).all(|w| w[0] || !w[1]));
}

// =============================================================================
// Packs
// =============================================================================

#[test]
fn test_packed_operations_are_independent() {
    for lp in [add_arrays(4), float_sum(), negate()] {
        let mut values = ValueGen::after(&lp);
        let mut descrs = GuardDescrFactory::for_loop(&lp);
        let unrolled = LoopUnroller::new(&mut values, &mut descrs)
            .unroll(&lp, 3)
            .unwrap();
        let mut graph = DependencyGraph::build(&unrolled);
        let mut packset = PackSet::new(16, unrolled.value_types());
        packset.find_adjacent_memory_refs(&graph).unwrap();
        packset.extend_packset(&graph).unwrap();
        packset.combine_packset().unwrap();
        packset.split_overloaded_packs(&mut graph).unwrap();

        assert!(packset.pack_count() > 0);
        for pack in packset.packs() {
            for (i, &l) in pack.nodes.iter().enumerate() {
                for &r in &pack.nodes[i + 1..] {
                    if pack.is_accumulating() {
                        continue;
                    }
                    assert!(graph.independent(l, r), "{}", pack);
                }
            }
        }
    }
}

#[test]
fn test_memory_packs_cover_consecutive_elements() {
    let lp = add_arrays(4);
    let mut values = ValueGen::after(&lp);
    let mut descrs = GuardDescrFactory::for_loop(&lp);
    let unrolled = LoopUnroller::new(&mut values, &mut descrs)
        .unroll(&lp, 3)
        .unwrap();
    let mut graph = DependencyGraph::build(&unrolled);
    let mut packset = PackSet::new(16, unrolled.value_types());
    packset.find_adjacent_memory_refs(&graph).unwrap();
    packset.extend_packset(&graph).unwrap();
    packset.combine_packset().unwrap();
    packset.split_overloaded_packs(&mut graph).unwrap();

    let refs = graph.memory_refs();
    let memory_packs: Vec<_> = packset
        .packs()
        .iter()
        .filter(|p| graph.op(p.left()).opcode.is_primitive_array_access())
        .collect();
    assert_eq!(memory_packs.len(), 3);
    for pack in memory_packs {
        assert_eq!(pack.len(), 4);
        for pair in pack.nodes.windows(2) {
            let find = |n| refs.iter().find(|(node, _)| *node == n).map(|(_, r)| r);
            let (l, r) = (find(pair[0]).unwrap(), find(pair[1]).unwrap());
            assert!(l.is_adjacent_after(r), "{}", pack);
        }
    }
}
