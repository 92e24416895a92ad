//! Loop unrolling with renaming.
//!
//! The body is replicated so that one trip through the unrolled loop performs
//! `count + 1` original iterations:
//!
//! ```text
//! label(i)                      label(i)
//!   i1 = i + 1                    i1 = i + 1
//!   ...              ==>          ...
//! jump(i1)                        i2 = i1 + 1
//!                                 ...
//!                               jump(i2)
//! ```
//!
//! Each copy threads the loop-carried values through a renaming map seeded
//! with `label arg -> renamed jump arg`, and every copied result gets a fresh
//! value id. Guards recorded once per trace are not copied.

use super::error::{NotVectorizableReason, VectorizeResult};
use super::guard::GuardDescrFactory;
use crate::ir::renamer::Renamer;
use crate::ir::trace::{Loop, Operation, ValueGen};

// =============================================================================
// Unroll Count
// =============================================================================

/// Smallest element size among the primitive array accesses, 0 if none.
pub fn smallest_type_bytes(lp: &Loop) -> usize {
    lp.body
        .iter()
        .filter(|op| op.opcode.is_primitive_array_access())
        .filter_map(|op| op.descr.map(|d| d.item_size))
        .min()
        .unwrap_or(0)
}

/// Number of extra copies needed to fill one vector register.
pub fn unroll_count(lp: &Loop, vector_register_bytes: usize) -> VectorizeResult<usize> {
    let bytes = smallest_type_bytes(lp);
    if vector_register_bytes == 0 {
        return Err(NotVectorizableReason::NoVectorRegisters.into());
    }
    if bytes == 0 {
        return Err(NotVectorizableReason::NoArrayAccess.into());
    }
    // the body is already there once
    Ok((vector_register_bytes / bytes).saturating_sub(1))
}

// =============================================================================
// Unroller
// =============================================================================

/// Replicates a loop body with SSA renaming.
pub struct LoopUnroller<'a> {
    values: &'a mut ValueGen,
    descrs: &'a mut GuardDescrFactory,
}

impl<'a> LoopUnroller<'a> {
    /// Create an unroller drawing fresh values and descriptors from the given sources.
    pub fn new(values: &'a mut ValueGen, descrs: &'a mut GuardDescrFactory) -> Self {
        LoopUnroller { values, descrs }
    }

    /// Unroll `count` extra times. `count == 0` returns a copy of the loop.
    pub fn unroll(&mut self, lp: &Loop, count: usize) -> VectorizeResult<Loop> {
        lp.check_shape()?;

        let mut body: Vec<Operation> = lp.body.clone();
        body.reserve(lp.body.len() * count);
        let mut renamer = Renamer::new();

        for _ in 0..count {
            for (label_arg, jump_arg) in lp.header.args.iter().zip(lp.closer.args.iter()) {
                if let Some(label_value) = label_arg.as_value() {
                    let carried = renamer.rename_arg(*jump_arg);
                    renamer.start_renaming(label_value, carried);
                }
            }

            for op in &lp.body {
                if op.opcode.is_unrolled_once() {
                    continue;
                }
                let mut copy = op.clone_fresh(self.values);
                renamer.rename_args(&mut copy);
                if let (Some(old), Some(new)) = (op.result, copy.result) {
                    renamer.start_renaming(old, new.into());
                }
                if let Some(guard) = copy.guard.as_deref_mut() {
                    guard.descr = self.descrs.clone_descr(&guard.descr);
                    // header-resume guards restart the unrolled iteration
                    // and keep naming the header values
                    if !guard.descr.resumes_at_loop_header() {
                        guard.fail_args = renamer.rename_failargs(guard);
                        guard.snapshot = renamer.rename_snapshot(&guard.snapshot);
                    }
                }
                body.push(copy);
            }
        }

        let mut closer = lp.closer.clone();
        renamer.rename_args(&mut closer);
        Ok(Loop {
            header: lp.header.clone(),
            body,
            closer,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
