//! Value renaming used by unrolling and emission.
//!
//! A renamer maps old value ids to replacement arguments. Lookups are not
//! chased transitively; every entry already points at the final value for
//! the copy being produced.

use super::trace::{Arg, GuardInfo, Operation, Snapshot, ValueId};
use rustc_hash::FxHashMap;

/// Substitution of values by arguments.
#[derive(Debug, Clone, Default)]
pub struct Renamer {
    map: FxHashMap<ValueId, Arg>,
}

impl Renamer {
    /// Create an empty renamer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename every later use of `from` to `to`.
    #[inline]
    pub fn start_renaming(&mut self, from: ValueId, to: Arg) {
        if to.is(from) {
            self.map.remove(&from);
        } else {
            self.map.insert(from, to);
        }
    }

    /// Current replacement of `value`.
    #[inline]
    pub fn rename_value(&self, value: ValueId) -> Arg {
        self.map.get(&value).copied().unwrap_or(Arg::Value(value))
    }

    /// Apply the renaming to one argument.
    #[inline]
    pub fn rename_arg(&self, arg: Arg) -> Arg {
        match arg {
            Arg::Value(v) => self.rename_value(v),
            other => other,
        }
    }

    /// Rename the regular arguments of an operation in place.
    pub fn rename_args(&self, op: &mut Operation) {
        for arg in op.args.iter_mut() {
            *arg = self.rename_arg(*arg);
        }
    }

    /// Renamed copy of a guard's fail arguments.
    pub fn rename_failargs(&self, guard: &GuardInfo) -> Vec<Arg> {
        guard.fail_args.iter().map(|&a| self.rename_arg(a)).collect()
    }

    /// Renamed copy of a snapshot.
    pub fn rename_snapshot(&self, snapshot: &Snapshot) -> Snapshot {
        Snapshot {
            frames: snapshot
                .frames
                .iter()
                .map(|frame| frame.iter().map(|&a| self.rename_arg(a)).collect())
                .collect(),
        }
    }

    /// Rename arguments, fail arguments and snapshot of an operation.
    pub fn rename_all(&self, op: &mut Operation) {
        self.rename_args(op);
        if let Some(guard) = op.guard.as_deref_mut() {
            guard.fail_args = self.rename_failargs(guard);
            guard.snapshot = self.rename_snapshot(&guard.snapshot);
        }
    }

    /// Number of active substitutions.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if no substitution is active.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
