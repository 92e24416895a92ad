//! Vectorizer observers.
//!
//! The pass reports its progress through an injected observer instead of
//! printing or touching global counters. `NoopObserver` discards events,
//! `LogObserver` forwards them to the `log` facade and `RecordingObserver`
//! keeps them for later inspection.

use super::error::VectorizeError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;

// =============================================================================
// Events
// =============================================================================

/// Stage of a vectorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Size scan and fast-path bail checks.
    Scan,
    /// Moving index guards to the loop header.
    HoistGuards,
    /// Unrolling with renaming.
    Unroll,
    /// Dependency graph construction.
    BuildDepGraph,
    /// Pairing adjacent memory accesses.
    SeedPacks,
    /// Following def-use and use-def chains.
    Extend,
    /// Merging pairs into wider packs.
    Combine,
    /// Fitting packs to the register width.
    Split,
    /// Emitting the vector loop.
    Schedule,
    /// Profitability decision.
    CostGate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scan => "scan",
            Stage::HoistGuards => "hoist-guards",
            Stage::Unroll => "unroll",
            Stage::BuildDepGraph => "dependency-graph",
            Stage::SeedPacks => "seed-packs",
            Stage::Extend => "extend",
            Stage::Combine => "combine",
            Stage::Split => "split",
            Stage::Schedule => "schedule",
            Stage::CostGate => "cost-gate",
        };
        f.write_str(name)
    }
}

/// Something that happened during an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorizeEvent {
    /// An attempt on a loop of `ops` body operations started.
    AttemptStarted { ops: usize },
    /// A stage was entered.
    StageEntered(Stage),
    /// Guards were moved to the loop header.
    GuardsHoisted { count: usize },
    /// Final packs after splitting.
    PacksFormed { packs: usize, accumulating: usize },
    /// The loop was vectorized.
    Accepted {
        unroll_factor: usize,
        ops_before: usize,
        ops_after: usize,
        savings: i64,
    },
    /// The attempt ended without a result.
    Rejected(VectorizeError),
}

// =============================================================================
// Observer Trait
// =============================================================================

/// Receiver of vectorizer events.
pub trait VectorizeObserver: Send + Sync {
    /// Called for every event. The default ignores it.
    fn on_event(&self, _event: &VectorizeEvent) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl VectorizeObserver for NoopObserver {}

/// Observer that writes events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl VectorizeObserver for LogObserver {
    fn on_event(&self, event: &VectorizeEvent) {
        match event {
            VectorizeEvent::AttemptStarted { ops } => debug!("vec-opt-loop: {} operations", ops),
            VectorizeEvent::StageEntered(stage) => debug!("vec-opt-loop: {}", stage),
            VectorizeEvent::GuardsHoisted { count } => {
                debug!("vec-opt-loop: {} guards moved to loop header", count)
            }
            VectorizeEvent::PacksFormed {
                packs,
                accumulating,
            } => debug!("vec-opt-loop: {} packs ({} accumulating)", packs, accumulating),
            VectorizeEvent::Accepted {
                unroll_factor,
                ops_before,
                ops_after,
                savings,
            } => info!(
                "vecopt factor: {} opcount: ({} -> {}) savings: {}",
                unroll_factor, ops_before, ops_after, savings
            ),
            VectorizeEvent::Rejected(err @ VectorizeError::Internal(_)) => {
                warn!("failed to vectorize loop: {}", err)
            }
            VectorizeEvent::Rejected(err) => debug!("vec-opt-loop: {}", err),
        }
    }
}

/// Observer that buffers events.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<VectorizeEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events recorded so far.
    pub fn events(&self) -> Vec<VectorizeEvent> {
        self.events.lock().clone()
    }

    /// Stages entered, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                VectorizeEvent::StageEntered(stage) => Some(*stage),
                _ => None,
            })
            .collect()
    }

    /// Check if a stage was entered.
    pub fn entered(&self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl VectorizeObserver for RecordingObserver {
    fn on_event(&self, event: &VectorizeEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let rec = RecordingObserver::new();
        rec.on_event(&VectorizeEvent::AttemptStarted { ops: 3 });
        rec.on_event(&VectorizeEvent::StageEntered(Stage::Scan));
        rec.on_event(&VectorizeEvent::StageEntered(Stage::Unroll));
        assert_eq!(rec.events().len(), 3);
        assert_eq!(rec.stages(), vec![Stage::Scan, Stage::Unroll]);
        assert!(rec.entered(Stage::Unroll));
        assert!(!rec.entered(Stage::Schedule));
        rec.clear();
        assert!(rec.events().is_empty());
    }

    #[test]
    fn test_noop_and_log_observers_accept_events() {
        let event = VectorizeEvent::Rejected(VectorizeError::Internal("x".into()));
        NoopObserver.on_event(&event);
        LogObserver.on_event(&event);
    }
}
