//! Phase-duration math behind the profiler's progress and ETA.
//!
//! Provides rolling means over historical timings, phase weighting, and
//! remaining-time projection. The stateful side (scopes, persistence,
//! monotonic display) lives in [`crate::profiler`].

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::types::Phase;

/// Timed runs of the least-sampled phase needed before an ETA is trusted.
pub const HIGH_CONFIDENCE_SAMPLES: u32 = 10;
/// Fewer timed runs than this leave the ETA a rough guess.
pub const MEDIUM_CONFIDENCE_SAMPLES: u32 = 3;

// ---------------------------------------------------------------------------
// Display limits
// ---------------------------------------------------------------------------

/// Remaining time shown while a job is still running never drops below this.
pub const MIN_REMAINING_SECS: f64 = 1.0;

/// Percent shown while a job is still running never exceeds this.
pub const MAX_PERCENT_BEFORE_FINISH: f64 = 99.0;

/// Upper bound on a time-derived in-phase fraction (the phase may overrun).
pub const MAX_TIME_DERIVED_FRACTION: f64 = 0.95;

/// How much phase-timing history backs an ETA. Driven by the phase with
/// the fewest recorded samples, since one unknown phase skews the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateConfidence {
    /// No phase timings at all; durations come from weights alone.
    None,
    Low,
    Medium,
    High,
}

impl EstimateConfidence {
    pub fn from_sample_count(samples: u32) -> Self {
        match samples {
            0 => Self::None,
            n if n < MEDIUM_CONFIDENCE_SAMPLES => Self::Low,
            n if n < HIGH_CONFIDENCE_SAMPLES => Self::Medium,
            _ => Self::High,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase weights
// ---------------------------------------------------------------------------

/// Relative share of total job time spent in each phase.
///
/// Configured values are the neutral distribution used before any full run
/// has been observed; afterwards weights come from historical proportions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct PhaseWeights {
    #[validate(range(min = 0.0))]
    pub setup: f64,
    #[validate(range(min = 0.0))]
    pub run: f64,
    #[validate(range(min = 0.0))]
    pub extract: f64,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            setup: 0.1,
            run: 0.8,
            extract: 0.1,
        }
    }
}

impl PhaseWeights {
    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Setup => self.setup,
            Phase::Run => self.run,
            Phase::Extract => self.extract,
        }
    }

    fn total(&self) -> f64 {
        self.setup + self.run + self.extract
    }

    /// Scale to sum to one; an all-zero distribution becomes uniform.
    pub fn normalized(&self) -> Self {
        let total = self.total();
        if total <= 0.0 || !total.is_finite() {
            let third = 1.0 / 3.0;
            return Self {
                setup: third,
                run: third,
                extract: third,
            };
        }
        Self {
            setup: self.setup / total,
            run: self.run / total,
            extract: self.extract / total,
        }
    }

    /// Weights proportional to observed phase durations.
    ///
    /// Returns `None` when the durations sum to zero; a zero-duration phase
    /// simply receives zero weight.
    pub fn from_durations(durations: [f64; 3]) -> Option<Self> {
        let weights = Self {
            setup: durations[0].max(0.0),
            run: durations[1].max(0.0),
            extract: durations[2].max(0.0),
        };
        (weights.total() > 0.0).then(|| weights.normalized())
    }
}

// ---------------------------------------------------------------------------
// Incremental mean
// ---------------------------------------------------------------------------

/// Compute the incremental (online) mean after observing a new value.
///
/// Formula: `new_avg = old_avg + (new_value - old_avg) / new_count`
pub fn incremental_mean(old_avg: f64, new_value: f64, new_count: u32) -> f64 {
    if new_count == 0 {
        return old_avg;
    }
    old_avg + (new_value - old_avg) / f64::from(new_count)
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Fill phases without history from the phases that have it.
///
/// Known durations fix a time scale (`Σ known / Σ known weights`), and each
/// unknown phase gets `scale * weight`. With nothing known, or only
/// zero-weight phases known, every unknown phase stays `None`.
pub fn expected_durations(known: [Option<f64>; 3], weights: &PhaseWeights) -> [Option<f64>; 3] {
    let weights = weights.normalized();
    let mut known_secs = 0.0;
    let mut known_weight = 0.0;
    for phase in Phase::ALL {
        if let Some(secs) = known[phase.index()] {
            known_secs += secs;
            known_weight += weights.get(phase);
        }
    }
    let scale = (known_weight > 0.0).then(|| known_secs / known_weight);

    let mut out = known;
    for phase in Phase::ALL {
        if out[phase.index()].is_none() {
            out[phase.index()] = scale.map(|s| s * weights.get(phase));
        }
    }
    out
}

/// Remaining seconds for a job currently `fraction` of the way through
/// `current`:
///
/// `(1 - fraction) * expected(current) + Σ expected(future phases)`.
///
/// Returns `None` if any needed duration is unknown.
pub fn remaining_secs(current: Phase, fraction: f64, expected: &[Option<f64>; 3]) -> Option<f64> {
    let fraction = fraction.clamp(0.0, 1.0);
    let mut remaining = (1.0 - fraction) * expected[current.index()]?;
    for phase in current.downstream() {
        remaining += expected[phase.index()]?;
    }
    Some(remaining.max(0.0))
}

/// Project the total length of a phase that may be overrunning its history.
///
/// If the phase has already taken longer than expected, its length is
/// re-derived from elapsed time and progress so remaining time never
/// collapses to zero while work is still going on.
pub fn projected_phase_secs(expected: Option<f64>, elapsed: f64, fraction: f64) -> Option<f64> {
    let from_progress = (fraction > 0.0).then(|| elapsed / fraction);
    match (expected, from_progress) {
        (Some(e), Some(p)) if elapsed > e => Some(p.max(elapsed)),
        (Some(e), _) if elapsed > e => Some(elapsed + MIN_REMAINING_SECS),
        (Some(e), _) => Some(e),
        (None, p) => p,
    }
}

/// Overall completion percent from finished phases and in-phase progress.
pub fn overall_percent(
    finished: impl IntoIterator<Item = Phase>,
    current: Option<(Phase, f64)>,
    weights: &PhaseWeights,
) -> f64 {
    let weights = weights.normalized();
    let mut done: f64 = finished.into_iter().map(|p| weights.get(p)).sum();
    if let Some((phase, fraction)) = current {
        done += weights.get(phase) * fraction.clamp(0.0, 1.0);
    }
    (done * 100.0).clamp(0.0, 100.0)
}
