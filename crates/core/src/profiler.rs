//! Phase and subtask timing with persisted history and progress/ETA.
//!
//! A [`Profiler`] is constructed per orchestrator and handed (as a cheap
//! clone) to whatever executes a phase. Timing scopes are RAII guards: the
//! clock stops and a [`TimingRecord`] is written when the guard drops, on
//! every exit path. Only scopes marked complete feed the persisted rolling
//! means, so aborted work never skews future estimates.
//!
//! Displayed percent is monotonically non-decreasing within a run and the
//! remaining time only reaches zero in [`Profiler::finish_run`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::estimation::{
    expected_durations, incremental_mean, overall_percent, projected_phase_secs, remaining_secs,
    EstimateConfidence, PhaseWeights, MAX_PERCENT_BEFORE_FINISH, MAX_TIME_DERIVED_FRACTION,
    MIN_REMAINING_SECS,
};
use crate::metadata::{quarantine_file, write_atomic};
use crate::types::Phase;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Rolling mean for one timing key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStat {
    pub mean_secs: f64,
    pub samples: u32,
}

/// Historical timing averages, shared across process invocations.
///
/// Keys are `"<phase>"` for whole phases and `"<phase>/<subtask>"` for
/// subtasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingHistory {
    /// Runs in which all three phases executed to completion.
    #[serde(default)]
    pub completed_runs: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, TimingStat>,
}

impl TimingHistory {
    /// Load history from `path`. A missing file is an empty history; a
    /// corrupt one is quarantined and replaced by an empty history, since
    /// estimates are advisory.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CoreError::io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(history) => Ok(history),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Timing history unreadable");
                quarantine_file(path)?;
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CoreError::Internal(format!("serialize timing history: {e}")))?;
        write_atomic(path, &bytes)
    }

    /// Fold a new sample into the rolling mean for `key`.
    pub fn record(&mut self, key: &str, secs: f64) {
        let stat = self.entries.entry(key.to_string()).or_insert(TimingStat {
            mean_secs: 0.0,
            samples: 0,
        });
        stat.samples = stat.samples.saturating_add(1);
        stat.mean_secs = incremental_mean(stat.mean_secs, secs, stat.samples);
    }

    pub fn mean(&self, key: &str) -> Option<f64> {
        self.entries.get(key).map(|s| s.mean_secs)
    }

    pub fn samples(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |s| s.samples)
    }

    fn phase_means(&self) -> [Option<f64>; 3] {
        Phase::ALL.map(|p| self.mean(p.as_str()))
    }

    /// Historical means of the subtasks recorded under `phase`.
    fn subtask_means(&self, phase: Phase) -> impl Iterator<Item = (&str, f64)> {
        let prefix = format!("{}/", phase.as_str());
        self.entries.iter().filter_map(move |(key, stat)| {
            key.strip_prefix(prefix.as_str())
                .map(|name| (name, stat.mean_secs))
        })
    }
}

/// Timing key for a phase or a phase subtask.
pub fn timing_key(phase: Phase, subtask: Option<&str>) -> String {
    match subtask {
        Some(name) => format!("{}/{name}", phase.as_str()),
        None => phase.as_str().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Records and snapshots
// ---------------------------------------------------------------------------

/// One timed scope from the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    pub phase: Phase,
    pub subtask: Option<String>,
    pub duration: Duration,
    /// Whether the scope was marked complete before it ended.
    pub completed: bool,
}

/// What a consumer sees at one moment of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub percent: f64,
    pub phase: Option<Phase>,
    /// Remaining time; `None` until anything can be estimated.
    pub eta: Option<Duration>,
    pub confidence: EstimateConfidence,
}

// ---------------------------------------------------------------------------
// Profiler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunState {
    current: Option<(Phase, Instant)>,
    finished: BTreeSet<Phase>,
    executed: BTreeSet<Phase>,
    reported_fraction: Option<f64>,
    subtasks_done: BTreeSet<String>,
    displayed_percent: f64,
    finished_run: bool,
}

#[derive(Debug)]
struct ProfilerState {
    history: TimingHistory,
    store: Option<PathBuf>,
    configured_weights: PhaseWeights,
    records: Vec<TimingRecord>,
    run: RunState,
}

impl ProfilerState {
    fn persist(&self) {
        if let Some(path) = &self.store {
            if let Err(e) = self.history.save(path) {
                tracing::warn!(error = %e, "Failed to persist timing history");
            }
        }
    }

    /// Configured weights until a full run has been observed, historical
    /// proportions afterwards.
    fn weights(&self) -> PhaseWeights {
        if self.history.completed_runs > 0 {
            let means = self.history.phase_means();
            if let [Some(s), Some(r), Some(e)] = means {
                if let Some(derived) = PhaseWeights::from_durations([s, r, e]) {
                    return derived;
                }
            }
        }
        self.configured_weights
    }

    fn current_fraction(&self, phase: Phase, elapsed: f64, expected: Option<f64>) -> f64 {
        if let Some(fraction) = self.run.reported_fraction {
            return fraction;
        }

        let subtasks: Vec<(&str, f64)> = self.history.subtask_means(phase).collect();
        let total: f64 = subtasks.iter().map(|(_, secs)| secs).sum();
        if total > 0.0 && !self.run.subtasks_done.is_empty() {
            let done: f64 = subtasks
                .iter()
                .filter(|(name, _)| self.run.subtasks_done.contains(*name))
                .map(|(_, secs)| secs)
                .sum();
            return (done / total).clamp(0.0, 1.0);
        }

        match expected {
            Some(e) if e > 0.0 => (elapsed / e).min(MAX_TIME_DERIVED_FRACTION),
            _ => 0.0,
        }
    }

    fn snapshot(&mut self) -> ProgressSnapshot {
        if self.run.finished_run {
            return ProgressSnapshot {
                percent: 100.0,
                phase: None,
                eta: Some(Duration::ZERO),
                confidence: self.confidence(),
            };
        }

        let weights = self.weights();
        // Finished phases keep their historical means: they still set the
        // time scale for phases without history, and `remaining_secs` only
        // sums the current phase and those after it.
        let mut known = self.history.phase_means();

        let current = self.run.current.map(|(phase, started)| {
            let elapsed = started.elapsed().as_secs_f64();
            let filled = expected_durations(known, &weights);
            let fraction = self.current_fraction(phase, elapsed, filled[phase.index()]);
            (phase, elapsed, fraction)
        });

        let (eta, phase) = match current {
            Some((phase, elapsed, fraction)) => {
                let projected = projected_phase_secs(known[phase.index()], elapsed, fraction);
                known[phase.index()] = projected;
                let filled = expected_durations(known, &weights);
                let remaining = remaining_secs(phase, fraction, &filled);
                (remaining, Some(phase))
            }
            None => {
                let next = Phase::ALL
                    .into_iter()
                    .find(|p| !self.run.finished.contains(p));
                let filled = expected_durations(known, &weights);
                (next.and_then(|p| remaining_secs(p, 0.0, &filled)), None)
            }
        };

        let computed = overall_percent(
            self.run.finished.iter().copied(),
            current.map(|(phase, _, fraction)| (phase, fraction)),
            &weights,
        )
        .min(MAX_PERCENT_BEFORE_FINISH);
        self.run.displayed_percent = self.run.displayed_percent.max(computed);

        ProgressSnapshot {
            percent: self.run.displayed_percent,
            phase,
            eta: eta
                .filter(|secs| secs.is_finite())
                .map(|secs| Duration::from_secs_f64(secs.max(MIN_REMAINING_SECS))),
            confidence: self.confidence(),
        }
    }

    fn confidence(&self) -> EstimateConfidence {
        let samples = Phase::ALL
            .iter()
            .map(|p| self.history.samples(p.as_str()))
            .min()
            .unwrap_or(0);
        EstimateConfidence::from_sample_count(samples)
    }
}

/// Times phases and subtasks, keeps historical averages, and turns them
/// into monotonic progress and remaining-time estimates.
///
/// Cloning yields another handle to the same profiler.
#[derive(Debug, Clone)]
pub struct Profiler {
    inner: Arc<Mutex<ProfilerState>>,
}

impl Profiler {
    /// An in-memory profiler with no persisted history.
    pub fn new(weights: PhaseWeights) -> Self {
        Self::from_parts(TimingHistory::default(), None, weights)
    }

    /// A profiler whose history is loaded from and saved to `path`.
    pub fn with_store(path: impl Into<PathBuf>, weights: PhaseWeights) -> Result<Self, CoreError> {
        let path = path.into();
        let history = TimingHistory::load(&path)?;
        Ok(Self::from_parts(history, Some(path), weights))
    }

    fn from_parts(history: TimingHistory, store: Option<PathBuf>, weights: PhaseWeights) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProfilerState {
                history,
                store,
                configured_weights: weights,
                records: Vec::new(),
                run: RunState::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProfilerState> {
        // A panic while holding the lock cannot leave the state half-updated
        // in a way that matters for estimates.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset per-run progress. History is kept.
    pub fn begin_run(&self) {
        let mut state = self.lock();
        state.run = RunState::default();
        state.records.clear();
    }

    /// Start timing a phase. The phase becomes the current one for progress.
    pub fn phase(&self, phase: Phase) -> PhaseScope {
        let started = Instant::now();
        {
            let mut state = self.lock();
            state.run.current = Some((phase, started));
            state.run.reported_fraction = None;
            state.run.subtasks_done.clear();
        }
        PhaseScope {
            profiler: self.clone(),
            phase,
            started,
            completed: false,
        }
    }

    /// Count a phase as finished without executing it.
    pub fn skip_phase(&self, phase: Phase) {
        self.lock().run.finished.insert(phase);
    }

    /// Start timing a named subtask of the current phase.
    ///
    /// Returns `None` when no phase scope is open.
    pub fn subtask(&self, name: &str) -> Option<SubtaskScope> {
        let phase = self.lock().run.current.map(|(phase, _)| phase)?;
        Some(SubtaskScope {
            profiler: self.clone(),
            phase,
            name: name.to_string(),
            started: Instant::now(),
            completed: false,
        })
    }

    /// Report explicit progress within the current phase (`0.0..=1.0`).
    ///
    /// Reports lower than an earlier one are ignored.
    pub fn report_fraction(&self, fraction: f64) {
        let mut state = self.lock();
        if state.run.current.is_none() || !fraction.is_finite() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let previous = state.run.reported_fraction.unwrap_or(0.0);
        state.run.reported_fraction = Some(previous.max(fraction));
    }

    /// Current progress and remaining time.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }

    /// Close the run. When every phase executed to completion, the run
    /// counts towards re-deriving phase weights from history.
    pub fn finish_run(&self) -> ProgressSnapshot {
        let mut state = self.lock();
        let all_finished = Phase::ALL.iter().all(|p| state.run.finished.contains(p));
        let all_executed = Phase::ALL.iter().all(|p| state.run.executed.contains(p));
        if all_finished {
            state.run.finished_run = true;
            state.run.current = None;
        }
        if all_finished && all_executed {
            state.history.completed_runs = state.history.completed_runs.saturating_add(1);
            state.persist();
        }
        state.snapshot()
    }

    /// Timing records of the current run, in completion order.
    pub fn records(&self) -> Vec<TimingRecord> {
        self.lock().records.clone()
    }

    /// Snapshot of the historical averages.
    pub fn history(&self) -> TimingHistory {
        self.lock().history.clone()
    }

    fn close_phase(&self, phase: Phase, duration: Duration, completed: bool) {
        let mut state = self.lock();
        state.records.push(TimingRecord {
            phase,
            subtask: None,
            duration,
            completed,
        });
        if state.run.current.map(|(p, _)| p) == Some(phase) {
            state.run.current = None;
        }
        if completed {
            state.run.finished.insert(phase);
            state.run.executed.insert(phase);
            state.history.record(phase.as_str(), duration.as_secs_f64());
            state.persist();
        }
        tracing::debug!(
            %phase,
            duration_ms = duration.as_millis() as u64,
            completed,
            "Phase timing recorded",
        );
    }

    fn close_subtask(&self, phase: Phase, name: String, duration: Duration, completed: bool) {
        let mut state = self.lock();
        if completed {
            state
                .history
                .record(&timing_key(phase, Some(&name)), duration.as_secs_f64());
            if state.run.current.map(|(p, _)| p) == Some(phase) {
                state.run.subtasks_done.insert(name.clone());
            }
            state.persist();
        }
        state.records.push(TimingRecord {
            phase,
            subtask: Some(name),
            duration,
            completed,
        });
    }
}

/// Guard timing one phase. Dropping it records the duration.
#[must_use = "dropping the scope immediately records a zero-length phase"]
pub struct PhaseScope {
    profiler: Profiler,
    phase: Phase,
    started: Instant,
    completed: bool,
}

impl PhaseScope {
    /// Mark the phase as successfully completed and end the scope.
    pub fn complete(mut self) {
        self.completed = true;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl Drop for PhaseScope {
    fn drop(&mut self) {
        self.profiler
            .close_phase(self.phase, self.started.elapsed(), self.completed);
    }
}

/// Guard timing one subtask. Dropping it records the duration.
#[must_use = "dropping the scope immediately records a zero-length subtask"]
pub struct SubtaskScope {
    profiler: Profiler,
    phase: Phase,
    name: String,
    started: Instant,
    completed: bool,
}

impl SubtaskScope {
    pub fn complete(mut self) {
        self.completed = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SubtaskScope {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        self.profiler
            .close_subtask(self.phase, name, self.started.elapsed(), self.completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(phases: [f64; 3], completed_runs: u32) -> TimingHistory {
        let mut history = TimingHistory {
            completed_runs,
            ..Default::default()
        };
        for phase in Phase::ALL {
            history.record(phase.as_str(), phases[phase.index()]);
        }
        history
    }

    fn profiler_with(history: TimingHistory) -> Profiler {
        Profiler::from_parts(history, None, PhaseWeights::default())
    }

    #[test]
    fn history_rolling_mean() {
        let mut history = TimingHistory::default();
        history.record("run", 10.0);
        history.record("run", 20.0);
        assert_eq!(history.mean("run"), Some(15.0));
        assert_eq!(history.samples("run"), 2);
        assert_eq!(history.mean("setup"), None);
    }

    #[test]
    fn history_persists_across_profilers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timings.json");
        {
            let profiler = Profiler::with_store(&path, PhaseWeights::default()).unwrap();
            profiler.phase(Phase::Setup).complete();
        }
        let reloaded = TimingHistory::load(&path).unwrap();
        assert_eq!(reloaded.samples("setup"), 1);
    }

    #[test]
    fn corrupt_history_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timings.json");
        fs::write(&path, b"[[[").unwrap();
        let history = TimingHistory::load(&path).unwrap();
        assert_eq!(history, TimingHistory::default());
        assert!(!path.exists());
    }

    #[test]
    fn dropped_scope_records_but_does_not_fold() {
        let profiler = Profiler::new(PhaseWeights::default());
        {
            let _scope = profiler.phase(Phase::Run);
        }
        let records = profiler.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].completed);
        assert_eq!(profiler.history().samples("run"), 0);
    }

    #[test]
    fn completed_subtask_is_keyed_under_phase() {
        let profiler = Profiler::new(PhaseWeights::default());
        let phase = profiler.phase(Phase::Run);
        profiler.subtask("mesh").unwrap().complete();
        phase.complete();
        assert_eq!(profiler.history().samples("run/mesh"), 1);
        assert!(profiler.subtask("late").is_none());
    }

    #[test]
    fn percent_is_monotonic_and_capped_until_finish() {
        let profiler = profiler_with(seeded([10.0, 100.0, 10.0], 1));
        profiler.begin_run();
        let mut last = 0.0;

        let setup = profiler.phase(Phase::Setup);
        let s = profiler.snapshot();
        assert!(s.percent >= last);
        last = s.percent;
        setup.complete();

        let run = profiler.phase(Phase::Run);
        profiler.report_fraction(0.6);
        let s = profiler.snapshot();
        assert!(s.percent >= last);
        last = s.percent;
        // A lower report is ignored.
        profiler.report_fraction(0.2);
        let s = profiler.snapshot();
        assert!(s.percent >= last);
        last = s.percent;
        run.complete();

        let extract = profiler.phase(Phase::Extract);
        profiler.report_fraction(1.0);
        let s = profiler.snapshot();
        assert!(s.percent >= last);
        assert!(s.percent <= MAX_PERCENT_BEFORE_FINISH);
        assert!(s.eta.unwrap() >= Duration::from_secs_f64(MIN_REMAINING_SECS));
        extract.complete();

        let done = profiler.finish_run();
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.eta, Some(Duration::ZERO));
    }

    #[test]
    fn eta_uses_history_for_future_phases() {
        let profiler = profiler_with(seeded([10.0, 100.0, 20.0], 1));
        profiler.begin_run();
        profiler.skip_phase(Phase::Setup);
        let _run = profiler.phase(Phase::Run);
        profiler.report_fraction(0.5);
        let eta = profiler.snapshot().eta.unwrap().as_secs_f64();
        // Half of run (50s) plus extract (20s), give or take elapsed jitter.
        assert!((eta - 70.0).abs() < 1.0, "eta was {eta}");
    }

    #[test]
    fn eta_scales_unknown_phases_from_finished_history() {
        let mut history = TimingHistory::default();
        history.record("setup", 10.0);
        let profiler = profiler_with(history);
        profiler.begin_run();
        profiler.skip_phase(Phase::Setup);
        let _run = profiler.phase(Phase::Run);
        let eta = profiler.snapshot().eta.unwrap().as_secs_f64();
        // Setup took 10s at weight 0.1: run (0.8) ~80s, extract (0.1) ~10s.
        assert!((eta - 90.0).abs() < 1.0, "eta was {eta}");
    }

    #[test]
    fn eta_unknown_without_history_or_progress() {
        let profiler = Profiler::new(PhaseWeights::default());
        profiler.begin_run();
        let _setup = profiler.phase(Phase::Setup);
        assert_eq!(profiler.snapshot().eta, None);
        assert_eq!(profiler.snapshot().confidence, EstimateConfidence::None);
    }

    #[test]
    fn weights_derive_from_history_after_full_run() {
        let profiler = profiler_with(seeded([50.0, 25.0, 25.0], 0));
        profiler.begin_run();
        profiler.skip_phase(Phase::Setup);
        // Configured weights: setup = 10%.
        assert!((profiler.snapshot().percent - 10.0).abs() < 1e-6);

        let profiler = profiler_with(seeded([50.0, 25.0, 25.0], 1));
        profiler.begin_run();
        profiler.skip_phase(Phase::Setup);
        // Historical proportions: setup = 50%.
        assert!((profiler.snapshot().percent - 50.0).abs() < 1e-6);
    }

    #[test]
    fn zero_length_history_does_not_fault() {
        let profiler = profiler_with(seeded([0.0, 0.0, 0.0], 3));
        profiler.begin_run();
        let _setup = profiler.phase(Phase::Setup);
        let snapshot = profiler.snapshot();
        assert!(snapshot.percent.is_finite());
        assert!(snapshot.eta.unwrap() >= Duration::from_secs_f64(MIN_REMAINING_SECS));
    }

    #[test]
    fn finish_counts_only_fully_executed_runs() {
        let profiler = profiler_with(TimingHistory::default());
        profiler.begin_run();
        profiler.skip_phase(Phase::Setup);
        profiler.phase(Phase::Run).complete();
        profiler.phase(Phase::Extract).complete();
        profiler.finish_run();
        assert_eq!(profiler.history().completed_runs, 0);

        profiler.begin_run();
        for phase in Phase::ALL {
            profiler.phase(phase).complete();
        }
        profiler.finish_run();
        assert_eq!(profiler.history().completed_runs, 1);
    }
}
