//! Phase deliverables and the verifier that decides whether a phase is done.
//!
//! A deliverable is an output artifact whose presence, structural validity,
//! and freshness prove that a phase completed. Paths are caller-supplied
//! templates rendered per job. The verifier reads the filesystem on every
//! call; metadata flags are only a hint that is always re-validated.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::descriptor::JobDescriptor;
use crate::error::CoreError;
use crate::fingerprint::{Fingerprint, FingerprintSet};
use crate::metadata::{quarantine_file, JobMetadata};
use crate::types::{Phase, Timestamp};

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Minimal structural check applied to an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// The path exists.
    Exists,
    /// A non-empty file, or a directory with at least one entry.
    #[default]
    NonEmpty,
    /// A file that parses as JSON.
    Json,
}

/// A declared artifact: path template plus validity check.
///
/// Templates may reference `{job_dir}`, `{name}`, `{fingerprint}`,
/// `{fingerprint_short}`, and any scalar descriptor parameter by dotted
/// path (`{mesh.nx}`). Relative paths resolve against the job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub path: String,
    #[serde(default)]
    pub check: Validity,
}

impl Deliverable {
    pub fn new(path: impl Into<String>, check: Validity) -> Self {
        Self {
            path: path.into(),
            check,
        }
    }
}

/// Deliverables for every phase of a job.
///
/// Run has exactly one primary result artifact; Extract has one or more
/// summary artifacts; Setup may declare any number, including none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableSet {
    #[serde(default)]
    pub setup: Vec<Deliverable>,
    pub run: Deliverable,
    pub extract: Vec<Deliverable>,
}

impl DeliverableSet {
    /// Reject declarations that break the per-phase conventions.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.extract.is_empty() {
            return Err(CoreError::Validation(
                "Extract phase must declare at least one deliverable".to_string(),
            ));
        }
        let all = self.setup.iter().chain([&self.run]).chain(&self.extract);
        for deliverable in all {
            if deliverable.path.trim().is_empty() {
                return Err(CoreError::Validation(
                    "Deliverable path template must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Render every template for a concrete job.
    pub fn resolve(&self, ctx: &TemplateContext<'_>) -> Result<ResolvedDeliverables, CoreError> {
        self.validate()?;
        let render = |d: &Deliverable| -> Result<ResolvedDeliverable, CoreError> {
            Ok(ResolvedDeliverable {
                path: ctx.resolve_path(&d.path)?,
                check: d.check,
            })
        };
        Ok(ResolvedDeliverables {
            setup: self.setup.iter().map(render).collect::<Result<_, _>>()?,
            run: render(&self.run)?,
            extract: self.extract.iter().map(render).collect::<Result<_, _>>()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

/// Values available to deliverable path templates.
pub struct TemplateContext<'a> {
    pub job_dir: &'a Path,
    pub name: &'a str,
    pub fingerprint: &'a Fingerprint,
    pub descriptor: &'a JobDescriptor,
}

impl TemplateContext<'_> {
    /// Substitute `{placeholders}` in `template`.
    pub fn render(&self, template: &str) -> Result<String, CoreError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                CoreError::Validation(format!("Unclosed placeholder in template '{template}'"))
            })?;
            let key = &after[..close];
            out.push_str(&self.lookup(key, template)?);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, key: &str, template: &str) -> Result<String, CoreError> {
        match key {
            "job_dir" => Ok(self.job_dir.display().to_string()),
            "name" => Ok(self.name.to_string()),
            "fingerprint" => Ok(self.fingerprint.to_string()),
            "fingerprint_short" => Ok(self.fingerprint.short().to_string()),
            param => self.descriptor.scalar_text(param).ok_or_else(|| {
                CoreError::Validation(format!(
                    "Template '{template}' references '{param}', which is not a scalar job parameter"
                ))
            }),
        }
    }

    /// Render `template` and anchor relative results at the job directory.
    pub fn resolve_path(&self, template: &str) -> Result<PathBuf, CoreError> {
        let rendered = PathBuf::from(self.render(template)?);
        if rendered.is_absolute() {
            Ok(rendered)
        } else {
            Ok(self.job_dir.join(rendered))
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDeliverable {
    pub path: PathBuf,
    pub check: Validity,
}

/// Concrete artifact paths for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDeliverables {
    pub setup: Vec<ResolvedDeliverable>,
    pub run: ResolvedDeliverable,
    pub extract: Vec<ResolvedDeliverable>,
}

impl ResolvedDeliverables {
    pub fn for_phase(&self, phase: Phase) -> &[ResolvedDeliverable] {
        match phase {
            Phase::Setup => &self.setup,
            Phase::Run => std::slice::from_ref(&self.run),
            Phase::Extract => &self.extract,
        }
    }

    /// Path of the Run phase's primary result artifact.
    pub fn primary_output(&self) -> &Path {
        &self.run.path
    }

    /// Remove whatever a phase left behind. Used to discard partial output
    /// from an interrupted phase; missing files are ignored.
    pub fn discard(&self, phase: Phase) -> Result<(), CoreError> {
        for deliverable in self.for_phase(phase) {
            let path = &deliverable.path;
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => {
                    tracing::debug!(%phase, path = %path.display(), "Discarded partial deliverable");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::io(path, e)),
            }
        }
        Ok(())
    }

    /// Move every invalid artifact of `phase` aside.
    pub fn quarantine_invalid(&self, phase: Phase) -> Result<Vec<PathBuf>, CoreError> {
        let mut moved = Vec::new();
        for deliverable in self.for_phase(phase) {
            if let Err(ArtifactProblem::Invalid { path, .. }) = check_artifact(deliverable, None) {
                moved.push(quarantine_file(&path)?);
            }
        }
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// Artifact checks
// ---------------------------------------------------------------------------

/// Why an artifact does not prove completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactProblem {
    Missing(PathBuf),
    Invalid { path: PathBuf, reason: String },
    /// Modified before the recorded setup timestamp.
    Outdated { path: PathBuf, modified: Timestamp },
}

/// Check one artifact's presence, structure, and (optionally) freshness.
///
/// Freshness compares whole seconds: an artifact modified in the same
/// second as `not_before` counts as fresh.
pub fn check_artifact(
    deliverable: &ResolvedDeliverable,
    not_before: Option<Timestamp>,
) -> Result<(), ArtifactProblem> {
    let path = &deliverable.path;
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Err(ArtifactProblem::Missing(path.clone())),
    };

    let invalid = |reason: String| ArtifactProblem::Invalid {
        path: path.clone(),
        reason,
    };

    match deliverable.check {
        Validity::Exists => {}
        Validity::NonEmpty => {
            if meta.is_dir() {
                let has_entry = fs::read_dir(path)
                    .map_err(|e| invalid(e.to_string()))?
                    .next()
                    .is_some();
                if !has_entry {
                    return Err(invalid("directory is empty".to_string()));
                }
            } else if meta.len() == 0 {
                return Err(invalid("file is empty".to_string()));
            }
        }
        Validity::Json => {
            let bytes = fs::read(path).map_err(|e| invalid(e.to_string()))?;
            serde_json::from_slice::<serde::de::IgnoredAny>(&bytes)
                .map_err(|e| invalid(format!("not valid JSON: {e}")))?;
        }
    }

    if let Some(not_before) = not_before {
        let modified: Timestamp = meta
            .modified()
            .map_err(|e| invalid(format!("modification time unavailable: {e}")))?
            .into();
        if modified.timestamp() < not_before.timestamp() {
            return Err(ArtifactProblem::Outdated {
                path: path.clone(),
                modified,
            });
        }
    }
    Ok(())
}

fn check_all(
    deliverables: &[ResolvedDeliverable],
    not_before: Option<Timestamp>,
) -> Result<(), ArtifactProblem> {
    deliverables
        .iter()
        .try_for_each(|d| check_artifact(d, not_before))
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Completion state of one phase, as proven by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Stale,
    Done,
}

/// Why a phase received its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReason {
    /// No metadata record exists for the job.
    NoRecord,
    /// The record does not mark this phase complete.
    Unverified,
    /// Recorded phase fingerprint differs from the current one.
    FingerprintChanged,
    Artifact(ArtifactProblem),
    /// Record, fingerprint, and artifacts all agree.
    Verified,
    /// Unsafe fast path: artifacts present and valid, record ignored.
    FastPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: PhaseStatus,
    pub reason: StatusReason,
}

impl Verdict {
    fn new(status: PhaseStatus, reason: StatusReason) -> Self {
        Self { status, reason }
    }

    pub fn is_done(&self) -> bool {
        self.status == PhaseStatus::Done
    }

    /// Whether the verdict stems from a structurally invalid artifact.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self.reason,
            StatusReason::Artifact(ArtifactProblem::Invalid { .. })
        )
    }
}

/// Decides per phase whether a job's outputs are done, stale, or absent.
pub struct DeliverableVerifier<'a> {
    deliverables: &'a ResolvedDeliverables,
    fingerprints: &'a FingerprintSet,
    unsafe_fast_path: bool,
}

impl<'a> DeliverableVerifier<'a> {
    pub fn new(deliverables: &'a ResolvedDeliverables, fingerprints: &'a FingerprintSet) -> Self {
        Self {
            deliverables,
            fingerprints,
            unsafe_fast_path: false,
        }
    }

    /// Accept a phase purely on deliverable presence, ignoring the record
    /// and fingerprint. Opt-in only.
    pub fn with_unsafe_fast_path(mut self, enabled: bool) -> Self {
        self.unsafe_fast_path = enabled;
        self
    }

    /// Status of `phase`, read from the filesystem on every call.
    pub fn status(&self, phase: Phase, metadata: Option<&JobMetadata>) -> Verdict {
        let artifacts = self.deliverables.for_phase(phase);

        if self.unsafe_fast_path && !artifacts.is_empty() && check_all(artifacts, None).is_ok() {
            return Verdict::new(PhaseStatus::Done, StatusReason::FastPath);
        }

        let Some(metadata) = metadata else {
            return Verdict::new(PhaseStatus::NotStarted, StatusReason::NoRecord);
        };
        if !metadata.is_done(phase) {
            return Verdict::new(PhaseStatus::NotStarted, StatusReason::Unverified);
        }
        if metadata.phase_fingerprint(phase) != Some(self.fingerprints.phase(phase)) {
            return Verdict::new(PhaseStatus::Stale, StatusReason::FingerprintChanged);
        }
        match check_all(artifacts, Some(metadata.setup_timestamp)) {
            Ok(()) => Verdict::new(PhaseStatus::Done, StatusReason::Verified),
            Err(problem) => Verdict::new(PhaseStatus::Stale, StatusReason::Artifact(problem)),
        }
    }

    /// Check a phase's artifacts right after it executed.
    ///
    /// Used before writing metadata: the phase only counts as complete if
    /// its outputs exist, are valid, and postdate `setup_timestamp`.
    pub fn verify_fresh(
        &self,
        phase: Phase,
        setup_timestamp: Timestamp,
    ) -> Result<(), ArtifactProblem> {
        check_all(self.deliverables.for_phase(phase), Some(setup_timestamp))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::fingerprint::Fingerprinter;
    use crate::metadata::MetadataStore;

    struct Fixture {
        dir: tempfile::TempDir,
        fingerprints: FingerprintSet,
        resolved: ResolvedDeliverables,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = JobDescriptor::from_value(json!({"case": "bend", "steps": 3})).unwrap();
        let fingerprints = Fingerprinter::default().compute(&descriptor);
        let set = DeliverableSet {
            setup: vec![Deliverable::new("input/{case}.json", Validity::Json)],
            run: Deliverable::new("result.bin", Validity::NonEmpty),
            extract: vec![Deliverable::new("summary.json", Validity::Json)],
        };
        let ctx = TemplateContext {
            job_dir: dir.path(),
            name: "bend",
            fingerprint: &fingerprints.job,
            descriptor: &descriptor,
        };
        let resolved = set.resolve(&ctx).unwrap();
        Fixture {
            dir,
            fingerprints,
            resolved,
        }
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn completed_through_run(f: &Fixture, setup_ts: i64) -> JobMetadata {
        MetadataStore::record_setup(f.dir.path(), &f.fingerprints, ts(setup_ts)).unwrap();
        MetadataStore::update(f.dir.path(), Phase::Run, &f.fingerprints).unwrap()
    }

    #[test]
    fn templates_render_params_and_builtins() {
        let f = fixture();
        assert_eq!(
            f.resolved.setup[0].path,
            f.dir.path().join("input").join("bend.json")
        );
        assert_eq!(f.resolved.primary_output(), f.dir.path().join("result.bin"));
    }

    #[test]
    fn unknown_placeholder_is_a_validation_error() {
        let f = fixture();
        let descriptor = JobDescriptor::from_value(json!({})).unwrap();
        let ctx = TemplateContext {
            job_dir: f.dir.path(),
            name: "x",
            fingerprint: &f.fingerprints.job,
            descriptor: &descriptor,
        };
        assert_matches!(ctx.render("{missing}.bin"), Err(CoreError::Validation(_)));
        assert_matches!(ctx.render("{unclosed.bin"), Err(CoreError::Validation(_)));
        assert_eq!(ctx.render("{name}-{fingerprint_short}").unwrap().len(), 14);
    }

    #[test]
    fn extract_requires_a_deliverable() {
        let set = DeliverableSet {
            setup: vec![],
            run: Deliverable::new("r", Validity::Exists),
            extract: vec![],
        };
        assert_matches!(set.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn no_record_is_not_started() {
        let f = fixture();
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        assert_eq!(
            verifier.status(Phase::Run, None).status,
            PhaseStatus::NotStarted
        );
    }

    #[test]
    fn run_mtime_after_setup_is_done_before_is_stale() {
        let f = fixture();
        let meta = completed_through_run(&f, 100);
        let result = f.resolved.primary_output().to_path_buf();
        fs::write(&result, b"payload").unwrap();
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);

        set_mtime(&result, 150);
        assert_eq!(
            verifier.status(Phase::Run, Some(&meta)),
            Verdict::new(PhaseStatus::Done, StatusReason::Verified)
        );

        set_mtime(&result, 90);
        let verdict = verifier.status(Phase::Run, Some(&meta));
        assert_eq!(verdict.status, PhaseStatus::Stale);
        assert_matches!(
            verdict.reason,
            StatusReason::Artifact(ArtifactProblem::Outdated { .. })
        );
    }

    #[test]
    fn same_second_counts_as_fresh() {
        let f = fixture();
        let meta = completed_through_run(&f, 100);
        fs::write(f.resolved.primary_output(), b"payload").unwrap();
        set_mtime(f.resolved.primary_output(), 100);
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        assert!(verifier.status(Phase::Run, Some(&meta)).is_done());
    }

    #[test]
    fn deleted_artifact_is_stale() {
        let f = fixture();
        let meta = completed_through_run(&f, 100);
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        let verdict = verifier.status(Phase::Run, Some(&meta));
        assert_eq!(verdict.status, PhaseStatus::Stale);
        assert_matches!(
            verdict.reason,
            StatusReason::Artifact(ArtifactProblem::Missing(_))
        );
    }

    #[test]
    fn invalid_artifact_is_stale_and_corrupt() {
        let f = fixture();
        MetadataStore::record_setup(f.dir.path(), &f.fingerprints, ts(100)).unwrap();
        let meta = MetadataStore::load(f.dir.path()).unwrap().unwrap();
        let input = &f.resolved.setup[0].path;
        fs::create_dir_all(input.parent().unwrap()).unwrap();
        fs::write(input, b"{ truncated").unwrap();

        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        let verdict = verifier.status(Phase::Setup, Some(&meta));
        assert_eq!(verdict.status, PhaseStatus::Stale);
        assert!(verdict.is_corrupt());

        let moved = f.resolved.quarantine_invalid(Phase::Setup).unwrap();
        assert_eq!(moved.len(), 1);
        assert!(!input.exists());
    }

    #[test]
    fn unset_flag_is_not_started_even_with_artifacts() {
        let f = fixture();
        MetadataStore::record_setup(f.dir.path(), &f.fingerprints, ts(100)).unwrap();
        let meta = MetadataStore::load(f.dir.path()).unwrap().unwrap();
        fs::write(f.dir.path().join("summary.json"), b"{}").unwrap();

        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        assert_eq!(
            verifier.status(Phase::Extract, Some(&meta)),
            Verdict::new(PhaseStatus::NotStarted, StatusReason::Unverified)
        );
    }

    #[test]
    fn fingerprint_change_is_stale() {
        let f = fixture();
        let meta = completed_through_run(&f, 100);
        fs::write(f.resolved.primary_output(), b"payload").unwrap();

        let other = JobDescriptor::from_value(json!({"case": "bend", "steps": 4})).unwrap();
        let changed = Fingerprinter::default().compute(&other);
        let verifier = DeliverableVerifier::new(&f.resolved, &changed);
        assert_eq!(
            verifier.status(Phase::Run, Some(&meta)),
            Verdict::new(PhaseStatus::Stale, StatusReason::FingerprintChanged)
        );
    }

    #[test]
    fn fast_path_ignores_record_and_fingerprint() {
        let f = fixture();
        fs::write(f.resolved.primary_output(), b"payload").unwrap();
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        assert_eq!(
            verifier.status(Phase::Run, None).status,
            PhaseStatus::NotStarted
        );

        let fast = DeliverableVerifier::new(&f.resolved, &f.fingerprints).with_unsafe_fast_path(true);
        assert_eq!(
            fast.status(Phase::Run, None),
            Verdict::new(PhaseStatus::Done, StatusReason::FastPath)
        );
    }

    #[test]
    fn verify_fresh_rejects_leftovers_from_before_setup() {
        let f = fixture();
        fs::write(f.resolved.primary_output(), b"old").unwrap();
        set_mtime(f.resolved.primary_output(), 10);
        let verifier = DeliverableVerifier::new(&f.resolved, &f.fingerprints);
        let now: Timestamp = SystemTime::now().into();
        assert_matches!(
            verifier.verify_fresh(Phase::Run, now),
            Err(ArtifactProblem::Outdated { .. })
        );
    }

    #[test]
    fn discard_removes_partial_output() {
        let f = fixture();
        fs::write(f.resolved.primary_output(), b"partial").unwrap();
        f.resolved.discard(Phase::Run).unwrap();
        assert!(!f.resolved.primary_output().exists());
        // Second discard finds nothing and still succeeds.
        f.resolved.discard(Phase::Run).unwrap();
    }
}
