//! Per-job phase completion record stored beside the job's outputs.
//!
//! The record lives at `<job_dir>/.stagehand/metadata.json`. It is only a
//! hint: the deliverable verifier re-validates every flag against the
//! filesystem. Flags only ever advance from `false` to `true` through
//! [`MetadataStore::update`], which callers invoke after verifying the
//! phase's deliverables; the only way back is [`MetadataStore::invalidate`].
//!
//! Writes go to a temporary file that is renamed over the record, so a
//! crash mid-write leaves either the old or the new record on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fingerprint::{Fingerprint, FingerprintSet};
use crate::types::{Phase, Timestamp};

/// Current schema version written to new records.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Directory (inside the job directory) holding bookkeeping files.
pub const METADATA_DIR: &str = ".stagehand";

/// File name of the metadata record.
pub const METADATA_FILE: &str = "metadata.json";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The latest failed phase attempt for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: Phase,
    /// Phase fingerprint the failed attempt ran under.
    pub fingerprint: Fingerprint,
    pub message: String,
    pub failed_at: Timestamp,
}

/// Fingerprint, phase completion flags, and timestamps for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub schema_version: u32,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub phase_fingerprints: BTreeMap<Phase, Fingerprint>,
    pub setup_done: bool,
    pub run_done: bool,
    pub extract_done: bool,
    /// Start of the setup execution that produced the current outputs.
    /// Deliverables older than this are stale.
    pub setup_timestamp: Timestamp,
    pub last_updated: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRecord>,
}

impl JobMetadata {
    /// A record with every flag unset.
    pub fn new(fingerprints: &FingerprintSet, setup_timestamp: Timestamp) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            fingerprint: fingerprints.job.clone(),
            phase_fingerprints: BTreeMap::new(),
            setup_done: false,
            run_done: false,
            extract_done: false,
            setup_timestamp,
            last_updated: Utc::now(),
            last_failure: None,
        }
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        match phase {
            Phase::Setup => self.setup_done,
            Phase::Run => self.run_done,
            Phase::Extract => self.extract_done,
        }
    }

    fn set_done(&mut self, phase: Phase, done: bool) {
        match phase {
            Phase::Setup => self.setup_done = done,
            Phase::Run => self.run_done = done,
            Phase::Extract => self.extract_done = done,
        }
    }

    /// Fingerprint the phase was verified under, if it was.
    pub fn phase_fingerprint(&self, phase: Phase) -> Option<&Fingerprint> {
        self.phase_fingerprints.get(&phase)
    }

    /// The recorded failure, if it applies to `phase` under `fingerprint`.
    pub fn failure_for(&self, phase: Phase, fingerprint: &Fingerprint) -> Option<&FailureRecord> {
        self.last_failure
            .as_ref()
            .filter(|f| f.phase == phase && &f.fingerprint == fingerprint)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Filesystem-backed persistence for [`JobMetadata`].
///
/// Stateless: every call reads the record from disk, so concurrent or
/// previous processes' writes are always observed.
pub struct MetadataStore;

impl MetadataStore {
    /// Path of the metadata record for a job directory.
    pub fn path(job_dir: &Path) -> PathBuf {
        job_dir.join(METADATA_DIR).join(METADATA_FILE)
    }

    /// Load the record, returning `None` if the job has never been set up.
    ///
    /// An unreadable or unparseable record is a [`CoreError::Corruption`].
    pub fn load(job_dir: &Path) -> Result<Option<JobMetadata>, CoreError> {
        let path = Self::path(job_dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::io(&path, e)),
        };
        let metadata: JobMetadata =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::Corruption {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if metadata.schema_version > METADATA_SCHEMA_VERSION {
            return Err(CoreError::Corruption {
                path,
                reason: format!(
                    "unsupported schema version {} (max {METADATA_SCHEMA_VERSION})",
                    metadata.schema_version
                ),
            });
        }
        Ok(Some(metadata))
    }

    /// Write a fresh record for a verified Setup.
    ///
    /// Replaces any previous record: a redone setup starts a new
    /// generation of outputs, so downstream flags begin unset.
    pub fn record_setup(
        job_dir: &Path,
        fingerprints: &FingerprintSet,
        setup_timestamp: Timestamp,
    ) -> Result<JobMetadata, CoreError> {
        let mut metadata = JobMetadata::new(fingerprints, setup_timestamp);
        metadata.setup_done = true;
        metadata
            .phase_fingerprints
            .insert(Phase::Setup, fingerprints.phase(Phase::Setup).clone());
        Self::write(job_dir, &metadata)?;
        Ok(metadata)
    }

    /// Mark a verified phase complete.
    ///
    /// Only advances the flag; a phase that is already complete under the
    /// same fingerprint is left untouched. The upstream phase must already
    /// be complete.
    pub fn update(
        job_dir: &Path,
        phase: Phase,
        fingerprints: &FingerprintSet,
    ) -> Result<JobMetadata, CoreError> {
        let mut metadata = Self::load(job_dir)?.ok_or_else(|| {
            CoreError::Internal(format!("cannot mark {phase} complete: no metadata record"))
        })?;

        if let Some(upstream) = phase.upstream() {
            if !metadata.is_done(upstream) {
                return Err(CoreError::Internal(format!(
                    "cannot mark {phase} complete before {upstream}"
                )));
            }
        }

        let fingerprint = fingerprints.phase(phase);
        if metadata.is_done(phase) && metadata.phase_fingerprint(phase) == Some(fingerprint) {
            return Ok(metadata);
        }

        metadata.set_done(phase, true);
        metadata.fingerprint = fingerprints.job.clone();
        metadata.phase_fingerprints.insert(phase, fingerprint.clone());
        if metadata
            .last_failure
            .as_ref()
            .is_some_and(|f| f.phase == phase)
        {
            metadata.last_failure = None;
        }
        metadata.last_updated = Utc::now();
        Self::write(job_dir, &metadata)?;
        Ok(metadata)
    }

    /// Reset `from_phase` and every downstream phase flag.
    ///
    /// A missing record is left missing. Output artifacts are never touched.
    pub fn invalidate(job_dir: &Path, from_phase: Phase) -> Result<(), CoreError> {
        let Some(mut metadata) = Self::load(job_dir)? else {
            return Ok(());
        };
        let already_clear = from_phase
            .and_downstream()
            .all(|p| !metadata.is_done(p) && metadata.phase_fingerprint(p).is_none());
        if already_clear {
            return Ok(());
        }
        for phase in from_phase.and_downstream() {
            metadata.set_done(phase, false);
            metadata.phase_fingerprints.remove(&phase);
        }
        metadata.last_updated = Utc::now();
        Self::write(job_dir, &metadata)
    }

    /// Remember a failed phase attempt so it is not silently rerun.
    ///
    /// Creates a flag-less record when the job has none yet.
    pub fn record_failure(
        job_dir: &Path,
        fingerprints: &FingerprintSet,
        failure: FailureRecord,
    ) -> Result<(), CoreError> {
        let mut metadata = match Self::load(job_dir)? {
            Some(metadata) => metadata,
            None => JobMetadata::new(fingerprints, failure.failed_at),
        };
        metadata.last_failure = Some(failure);
        metadata.last_updated = Utc::now();
        Self::write(job_dir, &metadata)
    }

    /// Forget the recorded failure (explicit rerun request).
    pub fn clear_failure(job_dir: &Path) -> Result<(), CoreError> {
        let Some(mut metadata) = Self::load(job_dir)? else {
            return Ok(());
        };
        if metadata.last_failure.take().is_none() {
            return Ok(());
        }
        metadata.last_updated = Utc::now();
        Self::write(job_dir, &metadata)
    }

    /// Move a corrupt record aside so the next load sees no record.
    ///
    /// Returns the quarantine path, or `None` if there was no record.
    pub fn quarantine(job_dir: &Path) -> Result<Option<PathBuf>, CoreError> {
        let path = Self::path(job_dir);
        if !path.exists() {
            return Ok(None);
        }
        quarantine_file(&path).map(Some)
    }

    /// Delete the record outright. Output artifacts are left in place.
    pub fn remove(job_dir: &Path) -> Result<bool, CoreError> {
        let path = Self::path(job_dir);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::io(&path, e)),
        }
    }

    fn write(job_dir: &Path, metadata: &JobMetadata) -> Result<(), CoreError> {
        let path = Self::path(job_dir);
        let bytes = serde_json::to_vec_pretty(metadata)
            .map_err(|e| CoreError::Internal(format!("serialize metadata: {e}")))?;
        write_atomic(&path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` through a sibling temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| CoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::io(path, e))
}

/// Rename a corrupt file to `<name>.corrupt-<unix_ts>` beside itself.
pub fn quarantine_file(path: &Path) -> Result<PathBuf, CoreError> {
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let target = PathBuf::from(target);
    fs::rename(path, &target).map_err(|e| CoreError::io(path, e))?;
    tracing::warn!(
        path = %path.display(),
        quarantined = %target.display(),
        "Quarantined corrupt artifact",
    );
    Ok(target)
}
