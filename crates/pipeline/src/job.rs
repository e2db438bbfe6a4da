//! Jobs and the JSON job file the worker reads them from.
//!
//! ```json
//! {
//!   "name": "bracket",
//!   "job_dir": "runs/bracket",
//!   "params": {"mesh": {"nx": 40}, "load": 1200, "notes": "draft"},
//!   "fingerprint": {"exclude": ["notes"]},
//!   "phase_scopes": {"extract": {"include": ["load"]}},
//!   "deliverables": {
//!     "setup": [{"path": "mesh/{mesh.nx}.msh"}],
//!     "run": {"path": "result-{fingerprint_short}.bin"},
//!     "extract": [{"path": "summary.json", "check": "json"}]
//!   },
//!   "setup": {"command": "./mesh.sh", "timeout_secs": 600},
//!   "extract": {"command": "./summarize.sh"}
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::deliverable::{DeliverableSet, ResolvedDeliverables, TemplateContext};
use stagehand_core::descriptor::JobDescriptor;
use stagehand_core::error::CoreError;
use stagehand_core::fingerprint::{FingerprintScope, FingerprintSet, Fingerprinter, PhaseScopes};

use crate::error::PipelineError;
use crate::handler::{NoopHandler, PhaseHandler, ShellHandler};

/// A fingerprinted job with its artifact paths resolved.
///
/// The descriptor is fixed once fingerprinted; build a new `Job` for
/// different parameters.
#[derive(Debug, Clone)]
pub struct Job {
    name: String,
    job_dir: PathBuf,
    descriptor: JobDescriptor,
    fingerprints: FingerprintSet,
    deliverables: ResolvedDeliverables,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        job_dir: impl Into<PathBuf>,
        descriptor: JobDescriptor,
        fingerprinter: &Fingerprinter,
        deliverables: &DeliverableSet,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineError::Validation("job name must not be empty".to_string()));
        }
        let job_dir = job_dir.into();
        let fingerprints = fingerprinter.compute(&descriptor);
        let deliverables = deliverables
            .resolve(&TemplateContext {
                job_dir: &job_dir,
                name: &name,
                fingerprint: &fingerprints.job,
                descriptor: &descriptor,
            })
            .map_err(validation)?;

        Ok(Self {
            name,
            job_dir,
            descriptor,
            fingerprints,
            deliverables,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn fingerprints(&self) -> &FingerprintSet {
        &self.fingerprints
    }

    pub fn deliverables(&self) -> &ResolvedDeliverables {
        &self.deliverables
    }
}

fn validation(e: CoreError) -> PipelineError {
    match e {
        CoreError::Validation(msg) => PipelineError::Validation(msg),
        other => PipelineError::Core(other),
    }
}

// ---------------------------------------------------------------------------
// Job file
// ---------------------------------------------------------------------------

/// Shell command performing a Setup or Extract phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseCommand {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PhaseCommand {
    pub fn handler(&self) -> ShellHandler {
        ShellHandler::new(&self.command, self.timeout_secs.map(Duration::from_secs))
    }
}

/// On-disk description of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub name: String,
    /// Output directory. Relative paths resolve against the job file's
    /// directory; absent means `<file dir>/<name>`.
    #[serde(default)]
    pub job_dir: Option<PathBuf>,
    pub params: Value,
    /// Parameters the job fingerprint covers.
    #[serde(default)]
    pub fingerprint: FingerprintScope,
    #[serde(default)]
    pub phase_scopes: PhaseScopes,
    pub deliverables: DeliverableSet,
    #[serde(default)]
    pub setup: Option<PhaseCommand>,
    #[serde(default)]
    pub extract: Option<PhaseCommand>,
}

impl JobFile {
    /// Read and parse a job file, anchoring `job_dir` to its location.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(path).map_err(|e| CoreError::io(path, e))?;
        let mut file: JobFile = serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::Validation(format!("{}: {e}", path.display()))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let job_dir = match file.job_dir.take() {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => base.join(dir),
            None => base.join(&file.name),
        };
        file.job_dir = Some(job_dir);
        Ok(file)
    }

    pub fn job(&self) -> Result<Job, PipelineError> {
        let descriptor = JobDescriptor::from_value(self.params.clone()).map_err(validation)?;
        let fingerprinter = Fingerprinter::new(self.fingerprint.clone(), self.phase_scopes.clone());
        let job_dir = self
            .job_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name));
        Job::new(&self.name, job_dir, descriptor, &fingerprinter, &self.deliverables)
    }

    pub fn setup_handler(&self) -> Arc<dyn PhaseHandler> {
        command_handler(self.setup.as_ref())
    }

    pub fn extract_handler(&self) -> Arc<dyn PhaseHandler> {
        command_handler(self.extract.as_ref())
    }
}

fn command_handler(command: Option<&PhaseCommand>) -> Arc<dyn PhaseHandler> {
    match command {
        Some(command) => Arc::new(command.handler()),
        None => Arc::new(NoopHandler),
    }
}
