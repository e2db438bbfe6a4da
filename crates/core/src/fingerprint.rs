//! Deterministic cache keys for jobs and their phases.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of the
//! cache-relevant parameter subset: object keys are sorted recursively so
//! key order never matters, and execution-only parameters (which backend,
//! UI flags) are projected out before hashing.
//!
//! Each phase may narrow the subset further with its own scope. Downstream
//! phase fingerprints chain the upstream one, so a change that affects
//! Setup always reaches Run and Extract.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::descriptor::JobDescriptor;
use crate::types::Phase;

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Number of characters shown by [`Fingerprint::short`].
const SHORT_LEN: usize = 12;

/// Fixed-length lowercase hex digest of a job's cache-relevant parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing hex digest (e.g. one read back from metadata).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(SHORT_LEN)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Which parameters participate in a fingerprint.
///
/// Paths are dotted (`"mesh.refinement"`). With an `include` list only
/// those paths are hashed; otherwise every parameter except the `exclude`
/// paths is hashed. Exclusions apply after inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<BTreeSet<String>>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl FingerprintScope {
    /// Hash everything except the given execution-only paths.
    pub fn excluding<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: None,
            exclude: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Hash only the given paths.
    pub fn only<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Some(paths.into_iter().map(Into::into).collect()),
            exclude: BTreeSet::new(),
        }
    }

    /// Project the descriptor down to the parameters this scope covers.
    fn project(&self, descriptor: &JobDescriptor) -> Value {
        let mut projected = match &self.include {
            Some(paths) => {
                let mut out = Map::new();
                for path in paths {
                    if let Some(value) = descriptor.get(path) {
                        insert_path(&mut out, path, value.clone());
                    }
                }
                out
            }
            None => descriptor.params().clone(),
        };
        for path in &self.exclude {
            remove_path(&mut projected, path);
        }
        Value::Object(projected)
    }
}

/// Optional per-phase narrowing of the job scope.
///
/// A phase without its own scope uses the job scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseScopes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<FingerprintScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<FingerprintScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<FingerprintScope>,
}

impl PhaseScopes {
    fn get(&self, phase: Phase) -> Option<&FingerprintScope> {
        match phase {
            Phase::Setup => self.setup.as_ref(),
            Phase::Run => self.run.as_ref(),
            Phase::Extract => self.extract.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprinter
// ---------------------------------------------------------------------------

/// Job fingerprint plus one chained fingerprint per phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintSet {
    pub job: Fingerprint,
    pub phases: BTreeMap<Phase, Fingerprint>,
}

impl FingerprintSet {
    pub fn phase(&self, phase: Phase) -> &Fingerprint {
        // Every phase is populated by `Fingerprinter::compute`.
        &self.phases[&phase]
    }

    /// Earliest phase whose fingerprint differs from the recorded ones.
    ///
    /// A phase missing from `recorded` counts as changed.
    pub fn first_changed(&self, recorded: &BTreeMap<Phase, Fingerprint>) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|phase| recorded.get(phase) != self.phases.get(phase))
    }
}

/// Computes fingerprints for job descriptors under a fixed set of scopes.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    scope: FingerprintScope,
    phase_scopes: PhaseScopes,
}

impl Fingerprinter {
    pub fn new(scope: FingerprintScope, phase_scopes: PhaseScopes) -> Self {
        Self {
            scope,
            phase_scopes,
        }
    }

    /// Fingerprint of the whole job under the job scope.
    pub fn job_fingerprint(&self, descriptor: &JobDescriptor) -> Fingerprint {
        digest(&[canonical_json(&self.scope.project(descriptor)).as_bytes()])
    }

    /// Job fingerprint and chained per-phase fingerprints.
    pub fn compute(&self, descriptor: &JobDescriptor) -> FingerprintSet {
        let job = self.job_fingerprint(descriptor);
        let mut phases = BTreeMap::new();
        let mut upstream: Option<Fingerprint> = None;

        for phase in Phase::ALL {
            let scope = self.phase_scopes.get(phase).unwrap_or(&self.scope);
            let mut projected = scope.project(descriptor);
            // Job-level exclusions always win over a looser phase scope.
            if let Value::Object(map) = &mut projected {
                for path in &self.scope.exclude {
                    remove_path(map, path);
                }
            }
            let canonical = canonical_json(&projected);
            let parent = upstream.as_ref().map(Fingerprint::as_str).unwrap_or("");
            let fp = digest(&[
                phase.as_str().as_bytes(),
                b"\0",
                parent.as_bytes(),
                b"\0",
                canonical.as_bytes(),
            ]);
            upstream = Some(fp.clone());
            phases.insert(phase, fp);
        }

        FingerprintSet { job, phases }
    }
}

// ---------------------------------------------------------------------------
// Canonical serialization
// ---------------------------------------------------------------------------

/// Render a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn digest(parts: &[&[u8]]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child_map) = child {
                insert_path(child_map, rest, value);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}
