//! Recording sessions.
//!
//! A [`Recorder`] stages a workflow in a temporary directory: each
//! [`Recorder::log_step`] appends a redacted [`StepRecord`] to `steps.jsonl`
//! and each [`Recorder::add_artifact`] writes a redacted file. When the
//! workflow ends, [`Recorder::finish`] packs the staging directory into a
//! container. Nothing reaches the staging directory or the manifest
//! unredacted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::canonical::{self, CanonicalError};
use crate::container::{
    self, check_step_embeddable, ContainerError, PackOptions, PackSummary, STEPS_ENTRY,
};
use crate::hash::ContentHasher;
use crate::manifest::{Manifest, StepRecord};
use crate::redact::{is_sensitive_env_name, Redactor, PLACEHOLDER};

/// Artifact name used by [`Recorder::record_environment`].
pub const ENVIRONMENT_ARTIFACT: &str = "environment.json";

/// Errors from a recording session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecorderError {
    /// Staging directory I/O failure.
    #[error("recorder I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An artifact name is not an acceptable archive path.
    #[error("invalid artifact name {name:?}: {reason}")]
    InvalidArtifactName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A step could not be serialized.
    #[error("cannot encode step {index}: {source}")]
    EncodeStep {
        /// Index of the step.
        index: u64,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A metric has no canonical encoding, so the manifest could not be
    /// signed with it.
    #[error("cannot record metric {name:?}: {source}")]
    Metric {
        /// Metric name, redacted.
        name: String,
        /// Canonicalization error.
        #[source]
        source: CanonicalError,
    },

    /// Packing failed.
    #[error("packing failed: {0}")]
    Container(#[from] ContainerError),
}

/// A recording session staged on disk.
#[derive(Debug)]
pub struct Recorder {
    staging: TempDir,
    steps: File,
    manifest: Manifest,
    redactor: Redactor,
    next_index: u64,
    redactions: usize,
    artifacts: BTreeSet<String>,
}

impl Recorder {
    /// Starts a session. A fresh UUID is used when `workflow_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Io`] if the staging directory cannot be
    /// created.
    pub fn new(workflow_id: Option<&str>, redactor: Redactor) -> Result<Self, RecorderError> {
        let staging = tempfile::Builder::new()
            .prefix("epi-recording-")
            .tempdir()
            .map_err(|source| RecorderError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let steps_path = staging.path().join(STEPS_ENTRY);
        let steps = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&steps_path)
            .map_err(|source| RecorderError::Io {
                path: steps_path,
                source,
            })?;
        let manifest = workflow_id.map_or_else(Manifest::new, Manifest::with_workflow_id);
        debug!(
            workflow_id = %manifest.workflow_id,
            staging = %staging.path().display(),
            "recording started"
        );

        Ok(Self {
            staging,
            steps,
            manifest,
            redactor,
            next_index: 0,
            redactions: 0,
            artifacts: BTreeSet::new(),
        })
    }

    /// Workflow id of this session.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.manifest.workflow_id
    }

    /// Staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Number of steps logged so far.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.next_index
    }

    /// Total redactions applied so far.
    #[must_use]
    pub const fn redaction_count(&self) -> usize {
        self.redactions
    }

    /// Redacts `content` and appends it as the next step. Returns the step
    /// index.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::EncodeStep`] if the step cannot be encoded or
    /// would not read back (for example, nesting too deep), and
    /// [`RecorderError::Io`] if it cannot be written. A rejected step is not
    /// logged and does not use up an index.
    pub fn log_step(&mut self, kind: &str, content: &Value) -> Result<u64, RecorderError> {
        let (kind, kind_hits) = self.redactor.redact_str(kind);
        let (content, content_hits) = self.redactor.redact_value(content);
        let redacted = kind_hits + content_hits;
        let index = self.next_index;
        let record = StepRecord::new(index, kind, content);

        check_step_embeddable(&record)
            .map_err(|source| RecorderError::EncodeStep { index, source })?;
        let mut line = serde_json::to_vec(&record)
            .map_err(|source| RecorderError::EncodeStep { index, source })?;
        line.push(b'\n');
        self.steps
            .write_all(&line)
            .map_err(|source| RecorderError::Io {
                path: self.staging.path().join(STEPS_ENTRY),
                source,
            })?;

        self.next_index += 1;
        self.redactions += redacted;
        debug!(index, kind = %record.kind, redacted, "logged step");
        Ok(index)
    }

    /// Redacts textual `content` and stores it as an artifact under `name`
    /// (a relative `/`-separated path).
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::InvalidArtifactName`] for absolute paths,
    /// `.`/`..` components, reserved entry names or duplicates, and
    /// [`RecorderError::Io`] on write failure.
    pub fn add_artifact(&mut self, name: &str, content: &[u8]) -> Result<(), RecorderError> {
        validate_artifact_name(name)?;
        if self.artifacts.contains(name) {
            return Err(RecorderError::InvalidArtifactName {
                name: name.to_string(),
                reason: "artifact already added",
            });
        }

        let (content, redacted) = self.redactor.redact_bytes(content);
        let path = self.staging.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RecorderError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, &content).map_err(|source| RecorderError::Io { path, source })?;

        self.artifacts.insert(name.to_string());
        self.redactions += redacted;
        debug!(name, size = content.len(), redacted, "added artifact");
        Ok(())
    }

    /// Stores a snapshot of environment variables as an artifact and records
    /// its digest in the manifest. Values of sensitive variables are
    /// withheld; the rest are redacted like any other text.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the snapshot cannot be written.
    pub fn record_environment<I, K, V>(&mut self, vars: I) -> Result<(), RecorderError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let sorted: BTreeMap<String, Value> = vars
            .into_iter()
            .map(|(name, value)| {
                let name: String = name.into();
                let value = if is_sensitive_env_name(&name) {
                    PLACEHOLDER.to_string()
                } else {
                    self.redactor.redact_str(value.as_ref()).0
                };
                (name, Value::String(value))
            })
            .collect();
        let snapshot: Map<String, Value> = sorted.into_iter().collect();
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|source| {
            RecorderError::EncodeStep {
                index: self.next_index,
                source,
            }
        })?;

        self.add_artifact(ENVIRONMENT_ARTIFACT, &bytes)?;
        self.manifest.env_snapshot_hash = Some(ContentHasher::hash_hex(&bytes));
        Ok(())
    }

    /// Sets the workflow goal.
    pub fn set_goal(&mut self, goal: &str) {
        self.manifest.goal = Some(self.redact_text(goal));
    }

    /// Sets free-text notes.
    pub fn set_notes(&mut self, notes: &str) {
        self.manifest.notes = Some(self.redact_text(notes));
    }

    /// Records the command line that produced the workflow.
    pub fn set_cli_command(&mut self, command: &str) {
        self.manifest.cli_command = Some(self.redact_text(command));
    }

    /// Records who approved the workflow.
    pub fn set_approved_by(&mut self, approver: &str) {
        self.manifest.approved_by = Some(self.redact_text(approver));
    }

    /// Adds a tag.
    pub fn add_tag(&mut self, tag: &str) {
        let tag = self.redact_text(tag);
        self.manifest.tags.push(tag);
    }

    /// Records a metric, replacing any previous value under the same name.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Metric`] if the metrics would no longer
    /// canonicalize, for example keys that collide after NFC normalization.
    /// The manifest is left unchanged.
    pub fn set_metric(&mut self, name: &str, value: impl Into<Value>) -> Result<(), RecorderError> {
        let mut metrics = self.manifest.metrics.clone();
        metrics.insert(name.to_string(), value.into());
        // Metrics already stored are clean, so only the new entry adds hits.
        let (metrics, redacted) = self.redactor.redact_value(&Value::Object(metrics));
        canonical::check_nested(&metrics, 1).map_err(|source| RecorderError::Metric {
            name: self.redactor.redact_str(name).0,
            source,
        })?;

        if let Value::Object(metrics) = metrics {
            self.manifest.metrics = metrics;
        }
        self.redactions += redacted;
        Ok(())
    }

    fn redact_text(&mut self, text: &str) -> String {
        let (clean, redacted) = self.redactor.redact_str(text);
        self.redactions += redacted;
        clean
    }

    /// Packs the session into a container at `output`.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the step log cannot be flushed or packing
    /// fails.
    pub fn finish(
        mut self,
        output: &Path,
        options: &PackOptions<'_>,
    ) -> Result<PackSummary, RecorderError> {
        self.steps
            .sync_all()
            .map_err(|source| RecorderError::Io {
                path: self.staging.path().join(STEPS_ENTRY),
                source,
            })?;
        let manifest = std::mem::take(&mut self.manifest);
        let summary = container::pack(self.staging.path(), manifest, output, options)?;
        info!(
            workflow_id = %summary.manifest.workflow_id,
            steps = self.next_index,
            artifacts = self.artifacts.len(),
            redactions = self.redactions,
            "recording finished"
        );
        Ok(summary)
    }
}

/// Checks that `name` is a clean relative archive path.
fn validate_artifact_name(name: &str) -> Result<(), RecorderError> {
    let invalid = |reason| {
        Err(RecorderError::InvalidArtifactName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.contains('\\') {
        return invalid("use '/' as the path separator");
    }
    if name.starts_with('/') || Path::new(name).is_absolute() {
        return invalid("path must be relative");
    }
    for part in name.split('/') {
        match part {
            "" => return invalid("empty path component"),
            "." => return invalid("'.' is not allowed"),
            ".." => return invalid("'..' is not allowed"),
            _ => {},
        }
    }
    if [
        container::MIMETYPE_ENTRY,
        container::MANIFEST_ENTRY,
        container::VIEWER_ENTRY,
        STEPS_ENTRY,
    ]
    .contains(&name)
    {
        return invalid("reserved entry name");
    }
    Ok(())
}
