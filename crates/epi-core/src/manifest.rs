//! Manifest and step-record types.
//!
//! The [`Manifest`] describes a recording: who/what/when metadata, the file
//! manifest binding every digested container entry to its SHA-256, and the
//! optional signature. [`StepRecord`]s form the step log, stored in the
//! container as newline-delimited JSON.
//!
//! # Signature Coverage
//!
//! The signature is computed over [`crate::canonical::canonicalize`] of the
//! manifest, which excludes the `signature` field itself. Changing any other
//! field after signing invalidates the signature.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Container format version written into new manifests.
pub const SPEC_VERSION: &str = "1.0";

/// Errors raised while encoding or parsing a step log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StepLogError {
    /// A line is not a valid step record.
    #[error("step log line {line}: {message}")]
    InvalidRecord {
        /// One-based line number.
        line: usize,
        /// Parser message.
        message: String,
    },

    /// The step indexes are not the sequence 0, 1, 2, ...
    #[error("step log line {line}: expected index {expected}, found {found}")]
    IndexOutOfOrder {
        /// One-based line number.
        line: usize,
        /// The index that should appear at this position.
        expected: u64,
        /// The index actually recorded.
        found: u64,
    },

    /// The step log is not UTF-8.
    #[error("step log is not valid UTF-8")]
    NotUtf8,

    /// Serialization of a record failed.
    #[error("failed to encode step {index}: {message}")]
    Encode {
        /// Index of the step that failed.
        index: u64,
        /// Serializer message.
        message: String,
    },
}

/// Metadata record describing a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Container format version.
    pub spec_version: String,

    /// Workflow identifier (UUID string for recorder-created manifests).
    pub workflow_id: String,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Command line that produced the recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_command: Option<String>,

    /// Digest of the captured environment snapshot, if one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_snapshot_hash: Option<String>,

    /// Goal of the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Tags for categorisation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Who approved the recorded workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    /// Free-form metrics (accuracy, latency, cost, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, Value>,

    /// Archived entry name to lowercase hex SHA-256.
    #[serde(default)]
    pub file_manifest: BTreeMap<String, String>,

    /// `<algorithm>:<key_id>:<base64>` signature, absent until signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Manifest {
    /// Creates an unsigned manifest with a fresh UUID workflow id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_workflow_id(Uuid::new_v4().to_string())
    }

    /// Creates an unsigned manifest with the given workflow id, stamped now.
    #[must_use]
    pub fn with_workflow_id(workflow_id: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            workflow_id: workflow_id.into(),
            created_at: Utc::now(),
            cli_command: None,
            env_snapshot_hash: None,
            goal: None,
            notes: None,
            tags: Vec::new(),
            approved_by: None,
            metrics: Map::new(),
            file_manifest: BTreeMap::new(),
            signature: None,
        }
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the goal.
    #[must_use]
    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Sets the notes.
    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Sets the command line.
    #[must_use]
    pub fn cli_command(mut self, command: impl Into<String>) -> Self {
        self.cli_command = Some(command.into());
        self
    }

    /// Appends a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Records a metric.
    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    /// Returns `true` if the manifest carries a non-empty signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    /// Returns a copy with the signature removed.
    #[must_use]
    pub fn unsigned(&self) -> Self {
        Self {
            signature: None,
            ..self.clone()
        }
    }

    /// Serializes the manifest as pretty JSON for `manifest.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric value cannot be serialized.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// One logged event in the workflow timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the step log, starting at 0.
    pub index: u64,

    /// When the step was recorded (UTC).
    pub timestamp: DateTime<Utc>,

    /// Dotted event category, e.g. `llm.request`.
    pub kind: String,

    /// Step payload, already redacted.
    pub content: Value,
}

impl StepRecord {
    /// Creates a step stamped with the current time.
    #[must_use]
    pub fn new(index: u64, kind: impl Into<String>, content: Value) -> Self {
        Self {
            index,
            timestamp: Utc::now(),
            kind: kind.into(),
            content,
        }
    }
}

/// Encodes steps as newline-delimited JSON, one record per line.
///
/// # Errors
///
/// Returns [`StepLogError::Encode`] if a record cannot be serialized.
pub fn encode_step_log(steps: &[StepRecord]) -> Result<Vec<u8>, StepLogError> {
    let mut out = Vec::new();
    for step in steps {
        let line = serde_json::to_vec(step).map_err(|e| StepLogError::Encode {
            index: step.index,
            message: e.to_string(),
        })?;
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
    Ok(out)
}

/// Parses a newline-delimited step log.
///
/// Blank lines are ignored. Indexes must be the sequence 0, 1, 2, ... in
/// file order.
///
/// # Errors
///
/// Returns [`StepLogError`] for non-UTF-8 input, unparsable lines, or an
/// index that does not match its position.
pub fn parse_step_log(bytes: &[u8]) -> Result<Vec<StepRecord>, StepLogError> {
    let text = std::str::from_utf8(bytes).map_err(|_| StepLogError::NotUtf8)?;
    let mut steps = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let step: StepRecord =
            serde_json::from_str(line).map_err(|e| StepLogError::InvalidRecord {
                line: i + 1,
                message: e.to_string(),
            })?;
        let expected = steps.len() as u64;
        if step.index != expected {
            return Err(StepLogError::IndexOutOfOrder {
                line: i + 1,
                expected,
                found: step.index,
            });
        }
        steps.push(step);
    }
    Ok(steps)
}
