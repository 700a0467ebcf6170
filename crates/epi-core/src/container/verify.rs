//! Integrity and signature verification of containers.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use super::read::{find_manifest, read_entries};
use super::viewer::{extract_viewer_data, viewer_payload, viewer_template_form};
use super::{FormatError, STEPS_ENTRY, UNDIGESTED_ENTRIES, VIEWER_ENTRY};
use crate::hash::{ContentHasher, DigestError};
use crate::manifest::{parse_step_log, Manifest};
use crate::trust::{verify_signature, PublicKeyLookup, SignatureVerification};

/// A single integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityMismatch {
    /// An entry named in the file manifest is not in the archive.
    Missing {
        /// Entry name.
        name: String,
        /// Digest recorded in the manifest.
        expected: String,
    },
    /// An entry's content does not hash to its recorded digest.
    Digest {
        /// Entry name.
        name: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the archived content.
        actual: String,
    },
    /// An archived entry has no digest in the file manifest.
    Undigested {
        /// Entry name.
        name: String,
        /// Digest of the archived content.
        actual: String,
    },
    /// The viewer's embedded data differs from the archived manifest and
    /// steps.
    ViewerData {
        /// Entry name.
        name: String,
    },
}

impl IntegrityMismatch {
    /// Name of the affected entry.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Missing { name, .. }
            | Self::Digest { name, .. }
            | Self::Undigested { name, .. }
            | Self::ViewerData { name } => name,
        }
    }
}

impl fmt::Display for IntegrityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { name, expected } => {
                write!(f, "{name}: expected {expected}, entry missing")
            },
            Self::Digest {
                name,
                expected,
                actual,
            } => write!(f, "{name}: expected {expected}, got {actual}"),
            Self::Undigested { name, actual } => {
                write!(f, "{name}: digest absent from manifest, got {actual}")
            },
            Self::ViewerData { name } => {
                write!(f, "{name}: embedded data does not match manifest and steps")
            },
        }
    }
}

/// Result of checking every entry against the file manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Number of entries whose digest matched.
    pub verified: usize,
    /// Every failure found, in file-manifest order then archive order.
    pub mismatches: Vec<IntegrityMismatch>,
}

impl IntegrityReport {
    /// Returns `true` if no mismatches were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recomputes every digest and reports all mismatches.
///
/// # Errors
///
/// Returns [`FormatError`] if the archive is unreadable, the `mimetype` entry
/// is wrong, or the manifest is missing or unparsable. Content that merely
/// fails its digest is reported, not an error.
pub fn verify_integrity(bytes: &[u8]) -> Result<IntegrityReport, FormatError> {
    let entries = read_entries(bytes)?;
    let manifest = find_manifest(&entries)?;
    Ok(check_entries(&entries, &manifest))
}

fn check_entries(entries: &[(String, Vec<u8>)], manifest: &Manifest) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    for (name, expected) in &manifest.file_manifest {
        let Some((_, content)) = entries.iter().find(|(entry, _)| entry == name) else {
            report.mismatches.push(IntegrityMismatch::Missing {
                name: name.clone(),
                expected: expected.clone(),
            });
            continue;
        };
        let digested = if name == VIEWER_ENTRY {
            viewer_digest_input(content)
        } else {
            Cow::Borrowed(content.as_slice())
        };
        match ContentHasher::verify(&digested, expected) {
            Ok(()) => report.verified += 1,
            Err(err) => {
                let actual = match err {
                    DigestError::Mismatch { actual, .. } => actual,
                    DigestError::Malformed { .. } => ContentHasher::hash_hex(&digested),
                };
                report.mismatches.push(IntegrityMismatch::Digest {
                    name: name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            },
        }
    }

    let exempt: HashSet<&str> = UNDIGESTED_ENTRIES.into_iter().collect();
    for (name, content) in entries {
        if exempt.contains(name.as_str()) || manifest.file_manifest.contains_key(name) {
            continue;
        }
        report.mismatches.push(IntegrityMismatch::Undigested {
            name: name.clone(),
            actual: ContentHasher::hash_hex(content),
        });
    }
    if let Some(mismatch) = check_viewer_payload(entries, manifest, &report) {
        report.mismatches.push(mismatch);
    }

    if report.is_ok() {
        debug!(verified = report.verified, "container integrity ok");
    } else {
        warn!(
            verified = report.verified,
            mismatches = report.mismatches.len(),
            "container integrity check failed"
        );
    }
    report
}

/// The bytes a viewer's digest covers: its template form, or the raw
/// content when it has none.
fn viewer_digest_input(content: &[u8]) -> Cow<'_, [u8]> {
    std::str::from_utf8(content)
        .ok()
        .and_then(|html| viewer_template_form(html).ok())
        .map_or(Cow::Borrowed(content), |form| Cow::Owned(form.into_bytes()))
}

/// Compares the viewer payload with the archived manifest and steps.
///
/// Skipped when the step log has already been reported.
fn check_viewer_payload(
    entries: &[(String, Vec<u8>)],
    manifest: &Manifest,
    report: &IntegrityReport,
) -> Option<IntegrityMismatch> {
    let (_, html) = entries.iter().find(|(name, _)| name == VIEWER_ENTRY)?;
    if report.mismatches.iter().any(|m| m.name() == STEPS_ENTRY) {
        return None;
    }
    let embedded = std::str::from_utf8(html).ok().and_then(extract_viewer_data);
    let expected = entries
        .iter()
        .find(|(name, _)| name == STEPS_ENTRY)
        .and_then(|(_, log)| parse_step_log(log).ok())
        .and_then(|steps| viewer_payload(manifest, &steps).ok());
    match (embedded, expected) {
        (Some(embedded), Some(expected)) if embedded == expected => None,
        _ => Some(IntegrityMismatch::ViewerData {
            name: VIEWER_ENTRY.to_string(),
        }),
    }
}

/// How far a container can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Intact and signed by a trusted key.
    High,
    /// Intact but unsigned.
    Medium,
    /// Tampered, or carrying a signature that does not verify.
    None,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::None => "none",
        })
    }
}

/// Combined integrity and signature verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Workflow id from the manifest.
    pub workflow_id: String,
    /// Integrity result.
    pub integrity: IntegrityReport,
    /// Signature result.
    pub signature: SignatureVerification,
    /// Overall trust level.
    pub trust_level: TrustLevel,
}

impl VerificationReport {
    /// Returns `true` for [`TrustLevel::High`].
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trust_level == TrustLevel::High
    }
}

/// Verifies integrity and signature in one pass.
///
/// # Errors
///
/// Returns [`FormatError`] under the same conditions as
/// [`verify_integrity`].
pub fn verify_container(
    bytes: &[u8],
    keys: &impl PublicKeyLookup,
) -> Result<VerificationReport, FormatError> {
    let entries = read_entries(bytes)?;
    let manifest = find_manifest(&entries)?;
    let integrity = check_entries(&entries, &manifest);
    let signature = verify_signature(&manifest, keys);

    let trust_level = match (&signature, integrity.is_ok()) {
        (SignatureVerification::Valid { .. }, true) => TrustLevel::High,
        (SignatureVerification::Unsigned, true) => TrustLevel::Medium,
        _ => TrustLevel::None,
    };
    Ok(VerificationReport {
        workflow_id: manifest.workflow_id,
        integrity,
        signature,
        trust_level,
    })
}
