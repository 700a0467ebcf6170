//! Evidence container packing, reading and verification.
//!
//! A container is a ZIP archive with a fixed entry order:
//!
//! ```text
//! mimetype        stored, "application/vnd.epi+zip"
//! manifest.json   metadata, file manifest, signature
//! steps.jsonl     newline-delimited step records
//! <artifacts>     sorted by '/'-separated relative path
//! viewer.html     optional, embeds manifest + steps
//! ```
//!
//! # Digest Coverage
//!
//! The manifest's file manifest holds the SHA-256 of `steps.jsonl`, of every
//! artifact and of `viewer.html` in its template form (the embedded payload
//! replaced by the data placeholder). The payload itself must equal the
//! archived manifest and steps. `mimetype` is fixed content and
//! `manifest.json` is covered by the signature, so both are exempt. Any
//! other entry without a digest is reported by [`verify_integrity`] as
//! undigested.

mod pack;
mod read;
mod verify;
mod viewer;

use std::path::PathBuf;

use thiserror::Error;

pub use pack::{pack, pack_to_bytes, sign_container, PackOptions, PackSummary};
pub use read::{read, ContainerContents};
pub use verify::{
    verify_container, verify_integrity, IntegrityMismatch, IntegrityReport, TrustLevel,
    VerificationReport,
};
pub(crate) use viewer::check_step_embeddable;
pub use viewer::{
    extract_viewer_data, render_viewer, ViewerError, DATA_PLACEHOLDER, DEFAULT_VIEWER_TEMPLATE,
};

use crate::canonical::CanonicalError;
use crate::manifest::StepLogError;

/// Name of the first archive entry.
pub const MIMETYPE_ENTRY: &str = "mimetype";

/// Content of the `mimetype` entry.
pub const MIMETYPE: &str = "application/vnd.epi+zip";

/// Name of the manifest entry.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Name of the step log entry.
pub const STEPS_ENTRY: &str = "steps.jsonl";

/// Name of the embedded viewer entry.
pub const VIEWER_ENTRY: &str = "viewer.html";

/// Conventional container file extension.
pub const CONTAINER_EXTENSION: &str = "epi";

/// Maximum number of entries accepted when reading.
pub const MAX_ENTRIES: usize = 10_000;

/// Maximum decompressed size of a single entry accepted when reading.
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Entry names that never carry a digest.
pub(crate) const UNDIGESTED_ENTRIES: [&str; 2] = [MIMETYPE_ENTRY, MANIFEST_ENTRY];

/// Entry names written by the packer itself, never taken from the source.
pub(crate) const RESERVED_ENTRIES: [&str; 3] = [MIMETYPE_ENTRY, MANIFEST_ENTRY, VIEWER_ENTRY];

/// A container that cannot be read.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatError {
    /// The bytes are not a readable ZIP archive.
    #[error("unreadable archive: {message}")]
    Archive {
        /// Decoder message.
        message: String,
    },

    /// The archive has no entries.
    #[error("archive is empty")]
    Empty,

    /// The first entry is not `mimetype`.
    #[error("first entry must be \"mimetype\", found {found:?}")]
    MimetypeNotFirst {
        /// Name of the first entry.
        found: String,
    },

    /// The `mimetype` entry is compressed.
    #[error("mimetype entry must be stored uncompressed")]
    MimetypeCompressed,

    /// The `mimetype` entry has the wrong content.
    #[error("unexpected mimetype {found:?}")]
    MimetypeContent {
        /// The content found.
        found: String,
    },

    /// A required entry is missing.
    #[error("missing required entry {name}")]
    MissingEntry {
        /// Entry name.
        name: &'static str,
    },

    /// Two entries share a name.
    #[error("duplicate entry {name}")]
    DuplicateEntry {
        /// Entry name.
        name: String,
    },

    /// Too many entries.
    #[error("archive has {count} entries, maximum is {max}")]
    TooManyEntries {
        /// Entries found.
        count: usize,
        /// Limit.
        max: usize,
    },

    /// An entry exceeds [`MAX_ENTRY_BYTES`].
    #[error("entry {name} exceeds {max} bytes")]
    EntryTooLarge {
        /// Entry name.
        name: String,
        /// Limit.
        max: u64,
    },

    /// `manifest.json` is not a valid manifest.
    #[error("invalid manifest: {message}")]
    Manifest {
        /// Parser message.
        message: String,
    },

    /// `steps.jsonl` is not a valid step log.
    #[error("invalid step log: {0}")]
    StepLog(#[from] StepLogError),

    /// `viewer.html` is not UTF-8.
    #[error("viewer is not valid UTF-8")]
    ViewerNotUtf8,
}

impl From<zip::result::ZipError> for FormatError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive {
            message: err.to_string(),
        }
    }
}

/// Errors that can occur while packing or re-signing a container.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// Filesystem failure.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The source directory does not have the expected layout.
    #[error("invalid source entry {}: {reason}", path.display())]
    SourceLayout {
        /// Offending path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// Archive writer failure.
    #[error("archive write failed: {message}")]
    Zip {
        /// Writer message.
        message: String,
    },

    /// An existing container is malformed.
    #[error("malformed container: {0}")]
    Format(#[from] FormatError),

    /// The step log in the source directory is invalid.
    #[error("invalid step log: {0}")]
    StepLog(#[from] StepLogError),

    /// The manifest could not be canonicalized for signing.
    #[error("cannot canonicalize manifest: {0}")]
    Canonical(#[from] CanonicalError),

    /// The manifest could not be serialized.
    #[error("cannot serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The viewer could not be rendered.
    #[error("viewer error: {0}")]
    Viewer(#[from] ViewerError),

    /// Refused to sign a container whose contents do not match their
    /// digests.
    #[error("container fails integrity check with {mismatches} mismatch(es)")]
    IntegrityFailed {
        /// Number of mismatches found.
        mismatches: usize,
    },
}

impl From<zip::result::ZipError> for ContainerError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Zip {
            message: err.to_string(),
        }
    }
}
