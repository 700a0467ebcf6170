//! Container reader.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};

use zip::{CompressionMethod, ZipArchive};

use super::{
    FormatError, MANIFEST_ENTRY, MAX_ENTRIES, MAX_ENTRY_BYTES, MIMETYPE, MIMETYPE_ENTRY,
    STEPS_ENTRY, VIEWER_ENTRY,
};
use crate::manifest::{parse_step_log, Manifest, StepRecord};

/// Parsed contents of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerContents {
    /// The manifest.
    pub manifest: Manifest,
    /// Parsed step records.
    pub steps: Vec<StepRecord>,
    /// Raw `steps.jsonl` bytes, exactly as archived.
    pub step_log: Vec<u8>,
    /// Artifacts by archived name.
    pub artifacts: BTreeMap<String, Vec<u8>>,
    /// Embedded viewer, if present.
    pub viewer: Option<String>,
}

/// Raw archive entries in archive order, with the `mimetype` entry checked
/// and stripped.
pub(crate) fn read_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, FormatError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.is_empty() {
        return Err(FormatError::Empty);
    }
    if archive.len() > MAX_ENTRIES {
        return Err(FormatError::TooManyEntries {
            count: archive.len(),
            max: MAX_ENTRIES,
        });
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let name = file.name().to_string();

        if index == 0 {
            if name != MIMETYPE_ENTRY {
                return Err(FormatError::MimetypeNotFirst { found: name });
            }
            if file.compression() != CompressionMethod::Stored {
                return Err(FormatError::MimetypeCompressed);
            }
        }
        if file.is_dir() {
            continue;
        }
        if !seen.insert(name.clone()) {
            return Err(FormatError::DuplicateEntry { name });
        }

        let mut content = Vec::new();
        (&mut file)
            .take(MAX_ENTRY_BYTES + 1)
            .read_to_end(&mut content)
            .map_err(|e| FormatError::Archive {
                message: format!("cannot read entry {name}: {e}"),
            })?;
        if content.len() as u64 > MAX_ENTRY_BYTES {
            return Err(FormatError::EntryTooLarge {
                name,
                max: MAX_ENTRY_BYTES,
            });
        }

        if index == 0 {
            if content != MIMETYPE.as_bytes() {
                return Err(FormatError::MimetypeContent {
                    found: String::from_utf8_lossy(&content).into_owned(),
                });
            }
            continue;
        }
        entries.push((name, content));
    }
    Ok(entries)
}

/// Parses `manifest.json` bytes.
pub(crate) fn parse_manifest(bytes: &[u8]) -> Result<Manifest, FormatError> {
    serde_json::from_slice(bytes).map_err(|e| FormatError::Manifest {
        message: e.to_string(),
    })
}

/// Returns the manifest from raw entries.
pub(crate) fn find_manifest(entries: &[(String, Vec<u8>)]) -> Result<Manifest, FormatError> {
    let (_, bytes) = entries
        .iter()
        .find(|(name, _)| name == MANIFEST_ENTRY)
        .ok_or(FormatError::MissingEntry {
            name: MANIFEST_ENTRY,
        })?;
    parse_manifest(bytes)
}

/// Reads a container.
///
/// # Errors
///
/// Returns [`FormatError`] if the archive is unreadable, the first entry is
/// not an uncompressed `mimetype` with the expected content, or the manifest
/// or step log is missing or unparsable.
pub fn read(bytes: &[u8]) -> Result<ContainerContents, FormatError> {
    let mut manifest = None;
    let mut step_log = None;
    let mut viewer = None;
    let mut artifacts = BTreeMap::new();

    for (name, content) in read_entries(bytes)? {
        match name.as_str() {
            MANIFEST_ENTRY => manifest = Some(parse_manifest(&content)?),
            STEPS_ENTRY => step_log = Some(content),
            VIEWER_ENTRY => {
                viewer = Some(String::from_utf8(content).map_err(|_| FormatError::ViewerNotUtf8)?);
            },
            _ => {
                artifacts.insert(name, content);
            },
        }
    }

    let manifest = manifest.ok_or(FormatError::MissingEntry {
        name: MANIFEST_ENTRY,
    })?;
    let step_log = step_log.ok_or(FormatError::MissingEntry { name: STEPS_ENTRY })?;
    let steps = parse_step_log(&step_log)?;

    Ok(ContainerContents {
        manifest,
        steps,
        step_log,
        artifacts,
        viewer,
    })
}
