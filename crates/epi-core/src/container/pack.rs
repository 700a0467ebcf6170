//! Container packer and in-place re-signing.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::read::read;
use super::verify::verify_integrity;
use super::viewer::{reembed_viewer, render_viewer, viewer_template_form, DEFAULT_VIEWER_TEMPLATE};
use super::{
    ContainerError, MANIFEST_ENTRY, MIMETYPE, MIMETYPE_ENTRY, RESERVED_ENTRIES, STEPS_ENTRY,
    VIEWER_ENTRY,
};
use crate::hash::ContentHasher;
use crate::manifest::{parse_step_log, Manifest};
use crate::trust::{sign_manifest, KeyId};

/// Options controlling [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions<'a> {
    signer: Option<(&'a SigningKey, &'a KeyId)>,
    viewer_template: Option<Cow<'a, str>>,
}

impl Default for PackOptions<'_> {
    fn default() -> Self {
        Self {
            signer: None,
            viewer_template: Some(Cow::Borrowed(DEFAULT_VIEWER_TEMPLATE)),
        }
    }
}

impl<'a> PackOptions<'a> {
    /// Unsigned, with the default viewer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signs the manifest once digests are populated.
    #[must_use]
    pub fn sign_with(mut self, key: &'a SigningKey, key_id: &'a KeyId) -> Self {
        self.signer = Some((key, key_id));
        self
    }

    /// Uses a custom viewer template.
    #[must_use]
    pub fn viewer_template(mut self, template: impl Into<Cow<'a, str>>) -> Self {
        self.viewer_template = Some(template.into());
        self
    }

    /// Omits `viewer.html`.
    #[must_use]
    pub fn without_viewer(mut self) -> Self {
        self.viewer_template = None;
        self
    }
}

/// Result of packing a container.
#[derive(Debug, Clone)]
pub struct PackSummary {
    /// The manifest as written, with digests and signature.
    pub manifest: Manifest,
    /// Entry names in archive order.
    pub entries: Vec<String>,
    /// Number of steps in the step log.
    pub step_count: usize,
    /// Number of artifacts.
    pub artifact_count: usize,
    /// Size of the archive in bytes.
    pub size: u64,
}

impl PackSummary {
    /// Returns `true` if the written manifest is signed.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.manifest.is_signed()
    }
}

/// Packs `source_dir` into a container at `output`.
///
/// The archive is built in a temporary file next to `output`, synced, then
/// renamed over it. A failure leaves any existing file at `output` intact.
///
/// # Errors
///
/// Returns [`ContainerError::SourceLayout`] if `steps.jsonl` is missing, a
/// reserved entry name is present, or a source entry is a symlink; other
/// variants for I/O, step log, signing and archive failures.
pub fn pack(
    source_dir: &Path,
    manifest: Manifest,
    output: &Path,
    options: &PackOptions<'_>,
) -> Result<PackSummary, ContainerError> {
    let (bytes, summary) = pack_to_bytes(source_dir, manifest, options)?;
    write_atomic(output, &bytes)?;
    info!(
        path = %output.display(),
        workflow_id = %summary.manifest.workflow_id,
        steps = summary.step_count,
        artifacts = summary.artifact_count,
        signed = summary.is_signed(),
        size = summary.size,
        "packed evidence container"
    );
    Ok(summary)
}

/// Packs `source_dir` into an in-memory container.
///
/// # Errors
///
/// Same as [`pack`], minus the final write.
pub fn pack_to_bytes(
    source_dir: &Path,
    mut manifest: Manifest,
    options: &PackOptions<'_>,
) -> Result<(Vec<u8>, PackSummary), ContainerError> {
    let files = collect_source_files(source_dir)?;
    let steps_path = source_dir.join(STEPS_ENTRY);
    let step_log = match files.get(STEPS_ENTRY) {
        Some(path) => read_file(path)?,
        None => {
            return Err(ContainerError::SourceLayout {
                path: steps_path,
                reason: "steps.jsonl is required".to_string(),
            });
        },
    };
    let steps = parse_step_log(&step_log)?;

    let mut artifacts = BTreeMap::new();
    for (name, path) in &files {
        if name != STEPS_ENTRY {
            artifacts.insert(name.clone(), read_file(path)?);
        }
    }

    manifest.file_manifest.clear();
    manifest
        .file_manifest
        .insert(STEPS_ENTRY.to_string(), ContentHasher::hash_hex(&step_log));
    for (name, content) in &artifacts {
        manifest
            .file_manifest
            .insert(name.clone(), ContentHasher::hash_hex(content));
    }
    if let Some(template) = options.viewer_template.as_deref() {
        let form = viewer_template_form(template)?;
        manifest
            .file_manifest
            .insert(VIEWER_ENTRY.to_string(), ContentHasher::hash_hex(form.as_bytes()));
    }

    if let Some((key, key_id)) = options.signer {
        sign_manifest(&mut manifest, key, key_id)?;
    } else {
        manifest.signature = None;
    }

    let viewer = options
        .viewer_template
        .as_deref()
        .map(|template| render_viewer(template, &manifest, &steps))
        .transpose()?;

    let (bytes, entries) = write_archive(&manifest, &step_log, &artifacts, viewer.as_deref())?;
    debug!(entries = entries.len(), "built container archive");
    let summary = PackSummary {
        manifest,
        entries,
        step_count: steps.len(),
        artifact_count: artifacts.len(),
        size: bytes.len() as u64,
    };
    Ok((bytes, summary))
}

/// Signs the container at `path` in place.
///
/// The container is read, checked against its digests, signed, rebuilt and
/// atomically renamed over the original. An embedded viewer is refreshed
/// with the signed manifest. Returns the signed manifest.
///
/// # Errors
///
/// Returns [`ContainerError::IntegrityFailed`] if the contents do not match
/// their digests, or other variants for I/O, format and signing failures.
pub fn sign_container(
    path: &Path,
    signing_key: &SigningKey,
    key_id: &KeyId,
) -> Result<Manifest, ContainerError> {
    let bytes = read_file(path)?;
    let report = verify_integrity(&bytes)?;
    if !report.is_ok() {
        return Err(ContainerError::IntegrityFailed {
            mismatches: report.mismatches.len(),
        });
    }

    let mut contents = read(&bytes)?;
    sign_manifest(&mut contents.manifest, signing_key, key_id)?;
    let viewer = contents
        .viewer
        .as_deref()
        .map(|html| reembed_viewer(html, &contents.manifest, &contents.steps))
        .transpose()?;

    let (signed, _) = write_archive(
        &contents.manifest,
        &contents.step_log,
        &contents.artifacts,
        viewer.as_deref(),
    )?;
    write_atomic(path, &signed)?;
    info!(
        path = %path.display(),
        key_id = %key_id,
        workflow_id = %contents.manifest.workflow_id,
        "signed evidence container"
    );
    Ok(contents.manifest)
}

/// Writes the archive in canonical entry order.
fn write_archive(
    manifest: &Manifest,
    step_log: &[u8],
    artifacts: &BTreeMap<String, Vec<u8>>,
    viewer: Option<&str>,
) -> Result<(Vec<u8>, Vec<String>), ContainerError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut entries = Vec::with_capacity(artifacts.len() + 4);
    let mut put = |name: &str,
                   content: &[u8],
                   method: CompressionMethod|
     -> Result<(), ContainerError> {
        writer.start_file(name, entry_options(method))?;
        writer.write_all(content).map_err(|e| ContainerError::Zip {
            message: format!("cannot write entry {name}: {e}"),
        })?;
        entries.push(name.to_string());
        Ok(())
    };

    put(MIMETYPE_ENTRY, MIMETYPE.as_bytes(), CompressionMethod::Stored)?;
    put(
        MANIFEST_ENTRY,
        &manifest.to_json_pretty()?,
        CompressionMethod::Deflated,
    )?;
    put(STEPS_ENTRY, step_log, CompressionMethod::Deflated)?;
    for (name, content) in artifacts {
        put(name, content, CompressionMethod::Deflated)?;
    }
    if let Some(html) = viewer {
        put(VIEWER_ENTRY, html.as_bytes(), CompressionMethod::Deflated)?;
    }

    let cursor = writer.finish()?;
    Ok((cursor.into_inner(), entries))
}

/// Fixed timestamp and mode so identical inputs give identical archives.
fn entry_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

/// Lists regular files under `dir` keyed by `/`-separated relative path.
fn collect_source_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>, ContainerError> {
    let mut files = BTreeMap::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];
    while let Some((current, prefix)) = pending.pop() {
        let read_dir = fs::read_dir(&current).map_err(|source| ContainerError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry.map_err(|source| ContainerError::Io {
                path: current.clone(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| ContainerError::Io {
                path: path.clone(),
                source,
            })?;
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                return Err(ContainerError::SourceLayout {
                    path,
                    reason: "file name is not valid UTF-8".to_string(),
                });
            };
            let name = format!("{prefix}{file_name}");

            if file_type.is_symlink() {
                return Err(ContainerError::SourceLayout {
                    path,
                    reason: "symlinks are not packed".to_string(),
                });
            }
            if file_type.is_dir() {
                pending.push((path, format!("{name}/")));
                continue;
            }
            if RESERVED_ENTRIES.contains(&name.as_str()) {
                return Err(ContainerError::SourceLayout {
                    path,
                    reason: format!("{name} is a reserved entry name"),
                });
            }
            files.insert(name, path);
        }
    }
    Ok(files)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ContainerError> {
    fs::read(path).map_err(|source| ContainerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `bytes` to `path` via a synced temp file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ContainerError> {
    let io_err = |source| ContainerError::Io {
        path: path.to_path_buf(),
        source,
    };
    if fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink()) {
        return Err(ContainerError::SourceLayout {
            path: path.to_path_buf(),
            reason: "refusing to replace a symlink".to_string(),
        });
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(io_err)?;
    }
    tmp.as_file_mut().write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::manifest::{encode_step_log, StepRecord};
    use crate::trust::{generate_signing_key, verify_signature, TrustedKeys};

    fn step_log_of(steps: &[StepRecord]) -> Vec<u8> {
        encode_step_log(steps).unwrap()
    }

    fn source_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let steps = vec![
            StepRecord::new(0, "llm.request", json!({ "prompt": "hello" })),
            StepRecord::new(1, "llm.response", json!({ "text": "hi" })),
        ];
        fs::write(dir.path().join(STEPS_ENTRY), step_log_of(&steps)).unwrap();
        fs::create_dir(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/report.txt"), b"done").unwrap();
        fs::write(dir.path().join("data.bin"), [0u8, 1, 2, 255]).unwrap();
        dir
    }

    #[test]
    fn test_entry_order() {
        let dir = source_dir();
        let (_, summary) =
            pack_to_bytes(dir.path(), Manifest::new(), &PackOptions::new()).unwrap();
        assert_eq!(
            summary.entries,
            [
                MIMETYPE_ENTRY,
                MANIFEST_ENTRY,
                STEPS_ENTRY,
                "data.bin",
                "out/report.txt",
                VIEWER_ENTRY
            ]
        );
        assert_eq!(summary.step_count, 2);
        assert_eq!(summary.artifact_count, 2);
    }

    #[test]
    fn test_file_manifest_populated() {
        let dir = source_dir();
        let (bytes, summary) =
            pack_to_bytes(dir.path(), Manifest::new(), &PackOptions::new()).unwrap();
        let fm = &summary.manifest.file_manifest;
        assert_eq!(fm.len(), 4);
        assert_eq!(fm["out/report.txt"], ContentHasher::hash_hex(b"done"));
        assert_eq!(
            fm[VIEWER_ENTRY],
            ContentHasher::hash_hex(DEFAULT_VIEWER_TEMPLATE.as_bytes())
        );
        assert!(!fm.contains_key(MANIFEST_ENTRY));
        assert!(verify_integrity(&bytes).unwrap().is_ok());
    }

    #[test]
    fn test_missing_steps_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let err = pack_to_bytes(dir.path(), Manifest::new(), &PackOptions::new()).unwrap_err();
        assert!(matches!(err, ContainerError::SourceLayout { .. }));
    }

    #[test]
    fn test_empty_steps_allowed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STEPS_ENTRY), b"").unwrap();
        let (bytes, summary) = pack_to_bytes(
            dir.path(),
            Manifest::new(),
            &PackOptions::new().without_viewer(),
        )
        .unwrap();
        assert_eq!(summary.step_count, 0);
        assert!(read(&bytes).unwrap().steps.is_empty());
    }

    #[test]
    fn test_reserved_names_rejected() {
        for reserved in RESERVED_ENTRIES {
            let dir = source_dir();
            fs::write(dir.path().join(reserved), b"x").unwrap();
            let err =
                pack_to_bytes(dir.path(), Manifest::new(), &PackOptions::new()).unwrap_err();
            assert!(
                matches!(err, ContainerError::SourceLayout { .. }),
                "{reserved} accepted"
            );
        }
    }

    #[test]
    fn test_signed_pack_verifies() {
        let dir = source_dir();
        let key = generate_signing_key();
        let key_id = KeyId::new("default").unwrap();
        let options = PackOptions::new().sign_with(&key, &key_id);
        let (bytes, summary) = pack_to_bytes(dir.path(), Manifest::new(), &options).unwrap();
        assert!(summary.is_signed());

        let contents = read(&bytes).unwrap();
        let trusted = TrustedKeys::single(key_id, key.verifying_key());
        assert!(verify_signature(&contents.manifest, &trusted).is_valid());
    }

    #[test]
    fn test_pack_replaces_existing_file() {
        let dir = source_dir();
        let out = TempDir::new().unwrap();
        let target = out.path().join("run.epi");
        fs::write(&target, b"old").unwrap();

        pack(dir.path(), Manifest::new(), &target, &PackOptions::new()).unwrap();
        let bytes = fs::read(&target).unwrap();
        assert!(read(&bytes).is_ok());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_pack_keeps_existing_file() {
        let out = TempDir::new().unwrap();
        let target = out.path().join("run.epi");
        fs::write(&target, b"old").unwrap();

        let empty = TempDir::new().unwrap();
        assert!(pack(empty.path(), Manifest::new(), &target, &PackOptions::new()).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_sign_container_in_place() {
        let dir = source_dir();
        let out = TempDir::new().unwrap();
        let target = out.path().join("run.epi");
        pack(dir.path(), Manifest::new(), &target, &PackOptions::new()).unwrap();
        let before = read(&fs::read(&target).unwrap()).unwrap();
        assert!(!before.manifest.is_signed());

        let key = generate_signing_key();
        let key_id = KeyId::new("default").unwrap();
        let signed = sign_container(&target, &key, &key_id).unwrap();
        assert!(signed.is_signed());

        let bytes = fs::read(&target).unwrap();
        let after = read(&bytes).unwrap();
        assert_eq!(after.manifest, signed);
        assert_eq!(after.artifacts, before.artifacts);
        assert_eq!(after.step_log, before.step_log);
        assert!(verify_integrity(&bytes).unwrap().is_ok());

        let embedded = crate::container::extract_viewer_data(after.viewer.as_deref().unwrap())
            .unwrap();
        assert_eq!(
            embedded["manifest"]["signature"].as_str(),
            signed.signature.as_deref()
        );
    }
}
