//! Capture events, sealed batches and the sinks that persist them.
//!
//! A [`Batch`] is the unit of persistence: every flush of the worker buffer
//! produces exactly one batch with a fresh id. When a signing key is
//! configured the batch carries an Ed25519 signature over its canonical
//! encoding (minus the `signature` field itself), using the same wire format
//! as container manifests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use epi_core::canonical::{self, CanonicalError};
use epi_core::trust::{self, KeyId, PublicKeyLookup, SignatureVerification, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// File name prefix for persisted batches.
pub const BATCH_FILE_PREFIX: &str = "evidence_";

/// Nesting depth of an item inside a batch (`batch.items[i]`).
const ITEM_DEPTH: usize = 2;

/// A single piece of evidence submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Free-form category, e.g. `llm.request`.
    pub kind: String,
    /// Event payload.
    pub content: Value,
    /// Caller metadata such as timestamps, tags or trace ids.
    #[serde(default = "empty_object")]
    pub meta: Value,
}

impl CaptureEvent {
    /// Creates an event with empty metadata.
    #[must_use]
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            content,
            meta: empty_object(),
        }
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// Checks that a batch carrying this event can be canonically encoded
    /// for signing.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] for keys that collide after NFC
    /// normalization or nesting too deep to fit inside a batch.
    pub fn check_signable(&self) -> Result<(), CanonicalError> {
        let value = serde_json::to_value(self).map_err(|err| CanonicalError::Serialize {
            message: err.to_string(),
        })?;
        canonical::check_nested(&value, ITEM_DEPTH)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A flushed group of events, as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique id, `batch_<timestamp>_<suffix>`.
    pub batch_id: String,
    /// RFC 3339 creation time (UTC, microseconds).
    pub created_at: String,
    /// Number of items.
    pub count: usize,
    /// Events in enqueue order.
    pub items: Vec<CaptureEvent>,
    /// Whether `signature` is present and was produced by the worker.
    pub signed: bool,
    /// `ed25519:<key_id>:<base64>` over the canonical batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Batch {
    /// Seals `items` into an unsigned batch with a fresh id.
    #[must_use]
    pub fn new(items: Vec<CaptureEvent>) -> Self {
        let now = Utc::now();
        Self {
            batch_id: batch_id_at(now),
            created_at: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            count: items.len(),
            items,
            signed: false,
            signature: None,
        }
    }

    /// Signs the batch in place.
    ///
    /// `signed` is set before signing so the flag itself is covered.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if the batch cannot be canonicalized, in
    /// which case the batch is left unsigned.
    pub fn sign(&mut self, signing_key: &SigningKey, key_id: &KeyId) -> Result<(), CanonicalError> {
        self.signed = true;
        self.signature = None;
        let result = serde_json::to_value(&*self)
            .map_err(|err| CanonicalError::Serialize {
                message: err.to_string(),
            })
            .and_then(|value| trust::sign_value(&value, signing_key, key_id));
        match result {
            Ok(signature) => {
                self.signature = Some(signature);
                Ok(())
            },
            Err(err) => {
                self.signed = false;
                Err(err)
            },
        }
    }

    /// Verifies the batch signature against `keys`.
    #[must_use]
    pub fn verify(&self, keys: &impl PublicKeyLookup) -> SignatureVerification {
        match serde_json::to_value(self) {
            Ok(value) => trust::verify_value(&value, keys),
            Err(err) => SignatureVerification::Invalid(
                CanonicalError::Serialize {
                    message: err.to_string(),
                }
                .into(),
            ),
        }
    }

    /// Storage file name for this batch.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{BATCH_FILE_PREFIX}{}.json", self.batch_id)
    }
}

/// Generates `batch_<YYYYmmdd_HHMMSS_ffffff>_<8 hex>` for a batch sealed at
/// `now`.
///
/// The random suffix keeps ids unique when two flushes land in the same
/// microsecond.
#[must_use]
pub fn batch_id_at(now: DateTime<Utc>) -> String {
    let timestamp = now.format("%Y%m%d_%H%M%S_%6f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("batch_{timestamp}_{}", &suffix[..8])
}

/// Failure to persist a batch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerPersistenceError {
    /// Signing failed.
    #[error("failed to sign batch {batch_id}: {source}")]
    Sign {
        /// Batch id.
        batch_id: String,
        /// Underlying error.
        #[source]
        source: CanonicalError,
    },

    /// Serialization failed.
    #[error("failed to serialize batch {batch_id}: {source}")]
    Serialize {
        /// Batch id.
        batch_id: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem error.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The sink refused the batch.
    #[error("sink rejected batch {batch_id}: {reason}")]
    Rejected {
        /// Batch id.
        batch_id: String,
        /// Reason given by the sink.
        reason: String,
    },
}

/// Destination for sealed batches.
///
/// Called only from the worker's consumer thread, one batch at a time.
pub trait BatchSink: Send + Sync {
    /// Durably stores `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerPersistenceError`] if the batch was not stored.
    fn persist(&self, batch: &Batch) -> Result<(), WorkerPersistenceError>;
}

/// Writes each batch to `<dir>/evidence_<batch_id>.json`.
///
/// Files are written to a temporary sibling, fsynced, then renamed, so a
/// reader never observes a partial batch. An existing batch file is never
/// replaced.
#[derive(Debug, Clone)]
pub struct FileBatchSink {
    dir: PathBuf,
}

impl FileBatchSink {
    /// Opens (creating if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerPersistenceError::Io`] if the directory cannot be
    /// created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, WorkerPersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| WorkerPersistenceError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a batch is written to.
    #[must_use]
    pub fn path_for(&self, batch: &Batch) -> PathBuf {
        self.dir.join(batch.file_name())
    }
}

impl BatchSink for FileBatchSink {
    fn persist(&self, batch: &Batch) -> Result<(), WorkerPersistenceError> {
        let bytes =
            serde_json::to_vec_pretty(batch).map_err(|source| WorkerPersistenceError::Serialize {
                batch_id: batch.batch_id.clone(),
                source,
            })?;
        let path = self.path_for(batch);
        let io_err = |source| WorkerPersistenceError::Io {
            path: path.clone(),
            source,
        };

        let mut temp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp.write_all(&bytes).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist_noclobber(&path).map_err(|err| io_err(err.error))?;

        debug!(batch_id = %batch.batch_id, path = %path.display(), "batch file written");
        Ok(())
    }
}

/// In-memory sink that keeps every persisted batch.
///
/// Can be switched into a failing mode to exercise persistence errors.
#[derive(Debug, Default)]
pub struct MemoryBatchSink {
    batches: Mutex<Vec<Batch>>,
    failing: AtomicBool,
}

impl MemoryBatchSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When `true`, every `persist` call is rejected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of the stored batches, in persist order.
    #[must_use]
    pub fn batches(&self) -> Vec<Batch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total items across stored batches.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|batch| batch.count)
            .sum()
    }
}

impl BatchSink for MemoryBatchSink {
    fn persist(&self, batch: &Batch) -> Result<(), WorkerPersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorkerPersistenceError::Rejected {
                batch_id: batch.batch_id.clone(),
                reason: "sink is in failing mode".to_string(),
            });
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use epi_core::trust::{generate_signing_key, TrustedKeys};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn events(n: usize) -> Vec<CaptureEvent> {
        (0..n)
            .map(|i| CaptureEvent::new("llm.request", json!({ "seq": i })))
            .collect()
    }

    #[test]
    fn test_batch_id_shape() {
        let id = batch_id_at(Utc::now());
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 5, "{id}");
        assert_eq!(parts[0], "batch");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 6);
        assert_eq!(parts[4].len(), 8);
        assert!(parts[4].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let now = Utc::now();
        let a = batch_id_at(now);
        let b = batch_id_at(now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_batch_id_and_created_at_share_one_instant() {
        let batch = Batch::new(events(1));
        let created = DateTime::parse_from_rfc3339(&batch.created_at).unwrap();
        let stamp = created.format("%Y%m%d_%H%M%S_%6f").to_string();
        assert!(
            batch.batch_id.starts_with(&format!("batch_{stamp}_")),
            "{} vs {}",
            batch.batch_id,
            batch.created_at
        );
    }

    #[test]
    fn test_nfc_colliding_keys_are_not_signable() {
        let colliding: Value = serde_json::from_str(r#"{"caf\u00e9":1,"cafe\u0301":2}"#).unwrap();
        let event = CaptureEvent::new("llm.request", colliding);
        assert!(matches!(
            event.check_signable(),
            Err(CanonicalError::DuplicateKey { .. })
        ));
        assert!(CaptureEvent::new("llm.request", json!({ "caf\u{e9}": 1 }))
            .check_signable()
            .is_ok());
    }

    #[test]
    fn test_event_meta_defaults_to_empty_object() {
        let event: CaptureEvent =
            serde_json::from_value(json!({ "kind": "api.call", "content": { "x": 1 } })).unwrap();
        assert_eq!(event.meta, json!({}));
    }

    #[test]
    fn test_new_batch_counts_items() {
        let batch = Batch::new(events(3));
        assert_eq!(batch.count, 3);
        assert!(!batch.signed);
        assert!(batch.signature.is_none());
        assert!(batch.created_at.ends_with('Z'));
    }

    #[test]
    fn test_signed_batch_verifies() {
        let key = generate_signing_key();
        let key_id = KeyId::new("gateway").unwrap();
        let mut batch = Batch::new(events(2));
        batch.sign(&key, &key_id).unwrap();

        assert!(batch.signed);
        assert!(batch
            .signature
            .as_deref()
            .unwrap()
            .starts_with("ed25519:gateway:"));
        let keys = TrustedKeys::single(key_id, key.verifying_key());
        assert!(batch.verify(&keys).is_valid());
    }

    #[test]
    fn test_tampered_batch_fails_verification() {
        let key = generate_signing_key();
        let key_id = KeyId::new("gateway").unwrap();
        let mut batch = Batch::new(events(2));
        batch.sign(&key, &key_id).unwrap();
        batch.items[1].content = json!({ "seq": 99 });

        let keys = TrustedKeys::single(key_id, key.verifying_key());
        assert!(matches!(
            batch.verify(&keys),
            SignatureVerification::Invalid(_)
        ));
    }

    #[test]
    fn test_unsigned_batch_serializes_without_signature() {
        let value = serde_json::to_value(Batch::new(events(1))).unwrap();
        assert!(value.get("signature").is_none());
        assert_eq!(value["signed"], json!(false));
    }

    #[test]
    fn test_file_sink_writes_named_file() {
        let dir = TempDir::new().unwrap();
        let sink = FileBatchSink::open(dir.path().join("vault")).unwrap();
        let batch = Batch::new(events(4));
        sink.persist(&batch).unwrap();

        let path = sink.path_for(&batch);
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("evidence_batch_"));
        let stored: Batch = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored, batch);

        let leftovers = std::fs::read_dir(sink.dir()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files must not remain");
    }

    #[test]
    fn test_file_sink_never_overwrites_a_batch() {
        let dir = TempDir::new().unwrap();
        let sink = FileBatchSink::open(dir.path()).unwrap();
        let original = Batch::new(events(2));
        sink.persist(&original).unwrap();

        let mut impostor = Batch::new(events(5));
        impostor.batch_id.clone_from(&original.batch_id);
        assert!(matches!(
            sink.persist(&impostor),
            Err(WorkerPersistenceError::Io { .. })
        ));

        let stored: Batch =
            serde_json::from_slice(&std::fs::read(sink.path_for(&original)).unwrap()).unwrap();
        assert_eq!(stored, original);
        assert_eq!(std::fs::read_dir(sink.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_memory_sink_failing_mode() {
        let sink = MemoryBatchSink::new();
        sink.set_failing(true);
        assert!(matches!(
            sink.persist(&Batch::new(events(1))),
            Err(WorkerPersistenceError::Rejected { .. })
        ));
        sink.set_failing(false);
        sink.persist(&Batch::new(events(2))).unwrap();
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.item_count(), 2);
    }
}
