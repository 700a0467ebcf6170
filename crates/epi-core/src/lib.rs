//! # epi-core
//!
//! Tamper-evident evidence containers for recorded agent workflows.
//!
//! A container bundles a [`Manifest`], a step log and artifacts into a ZIP
//! archive. Every content entry is bound to the manifest by its SHA-256
//! digest, and the manifest is signed with Ed25519 over its canonical
//! encoding, so a third party holding the signer's public key can check that
//! nothing was altered after recording.
//!
//! ## Modules
//!
//! - [`redact`]: secret scrubbing applied before anything is persisted
//! - [`manifest`]: manifest and step-record types
//! - [`canonical`]: deterministic manifest encoding used as signing input
//! - [`trust`]: keys, signing and signature verification
//! - [`container`]: packing, reading and verifying archives
//! - [`recorder`]: staging sessions that end in a packed container
//! - [`hash`]: content digests
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use epi_core::container::{self, PackOptions};
//! use epi_core::recorder::Recorder;
//! use epi_core::redact::Redactor;
//! use epi_core::trust::{generate_signing_key, KeyId, TrustedKeys};
//! use serde_json::json;
//!
//! let key = generate_signing_key();
//! let key_id = KeyId::new("default")?;
//!
//! let mut recorder = Recorder::new(None, Redactor::new())?;
//! recorder.log_step("llm.request", &json!({ "prompt": "hello" }))?;
//! recorder.finish(Path::new("run.epi"), &PackOptions::new().sign_with(&key, &key_id))?;
//!
//! let bytes = std::fs::read("run.epi")?;
//! let trusted = TrustedKeys::single(key_id, key.verifying_key());
//! let report = container::verify_container(&bytes, &trusted)?;
//! assert!(report.is_trusted());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod canonical;
pub mod container;
pub mod hash;
pub mod manifest;
pub mod recorder;
pub mod redact;
pub mod trust;

pub use container::{
    pack, read, verify_container, verify_integrity, ContainerContents, FormatError,
    IntegrityReport, PackOptions, TrustLevel, VerificationReport,
};
pub use manifest::{Manifest, StepRecord};
pub use recorder::Recorder;
pub use redact::Redactor;
pub use trust::{KeyId, SignatureVerification, TrustedKeys};
