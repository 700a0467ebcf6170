//! Key handling, manifest signing and signature verification.
//!
//! Containers are signed with Ed25519 over the canonical manifest bytes. The
//! signature string names the key id; verifiers resolve it through a
//! [`PublicKeyLookup`], usually a [`TrustedKeys`] registry.
//!
//! # Example
//!
//! ```
//! use epi_core::manifest::Manifest;
//! use epi_core::trust::{generate_signing_key, sign_manifest, verify_signature, KeyId, TrustedKeys};
//!
//! let key = generate_signing_key();
//! let key_id = KeyId::new("default").unwrap();
//! let trusted = TrustedKeys::single(key_id.clone(), key.verifying_key());
//!
//! let mut manifest = Manifest::new();
//! sign_manifest(&mut manifest, &key, &key_id).unwrap();
//! assert!(verify_signature(&manifest, &trusted).is_valid());
//! ```

mod keys;
mod sign;

pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use keys::{
    generate_signing_key, FileKeyStore, KeyId, KeyIdError, KeyStore, KeyStoreError,
    MemoryKeyStore, PublicKeyLookup, TrustedKeys, MAX_KEY_ID_LEN,
};
pub use sign::{
    format_signature, parse_signature, sign, sign_bytes, sign_manifest, sign_value,
    verify_payload, verify_signature, verify_value, ParsedSignature, SignatureAlgorithm,
    SignatureError, SignatureVerification,
};
