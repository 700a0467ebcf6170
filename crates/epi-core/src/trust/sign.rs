//! Manifest signing and signature verification.
//!
//! Signatures travel as a single string `<algorithm>:<key_id>:<base64>`
//! where the base64 (standard alphabet, padded) decodes to a 64-byte Ed25519
//! signature over the canonical manifest bytes.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, SIGNATURE_LENGTH};
use serde_json::Value;
use thiserror::Error;

use super::keys::{KeyId, PublicKeyLookup};
use crate::canonical::{self, CanonicalError, SIGNATURE_FIELD};
use crate::manifest::Manifest;

/// Number of colon-separated fields in a signature string.
const SIGNATURE_FIELDS: usize = 3;

/// Signature algorithms understood by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureAlgorithm {
    /// Ed25519 (RFC 8032).
    Ed25519,
}

impl SignatureAlgorithm {
    /// Returns the tag used in the signature string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
        }
    }

    /// Parses a signature string tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ed25519" => Some(Self::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a signature is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureError {
    /// The signature string does not have exactly three fields.
    #[error("malformed signature: expected 3 colon-separated fields, found {fields}")]
    Malformed {
        /// Number of fields found.
        fields: usize,
    },

    /// The algorithm tag is not recognised.
    #[error("unsupported signature algorithm: {tag}")]
    UnknownAlgorithm {
        /// The tag found.
        tag: String,
    },

    /// The key id field is not a valid key id.
    #[error("invalid key id in signature: {reason}")]
    InvalidKeyId {
        /// Validation message.
        reason: String,
    },

    /// The signature payload is not valid base64.
    #[error("invalid signature encoding: {reason}")]
    InvalidEncoding {
        /// Decoder message.
        reason: String,
    },

    /// The decoded signature has the wrong length.
    #[error("invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length.
        expected: usize,
        /// Decoded length.
        actual: usize,
    },

    /// No public key is registered under the signature's key id.
    #[error("no trusted public key for key id {key_id}")]
    UnknownKey {
        /// The key id named by the signature.
        key_id: String,
    },

    /// The signature does not verify against the canonical payload.
    #[error("signature verification failed for key id {key_id}")]
    VerificationFailed {
        /// The key id named by the signature.
        key_id: String,
    },

    /// The payload could not be canonicalized.
    #[error("cannot canonicalize signed payload: {0}")]
    Canonical(#[from] CanonicalError),
}

/// A decoded signature string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Signature algorithm.
    pub algorithm: SignatureAlgorithm,
    /// Key id naming the verifying key.
    pub key_id: KeyId,
    /// Raw signature.
    pub signature: Signature,
}

/// Outcome of verifying a manifest signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureVerification {
    /// The signature verifies under the named key.
    Valid {
        /// Key id of the verifying key.
        key_id: KeyId,
    },
    /// No signature present.
    Unsigned,
    /// The signature is present but rejected.
    Invalid(SignatureError),
}

impl SignatureVerification {
    /// Returns `true` for [`SignatureVerification::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Human-readable description of the outcome.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Valid { key_id } => format!("valid signature (key: {key_id})"),
            Self::Unsigned => "no signature present".to_string(),
            Self::Invalid(err) => err.to_string(),
        }
    }
}

/// Formats a signature string for `signature` under `key_id`.
#[must_use]
pub fn format_signature(key_id: &KeyId, signature: &Signature) -> String {
    format!(
        "{}:{}:{}",
        SignatureAlgorithm::Ed25519,
        key_id,
        STANDARD.encode(signature.to_bytes())
    )
}

/// Signs arbitrary canonical bytes and returns the signature string.
#[must_use]
pub fn sign_bytes(payload: &[u8], signing_key: &SigningKey, key_id: &KeyId) -> String {
    format_signature(key_id, &signing_key.sign(payload))
}

/// Computes the signature string for a manifest.
///
/// The manifest's existing `signature` field is ignored, so re-signing a
/// signed manifest produces a signature over the same payload.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the manifest cannot be canonicalized.
pub fn sign(
    manifest: &Manifest,
    signing_key: &SigningKey,
    key_id: &KeyId,
) -> Result<String, CanonicalError> {
    let payload = canonical::canonicalize(manifest)?;
    Ok(sign_bytes(&payload, signing_key, key_id))
}

/// Signs a manifest in place, replacing any existing signature.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the manifest cannot be canonicalized.
pub fn sign_manifest(
    manifest: &mut Manifest,
    signing_key: &SigningKey,
    key_id: &KeyId,
) -> Result<(), CanonicalError> {
    manifest.signature = Some(sign(manifest, signing_key, key_id)?);
    Ok(())
}

/// Signs a JSON object over its canonical form without `signature`.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value cannot be canonicalized.
pub fn sign_value(
    value: &Value,
    signing_key: &SigningKey,
    key_id: &KeyId,
) -> Result<String, CanonicalError> {
    let payload = canonical::canonicalize_without(value, SIGNATURE_FIELD)?;
    Ok(sign_bytes(&payload, signing_key, key_id))
}

/// Parses a `<algorithm>:<key_id>:<base64>` signature string.
///
/// # Errors
///
/// Returns [`SignatureError`] describing the first structural problem found.
pub fn parse_signature(value: &str) -> Result<ParsedSignature, SignatureError> {
    let fields: Vec<&str> = value.trim().split(':').collect();
    if fields.len() != SIGNATURE_FIELDS {
        return Err(SignatureError::Malformed {
            fields: fields.len(),
        });
    }

    let algorithm =
        SignatureAlgorithm::from_tag(fields[0]).ok_or_else(|| SignatureError::UnknownAlgorithm {
            tag: fields[0].to_string(),
        })?;
    let key_id = KeyId::new(fields[1]).map_err(|e| SignatureError::InvalidKeyId {
        reason: e.to_string(),
    })?;
    let raw = STANDARD
        .decode(fields[2])
        .map_err(|e| SignatureError::InvalidEncoding {
            reason: e.to_string(),
        })?;
    let bytes: [u8; SIGNATURE_LENGTH] =
        raw.as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidLength {
                expected: SIGNATURE_LENGTH,
                actual: raw.len(),
            })?;

    Ok(ParsedSignature {
        algorithm,
        key_id,
        signature: Signature::from_bytes(&bytes),
    })
}

/// Verifies a signature string over `payload`.
///
/// `None` or a blank string is [`SignatureVerification::Unsigned`].
pub fn verify_payload(
    payload: &[u8],
    signature: Option<&str>,
    keys: &impl PublicKeyLookup,
) -> SignatureVerification {
    let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
        return SignatureVerification::Unsigned;
    };
    let parsed = match parse_signature(signature) {
        Ok(parsed) => parsed,
        Err(err) => return SignatureVerification::Invalid(err),
    };
    let Some(verifying_key) = keys.public_key(&parsed.key_id) else {
        return SignatureVerification::Invalid(SignatureError::UnknownKey {
            key_id: parsed.key_id.to_string(),
        });
    };
    let key_id = parsed.key_id;
    match verifying_key.verify_strict(payload, &parsed.signature) {
        Ok(()) => SignatureVerification::Valid { key_id },
        Err(_) => SignatureVerification::Invalid(SignatureError::VerificationFailed {
            key_id: key_id.to_string(),
        }),
    }
}

/// Verifies a manifest's signature against trusted keys.
#[must_use]
pub fn verify_signature(manifest: &Manifest, keys: &impl PublicKeyLookup) -> SignatureVerification {
    if !manifest.is_signed() {
        return SignatureVerification::Unsigned;
    }
    match canonical::canonicalize(manifest) {
        Ok(payload) => verify_payload(&payload, manifest.signature.as_deref(), keys),
        Err(err) => SignatureVerification::Invalid(err.into()),
    }
}

/// Verifies the `signature` member of a JSON object against the canonical
/// form of the rest of the object.
#[must_use]
pub fn verify_value(value: &Value, keys: &impl PublicKeyLookup) -> SignatureVerification {
    let signature = value
        .get(SIGNATURE_FIELD)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty());
    if signature.is_none() {
        return SignatureVerification::Unsigned;
    }
    match canonical::canonicalize_without(value, SIGNATURE_FIELD) {
        Ok(payload) => verify_payload(&payload, signature, keys),
        Err(err) => SignatureVerification::Invalid(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::trust::keys::{generate_signing_key, TrustedKeys};

    fn kid(s: &str) -> KeyId {
        KeyId::new(s).unwrap()
    }

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::with_workflow_id("wf-sign")
            .created_at(Utc.with_ymd_and_hms(2026, 1, 16, 10, 0, 0).unwrap())
            .goal("summarise a document");
        manifest
            .file_manifest
            .insert("steps.jsonl".to_string(), "a".repeat(64));
        manifest
    }

    #[test]
    fn test_sign_and_verify() {
        let key = generate_signing_key();
        let trusted = TrustedKeys::single(kid("default"), key.verifying_key());
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();

        assert!(manifest
            .signature
            .as_deref()
            .unwrap()
            .starts_with("ed25519:default:"));
        assert_eq!(
            verify_signature(&manifest, &trusted),
            SignatureVerification::Valid {
                key_id: kid("default")
            }
        );
    }

    #[test]
    fn test_resign_is_stable() {
        let key = generate_signing_key();
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();
        let first = manifest.signature.clone();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();
        assert_eq!(manifest.signature, first);
    }

    #[test]
    fn test_unsigned_manifest() {
        let trusted = TrustedKeys::new();
        let manifest = sample_manifest();
        assert_eq!(
            verify_signature(&manifest, &trusted),
            SignatureVerification::Unsigned
        );
    }

    #[test]
    fn test_tampered_field_fails() {
        let key = generate_signing_key();
        let trusted = TrustedKeys::single(kid("default"), key.verifying_key());
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();

        manifest.goal = Some("something else".to_string());
        assert!(matches!(
            verify_signature(&manifest, &trusted),
            SignatureVerification::Invalid(SignatureError::VerificationFailed { .. })
        ));
    }

    #[test]
    fn test_tampered_digest_fails() {
        let key = generate_signing_key();
        let trusted = TrustedKeys::single(kid("default"), key.verifying_key());
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();

        manifest
            .file_manifest
            .insert("steps.jsonl".to_string(), "b".repeat(64));
        assert!(!verify_signature(&manifest, &trusted).is_valid());
    }

    #[test]
    fn test_wrong_key_under_same_id_fails() {
        let signer = generate_signing_key();
        let other = generate_signing_key();
        let trusted = TrustedKeys::single(kid("default"), other.verifying_key());
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &signer, &kid("default")).unwrap();

        assert!(matches!(
            verify_signature(&manifest, &trusted),
            SignatureVerification::Invalid(SignatureError::VerificationFailed { .. })
        ));
    }

    #[test]
    fn test_unknown_key_id() {
        let key = generate_signing_key();
        let trusted = TrustedKeys::single(kid("other"), key.verifying_key());
        let mut manifest = sample_manifest();
        sign_manifest(&mut manifest, &key, &kid("default")).unwrap();

        let outcome = verify_signature(&manifest, &trusted);
        assert!(matches!(
            outcome,
            SignatureVerification::Invalid(SignatureError::UnknownKey { .. })
        ));
        assert!(outcome.reason().contains("default"));
    }

    #[test]
    fn test_parse_signature_errors() {
        assert_eq!(
            parse_signature("ed25519:abc"),
            Err(SignatureError::Malformed { fields: 2 })
        );
        assert_eq!(
            parse_signature("ed25519:k:a:b"),
            Err(SignatureError::Malformed { fields: 4 })
        );
        assert!(matches!(
            parse_signature("rsa:k:AAAA"),
            Err(SignatureError::UnknownAlgorithm { .. })
        ));
        assert!(matches!(
            parse_signature("ed25519:bad key:AAAA"),
            Err(SignatureError::InvalidKeyId { .. })
        ));
        assert!(matches!(
            parse_signature("ed25519:k:!!!"),
            Err(SignatureError::InvalidEncoding { .. })
        ));
        assert_eq!(
            parse_signature(&format!("ed25519:k:{}", STANDARD.encode([0u8; 10]))),
            Err(SignatureError::InvalidLength {
                expected: 64,
                actual: 10
            })
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let key = generate_signing_key();
        let sig = sign_bytes(b"payload", &key, &kid("k1"));
        let parsed = parse_signature(&sig).unwrap();
        assert_eq!(parsed.algorithm, SignatureAlgorithm::Ed25519);
        assert_eq!(parsed.key_id, kid("k1"));
        assert!(key
            .verifying_key()
            .verify_strict(b"payload", &parsed.signature)
            .is_ok());
    }

    #[test]
    fn test_sign_value_ignores_key_order() {
        let key = generate_signing_key();
        let trusted = TrustedKeys::single(kid("w"), key.verifying_key());

        let mut value = json!({ "batch_id": "b1", "count": 2, "items": [1, 2] });
        let sig = sign_value(&value, &key, &kid("w")).unwrap();
        value["signature"] = Value::String(sig);

        let reordered: Value = serde_json::from_str(&format!(
            r#"{{"signature":{},"items":[1,2],"count":2,"batch_id":"b1"}}"#,
            serde_json::to_string(&value["signature"]).unwrap()
        ))
        .unwrap();
        assert!(verify_value(&reordered, &trusted).is_valid());

        value["count"] = json!(3);
        assert!(!verify_value(&value, &trusted).is_valid());
    }
}
