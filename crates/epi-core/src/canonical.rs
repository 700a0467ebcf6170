//! Canonical encoding used as the exact input to signing.
//!
//! Encoding id: [`CANONICALIZER_ID`] (`epi-jcs-v1`). The rules are frozen;
//! any change requires a new id so that signatures made under the old rules
//! stay verifiable.
//!
//! # Rules
//!
//! 1. Object keys are sorted in byte order of their NFC form
//! 2. No whitespace between tokens
//! 3. Strings are NFC normalized and use minimal escaping (RFC 8785 3.2.2.2)
//! 4. Integers are emitted in decimal; floats with no fractional part that
//!    fit in the IEEE-754 safe-integer range are emitted as integers; other
//!    finite floats use the shortest round-trip representation
//! 5. Structures nested deeper than [`MAX_DEPTH`] are rejected
//!
//! For manifests the `signature` member is removed before encoding, and
//! absent optional fields are omitted (never emitted as `null`).
//!
//! # Example
//!
//! ```
//! use epi_core::canonical::canonicalize_value;
//! use serde_json::json;
//!
//! let bytes = canonicalize_value(&json!({ "z": 1, "a": [true, null] })).unwrap();
//! assert_eq!(bytes, br#"{"a":[true,null],"z":1}"#);
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::manifest::Manifest;

/// Canonical encoding identifier.
pub const CANONICALIZER_ID: &str = "epi-jcs-v1";

/// Maximum nesting depth accepted by the encoder.
pub const MAX_DEPTH: usize = 128;

/// Name of the member excluded from manifest and batch canonicalization.
pub const SIGNATURE_FIELD: &str = "signature";

/// Largest integer exactly representable in an IEEE-754 double (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Errors that can occur during canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value is nested deeper than [`MAX_DEPTH`].
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The depth limit.
        max_depth: usize,
    },

    /// Two keys of one object collapse to the same NFC form.
    #[error("duplicate key after NFC normalization: '{key}'")]
    DuplicateKey {
        /// The normalized key.
        key: String,
    },

    /// The value could not be converted to JSON.
    #[error("serialization failed: {message}")]
    Serialize {
        /// Serializer message.
        message: String,
    },
}

/// Canonicalizes a manifest, excluding its signature.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the manifest cannot be serialized or is
/// nested too deeply.
pub fn canonicalize(manifest: &Manifest) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(manifest).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    canonicalize_without(&value, SIGNATURE_FIELD)
}

/// Canonicalizes a JSON value after removing the top-level member `excluded`.
///
/// Non-object values are encoded unchanged.
///
/// # Errors
///
/// Returns [`CanonicalError`] on excessive depth or duplicate normalized keys.
pub fn canonicalize_without(value: &Value, excluded: &str) -> Result<Vec<u8>, CanonicalError> {
    match value {
        Value::Object(obj) if obj.contains_key(excluded) => {
            let mut trimmed = obj.clone();
            trimmed.remove(excluded);
            canonicalize_value(&Value::Object(trimmed))
        },
        other => canonicalize_value(other),
    }
}

/// Canonicalizes an arbitrary JSON value.
///
/// # Errors
///
/// Returns [`CanonicalError`] on excessive depth or duplicate normalized keys.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut output = String::new();
    emit_value(value, 0, &mut output)?;
    Ok(output.into_bytes())
}

/// Checks that `value` canonicalizes when embedded `depth` levels below the
/// root of an enclosing document.
///
/// # Errors
///
/// Returns the error canonicalizing the enclosing document would report for
/// this value.
pub fn check_nested(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    emit_value(value, depth, &mut String::new())
}

fn emit_value(value: &Value, depth: usize, output: &mut String) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => {
            output.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, depth + 1, output)?;
            }
            output.push(']');
        },
        Value::Object(obj) => emit_object(obj, depth, output)?,
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn emit_number(n: &Number, output: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
            // -0.0 and 3.0 encode as 0 and 3
            let _ = write!(output, "{}", f as i64);
        } else {
            // serde_json formats finite floats with the shortest round-trip form
            let _ = write!(output, "{n}");
        }
    }
}

/// Emits an NFC-normalized string with minimal escaping.
///
/// Only `"`, `\` and U+0000..=U+001F are escaped; the latter use the short
/// escapes where defined and `\u00xx` otherwise.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.nfc() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_object(
    obj: &Map<String, Value>,
    depth: usize,
    output: &mut String,
) -> Result<(), CanonicalError> {
    let mut sorted: BTreeMap<String, &Value> = BTreeMap::new();
    for (key, value) in obj {
        let normalized: String = key.nfc().collect();
        if sorted.insert(normalized.clone(), value).is_some() {
            return Err(CanonicalError::DuplicateKey { key: normalized });
        }
    }

    output.push('{');
    for (i, (key, value)) in sorted.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(value, depth + 1, output)?;
    }
    output.push('}');
    Ok(())
}
