//! Secret redaction for recorded content.
//!
//! Every step, textual artifact and captured event passes through a
//! [`Redactor`] before it is hashed, signed or persisted. Secret-shaped
//! substrings are replaced by [`PLACEHOLDER`]; values stored under sensitive
//! key names (`api_key`, `password`, ...) are replaced wholesale.
//!
//! Redaction is idempotent: a match that already contains the placeholder is
//! left alone and not counted, so running the redactor twice reports zero
//! redactions the second time.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// The replacement text for redacted secrets.
pub const PLACEHOLDER: &str = "[REDACTED]";

/// Largest string the redactor will scan (8 MiB).
pub const MAX_REDACT_INPUT_BYTES: usize = 8 * 1024 * 1024;

/// Patterns that match secrets embedded in text, applied in order.
static SECRET_PATTERNS: LazyLock<Vec<SecretPattern>> = LazyLock::new(|| {
    vec![
        // Provider API keys
        SecretPattern::new("anthropic_api_key", r"sk-ant-[a-zA-Z0-9\-_]{20,}"),
        SecretPattern::new("openai_api_key", r"sk-(?:proj-)?[a-zA-Z0-9]{20,}"),
        SecretPattern::new("google_api_key", r"AIza[a-zA-Z0-9\-_]{35}"),
        // AWS credentials
        SecretPattern::new("aws_access_key", r"AKIA[A-Z0-9]{16}"),
        SecretPattern::new(
            "aws_secret_key",
            r#"(?i)aws[_-]?secret[_-]?access[_-]?key['"]?\s*[:=]\s*['"]?([A-Za-z0-9/+=]{40})"#,
        ),
        // key=value secrets
        SecretPattern::new(
            "generic_api_key",
            r#"(?i)(api[_-]?key|apikey)['"]?\s*[:=]\s*['"]?([a-zA-Z0-9_-]{20,})['"]?"#,
        ),
        SecretPattern::new(
            "generic_token",
            r#"(?i)(access[_-]?token|auth[_-]?token|bearer)['"]?\s*[:=]\s*['"]?([a-zA-Z0-9_.=-]{20,})['"]?"#,
        ),
        SecretPattern::new(
            "generic_secret",
            r#"(?i)(secret|password|passwd|pwd)['"]?\s*[:=]\s*['"]?([^\s'"]{8,})['"]?"#,
        ),
        // Authorization headers
        SecretPattern::new("bearer_token", r"(?i)bearer\s+([a-zA-Z0-9_.=-]{8,})"),
        SecretPattern::new(
            "base64_secret",
            r#"(?i)(key|secret|token|credential)['"]?\s*[:=]\s*['"]?([A-Za-z0-9+/]{40,}={0,2})['"]?"#,
        ),
        SecretPattern::new(
            "private_key",
            r"-----BEGIN\s+(?:RSA\s+|EC\s+|OPENSSH\s+)?PRIVATE\s+KEY-----",
        ),
        SecretPattern::new("github_token", r"gh[pousr]_[A-Za-z0-9_]{36,}"),
        SecretPattern::new(
            "slack_token",
            r"xox[baprs]-[0-9]{10,}-[0-9]{10,}-[a-zA-Z0-9]{24,}",
        ),
    ]
});

/// Object keys whose values are withheld regardless of their shape.
static SENSITIVE_KEY_NAMES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(x[_-])?api[_-]?key$",
        r"(?i)^(client[_-]?)?secret$",
        r"(?i)^(access|auth|refresh|id|bearer|session)?[_-]?token$",
        r"(?i)^(password|passwd|pwd)$",
        r"(?i)^authorization$",
        r"(?i)^private[_-]?key$",
        r"(?i)^credentials?$",
        r"(?i)^cookie$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid sensitive key pattern"))
    .collect()
});

/// Environment variable names whose values are never recorded.
static SENSITIVE_ENV_NAMES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i).*api[_\-]?key.*",
        r"(?i).*secret.*",
        r"(?i).*token.*",
        r"(?i).*password.*",
        r"(?i).*credential.*",
        r"(?i)^ANTHROPIC_.*",
        r"(?i)^OPENAI_.*",
        r"(?i)^AWS_.*",
        r"(?i)^GOOGLE_.*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid sensitive env pattern"))
    .collect()
});

/// Errors from the redactor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RedactionError {
    /// A custom pattern failed to compile.
    #[error("invalid redaction pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The pattern source.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// A single value exceeds [`MAX_REDACT_INPUT_BYTES`].
    #[error("value of {len} bytes exceeds redaction limit of {max} bytes")]
    ValueTooLarge {
        /// Size of the value.
        len: usize,
        /// The limit.
        max: usize,
    },
}

struct SecretPattern {
    name: &'static str,
    regex: Regex,
}

impl SecretPattern {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("invalid secret pattern"),
        }
    }
}

/// Secret redactor for strings, structured values and artifact bytes.
///
/// # Example
///
/// ```
/// use epi_core::redact::Redactor;
/// use serde_json::json;
///
/// let redactor = Redactor::new();
/// let (clean, count) = redactor.redact_value(&json!({
///     "prompt": "key is sk-ant-REDACTED",
///     "api_key": "hunter2",
/// }));
/// assert_eq!(count, 2);
/// assert_eq!(clean["api_key"], "[REDACTED]");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    custom_patterns: Vec<Regex>,
}

impl Redactor {
    /// Creates a redactor with the built-in patterns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom pattern, applied after the built-in ones.
    ///
    /// # Errors
    ///
    /// Returns [`RedactionError::InvalidPattern`] if the pattern does not
    /// compile.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, RedactionError> {
        let regex = Regex::new(pattern).map_err(|e| RedactionError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.custom_patterns.push(regex);
        Ok(self)
    }

    /// Redacts a string, failing if it is too large to scan.
    ///
    /// # Errors
    ///
    /// Returns [`RedactionError::ValueTooLarge`] for input over
    /// [`MAX_REDACT_INPUT_BYTES`].
    pub fn try_redact_str<'a>(
        &self,
        input: &'a str,
    ) -> Result<(Cow<'a, str>, usize), RedactionError> {
        if input.len() > MAX_REDACT_INPUT_BYTES {
            return Err(RedactionError::ValueTooLarge {
                len: input.len(),
                max: MAX_REDACT_INPUT_BYTES,
            });
        }

        let mut result = Cow::Borrowed(input);
        let mut count = 0;
        let patterns = SECRET_PATTERNS
            .iter()
            .map(|p| (p.name, &p.regex))
            .chain(self.custom_patterns.iter().map(|r| ("custom", r)));
        for (name, regex) in patterns {
            if !regex.is_match(&result) {
                continue;
            }
            let mut hits = 0;
            let replaced = regex.replace_all(&result, |caps: &Captures<'_>| {
                let matched = &caps[0];
                if matched.contains(PLACEHOLDER) {
                    matched.to_string()
                } else {
                    hits += 1;
                    PLACEHOLDER.to_string()
                }
            });
            if let Cow::Owned(replaced) = replaced {
                result = Cow::Owned(replaced);
            }
            if hits > 0 {
                debug!(pattern = name, hits, "redacted secret");
            }
            count += hits;
        }
        Ok((result, count))
    }

    /// Redacts a string.
    ///
    /// A value that cannot be scanned is withheld entirely: the result is
    /// the placeholder and the count is zero.
    #[must_use]
    pub fn redact_str(&self, input: &str) -> (String, usize) {
        match self.try_redact_str(input) {
            Ok((clean, count)) => (clean.into_owned(), count),
            Err(err) => {
                warn!(error = %err, "redaction failed, withholding value");
                (PLACEHOLDER.to_string(), 0)
            },
        }
    }

    /// Redacts every string in a structured value.
    ///
    /// Object keys are redacted like any other string; a redacted key that
    /// collides with one already emitted gets a `#2`, `#3`, ... suffix. Values
    /// under sensitive key names are replaced by the placeholder and counted
    /// once.
    #[must_use]
    pub fn redact_value(&self, value: &Value) -> (Value, usize) {
        match value {
            Value::String(s) => {
                let (clean, count) = self.redact_str(s);
                (Value::String(clean), count)
            },
            Value::Array(items) => {
                let mut total = 0;
                let items = items
                    .iter()
                    .map(|item| {
                        let (clean, count) = self.redact_value(item);
                        total += count;
                        clean
                    })
                    .collect();
                (Value::Array(items), total)
            },
            Value::Object(map) => {
                let mut total = 0;
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let clean = if is_sensitive_key(key) {
                        withhold(item, &mut total)
                    } else {
                        let (clean, count) = self.redact_value(item);
                        total += count;
                        clean
                    };
                    let (clean_key, count) = self.redact_str(key);
                    total += count;
                    let clean_key = if clean_key == *key {
                        clean_key
                    } else {
                        unique_key(&out, map, clean_key)
                    };
                    out.insert(clean_key, clean);
                }
                (Value::Object(out), total)
            },
            Value::Null | Value::Bool(_) | Value::Number(_) => (value.clone(), 0),
        }
    }

    /// Redacts artifact content.
    ///
    /// UTF-8 content is redacted as text; anything else is returned
    /// unchanged.
    #[must_use]
    pub fn redact_bytes<'a>(&self, input: &'a [u8]) -> (Cow<'a, [u8]>, usize) {
        let Ok(text) = std::str::from_utf8(input) else {
            return (Cow::Borrowed(input), 0);
        };
        match self.try_redact_str(text) {
            Ok((Cow::Borrowed(_), count)) => (Cow::Borrowed(input), count),
            Ok((Cow::Owned(clean), count)) => (Cow::Owned(clean.into_bytes()), count),
            Err(err) => {
                warn!(error = %err, "redaction failed, withholding artifact content");
                (Cow::Owned(PLACEHOLDER.as_bytes().to_vec()), 0)
            },
        }
    }
}

/// Suffixes a rewritten key until it clashes with neither an emitted key nor
/// a key still to come from the source object.
fn unique_key(out: &Map<String, Value>, source: &Map<String, Value>, key: String) -> String {
    let taken = |candidate: &str| out.contains_key(candidate) || source.contains_key(candidate);
    if !taken(&key) {
        return key;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{key}#{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Replaces a value stored under a sensitive key.
fn withhold(value: &Value, total: &mut usize) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) if s == PLACEHOLDER => value.clone(),
        _ => {
            *total += 1;
            Value::String(PLACEHOLDER.to_string())
        },
    }
}

/// Returns `true` if values under this object key are always withheld.
#[must_use]
pub fn is_sensitive_key(name: &str) -> bool {
    SENSITIVE_KEY_NAMES.iter().any(|p| p.is_match(name))
}

/// Returns `true` if an environment variable's value must be withheld.
#[must_use]
pub fn is_sensitive_env_name(name: &str) -> bool {
    SENSITIVE_ENV_NAMES.iter().any(|p| p.is_match(name))
}

/// Redacts a string with the default redactor.
#[must_use]
pub fn redact(input: &str) -> (String, usize) {
    Redactor::new().redact_str(input)
}
