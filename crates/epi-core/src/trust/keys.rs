//! Key identifiers, signing-key storage and the verifier's public-key
//! registry.
//!
//! ```text
//! KeyStore (trait)
//!     |-- store(key_id, signing_key)
//!     |-- load(key_id) -> SigningKey
//!     |-- exists(key_id) -> bool
//!     `-- load_or_generate(key_id) -> SigningKey
//!
//! FileKeyStore   `<dir>/<key_id>.key` (hex seed, 0600) + `<key_id>.pub`
//! MemoryKeyStore in-process, for tests
//!
//! TrustedKeys (PublicKeyLookup)
//!     `-- key_id -> VerifyingKey, consulted by signature verification
//! ```
//!
//! Private keys never enter a container; only the key id does.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Maximum key id length.
pub const MAX_KEY_ID_LEN: usize = 64;

/// File extension of stored private keys.
const PRIVATE_KEY_EXT: &str = "key";

/// File extension of stored public keys.
const PUBLIC_KEY_EXT: &str = "pub";

/// Errors from key id validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyIdError {
    /// The key id is empty.
    #[error("key id is empty")]
    Empty,

    /// The key id exceeds [`MAX_KEY_ID_LEN`].
    #[error("key id is {len} characters, maximum is {max}")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Maximum length.
        max: usize,
    },

    /// The key id contains a character outside `[A-Za-z0-9._-]`.
    #[error("key id contains invalid character {ch:?}")]
    InvalidCharacter {
        /// The offending character.
        ch: char,
    },

    /// The key id starts with a dot.
    #[error("key id must not start with '.'")]
    LeadingDot,
}

/// Identifier binding a signature to the public key a verifier should use.
///
/// Restricted to `[A-Za-z0-9._-]{1,64}` without a leading dot, so it is safe
/// both as a file stem and as a field of the colon-separated signature
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    /// Validates and wraps a key id.
    ///
    /// # Errors
    ///
    /// Returns [`KeyIdError`] if the value is empty, too long, starts with a
    /// dot or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(value: impl Into<String>) -> Result<Self, KeyIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(KeyIdError::Empty);
        }
        if value.len() > MAX_KEY_ID_LEN {
            return Err(KeyIdError::TooLong {
                len: value.len(),
                max: MAX_KEY_ID_LEN,
            });
        }
        if value.starts_with('.') {
            return Err(KeyIdError::LeadingDot);
        }
        if let Some(ch) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(KeyIdError::InvalidCharacter { ch });
        }
        Ok(Self(value))
    }

    /// Returns the key id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyId {
    type Err = KeyIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Generates a fresh Ed25519 signing key from the OS RNG.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Errors that can occur during key storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyStoreError {
    /// No key stored under this id.
    #[error("key not found: {key_id}")]
    NotFound {
        /// The missing key id.
        key_id: String,
    },

    /// A key is already stored under this id.
    #[error("key already exists: {key_id}")]
    AlreadyExists {
        /// The existing key id.
        key_id: String,
    },

    /// Stored key material is malformed.
    #[error("invalid key data for {key_id}: {reason}")]
    InvalidData {
        /// The key id.
        key_id: String,
        /// What was wrong.
        reason: String,
    },

    /// The stored public key does not belong to the stored private key.
    #[error("public key on disk does not match private key for {key_id}")]
    PublicKeyMismatch {
        /// The key id.
        key_id: String,
    },

    /// Filesystem failure.
    #[error("key store I/O error at {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Key id validation failed.
    #[error("key id error: {0}")]
    KeyId(#[from] KeyIdError),

    /// Lock poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Storage backend for signing keys.
pub trait KeyStore: Send + Sync {
    /// Stores a signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::AlreadyExists`] if the id is taken, or a
    /// backend error.
    fn store(&self, key_id: &KeyId, key: &SigningKey) -> Result<(), KeyStoreError>;

    /// Loads a signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NotFound`] if absent, or
    /// [`KeyStoreError::InvalidData`] if the stored material is corrupt.
    fn load(&self, key_id: &KeyId) -> Result<SigningKey, KeyStoreError>;

    /// Checks whether a key is stored under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    fn exists(&self, key_id: &KeyId) -> Result<bool, KeyStoreError>;

    /// Loads the key, generating and storing one on first use.
    ///
    /// # Errors
    ///
    /// Returns a backend error.
    fn load_or_generate(&self, key_id: &KeyId) -> Result<SigningKey, KeyStoreError> {
        if self.exists(key_id)? {
            return self.load(key_id);
        }
        let key = generate_signing_key();
        self.store(key_id, &key)?;
        info!(key_id = %key_id, "generated new signing key");
        Ok(key)
    }
}

/// Directory-backed key store.
///
/// Each key is two files: `<key_id>.key` holding the hex-encoded 32-byte
/// seed (mode 0600 on Unix) and `<key_id>.pub` holding the hex-encoded public
/// key, which can be handed to verifiers.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Opens (creating if needed) a key directory.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| KeyStoreError::Io {
            path: dir.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(|source| {
                KeyStoreError::Io {
                    path: dir.clone(),
                    source,
                }
            })?;
        }
        Ok(Self { dir })
    }

    /// Returns the key directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the private key file for `key_id`.
    #[must_use]
    pub fn private_key_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.{PRIVATE_KEY_EXT}", key_id.as_str()))
    }

    /// Path of the public key file for `key_id`.
    #[must_use]
    pub fn public_key_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.{PUBLIC_KEY_EXT}", key_id.as_str()))
    }

    fn write_new(&self, path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyStoreError> {
        let io_err = |source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))
                .map_err(io_err)?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        tmp.as_file_mut().write_all(contents).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist_noclobber(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn store(&self, key_id: &KeyId, key: &SigningKey) -> Result<(), KeyStoreError> {
        if self.exists(key_id)? {
            return Err(KeyStoreError::AlreadyExists {
                key_id: key_id.to_string(),
            });
        }
        let seed_hex = Zeroizing::new(hex::encode(key.to_bytes()));
        self.write_new(&self.private_key_path(key_id), seed_hex.as_bytes(), 0o600)?;

        let pub_path = self.public_key_path(key_id);
        if pub_path.exists() {
            fs::remove_file(&pub_path).map_err(|source| KeyStoreError::Io {
                path: pub_path.clone(),
                source,
            })?;
        }
        let pub_hex = hex::encode(key.verifying_key().to_bytes());
        self.write_new(&pub_path, pub_hex.as_bytes(), 0o644)?;
        debug!(key_id = %key_id, dir = %self.dir.display(), "stored signing key");
        Ok(())
    }

    fn load(&self, key_id: &KeyId) -> Result<SigningKey, KeyStoreError> {
        let path = self.private_key_path(key_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => Zeroizing::new(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound {
                    key_id: key_id.to_string(),
                });
            },
            Err(source) => return Err(KeyStoreError::Io { path, source }),
        };
        let key = signing_key_from_hex(key_id, raw.trim())?;

        let pub_path = self.public_key_path(key_id);
        if let Ok(pub_hex) = fs::read_to_string(&pub_path) {
            let stored = verifying_key_from_hex(key_id, pub_hex.trim())?;
            if stored != key.verifying_key() {
                return Err(KeyStoreError::PublicKeyMismatch {
                    key_id: key_id.to_string(),
                });
            }
        }
        Ok(key)
    }

    fn exists(&self, key_id: &KeyId) -> Result<bool, KeyStoreError> {
        Ok(self.private_key_path(key_id).is_file())
    }
}

/// In-memory key store for tests.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    seeds: RwLock<HashMap<KeyId, Zeroizing<[u8; SECRET_KEY_LENGTH]>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn store(&self, key_id: &KeyId, key: &SigningKey) -> Result<(), KeyStoreError> {
        let mut seeds = self.seeds.write().map_err(|_| KeyStoreError::LockPoisoned)?;
        if seeds.contains_key(key_id) {
            return Err(KeyStoreError::AlreadyExists {
                key_id: key_id.to_string(),
            });
        }
        seeds.insert(key_id.clone(), Zeroizing::new(key.to_bytes()));
        Ok(())
    }

    fn load(&self, key_id: &KeyId) -> Result<SigningKey, KeyStoreError> {
        let seeds = self.seeds.read().map_err(|_| KeyStoreError::LockPoisoned)?;
        seeds
            .get(key_id)
            .map(|seed| SigningKey::from_bytes(seed))
            .ok_or_else(|| KeyStoreError::NotFound {
                key_id: key_id.to_string(),
            })
    }

    fn exists(&self, key_id: &KeyId) -> Result<bool, KeyStoreError> {
        let seeds = self.seeds.read().map_err(|_| KeyStoreError::LockPoisoned)?;
        Ok(seeds.contains_key(key_id))
    }
}

fn signing_key_from_hex(key_id: &KeyId, value: &str) -> Result<SigningKey, KeyStoreError> {
    let bytes = Zeroizing::new(hex::decode(value).map_err(|e| KeyStoreError::InvalidData {
        key_id: key_id.to_string(),
        reason: e.to_string(),
    })?);
    let seed: [u8; SECRET_KEY_LENGTH] =
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyStoreError::InvalidData {
                key_id: key_id.to_string(),
                reason: format!("expected {SECRET_KEY_LENGTH} bytes, got {}", bytes.len()),
            })?;
    let seed = Zeroizing::new(seed);
    Ok(SigningKey::from_bytes(&seed))
}

fn verifying_key_from_hex(key_id: &KeyId, value: &str) -> Result<VerifyingKey, KeyStoreError> {
    let invalid = |reason: String| KeyStoreError::InvalidData {
        key_id: key_id.to_string(),
        reason,
    };
    let bytes = hex::decode(value).map_err(|e| invalid(e.to_string()))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        invalid(format!(
            "expected {PUBLIC_KEY_LENGTH} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))
}

/// Lookup of verifying keys by key id, consulted during signature
/// verification.
pub trait PublicKeyLookup {
    /// Returns the verifying key registered under `key_id`.
    fn public_key(&self, key_id: &KeyId) -> Option<VerifyingKey>;
}

/// Registry of public keys a verifier trusts.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<KeyId, VerifyingKey>,
}

impl TrustedKeys {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding one key.
    #[must_use]
    pub fn single(key_id: KeyId, key: VerifyingKey) -> Self {
        let mut keys = Self::new();
        keys.insert(key_id, key);
        keys
    }

    /// Registers a key, replacing any previous key under the same id.
    pub fn insert(&mut self, key_id: KeyId, key: VerifyingKey) {
        self.keys.insert(key_id, key);
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no keys are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Loads every `<key_id>.pub` file in `dir`.
    ///
    /// Files whose stem is not a valid key id are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Io`] if the directory cannot be read, or
    /// [`KeyStoreError::InvalidData`] for a malformed public key file.
    pub fn from_dir(dir: &Path) -> Result<Self, KeyStoreError> {
        let io_err = |source| KeyStoreError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut keys = Self::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PUBLIC_KEY_EXT) {
                continue;
            }
            let Some(key_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| KeyId::new(s).ok())
            else {
                continue;
            };
            let hex_key = fs::read_to_string(&path).map_err(|source| KeyStoreError::Io {
                path: path.clone(),
                source,
            })?;
            let key = verifying_key_from_hex(&key_id, hex_key.trim())?;
            keys.insert(key_id, key);
        }
        Ok(keys)
    }
}

impl PublicKeyLookup for TrustedKeys {
    fn public_key(&self, key_id: &KeyId) -> Option<VerifyingKey> {
        self.keys.get(key_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn kid(s: &str) -> KeyId {
        KeyId::new(s).unwrap()
    }

    #[test]
    fn test_key_id_validation() {
        assert!(KeyId::new("default").is_ok());
        assert!(KeyId::new("team.signer_01-a").is_ok());
        assert_eq!(KeyId::new(""), Err(KeyIdError::Empty));
        assert_eq!(
            KeyId::new("a:b"),
            Err(KeyIdError::InvalidCharacter { ch: ':' })
        );
        assert_eq!(KeyId::new("../etc"), Err(KeyIdError::LeadingDot));
        assert_eq!(
            KeyId::new("a/b"),
            Err(KeyIdError::InvalidCharacter { ch: '/' })
        );
        assert!(matches!(
            KeyId::new("x".repeat(MAX_KEY_ID_LEN + 1)),
            Err(KeyIdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryKeyStore::new();
        let key = generate_signing_key();
        store.store(&kid("k1"), &key).unwrap();

        let loaded = store.load(&kid("k1")).unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
        assert!(matches!(
            store.store(&kid("k1"), &key),
            Err(KeyStoreError::AlreadyExists { .. })
        ));
        assert!(matches!(
            store.load(&kid("missing")),
            Err(KeyStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_load_or_generate_reuses_key() {
        let store = MemoryKeyStore::new();
        let first = store.load_or_generate(&kid("default")).unwrap();
        let second = store.load_or_generate(&kid("default")).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn test_file_store_roundtrip_and_public_export() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys")).unwrap();
        let key = store.load_or_generate(&kid("default")).unwrap();

        assert!(store.private_key_path(&kid("default")).is_file());
        let reloaded = store.load(&kid("default")).unwrap();
        assert_eq!(reloaded.to_bytes(), key.to_bytes());

        let trusted = TrustedKeys::from_dir(store.dir()).unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(
            trusted.public_key(&kid("default")),
            Some(key.verifying_key())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        store.load_or_generate(&kid("default")).unwrap();
        let mode = fs::metadata(store.private_key_path(&kid("default")))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_detects_swapped_public_key() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        store.load_or_generate(&kid("default")).unwrap();

        let other = generate_signing_key();
        fs::write(
            store.public_key_path(&kid("default")),
            hex::encode(other.verifying_key().to_bytes()),
        )
        .unwrap();

        assert!(matches!(
            store.load(&kid("default")),
            Err(KeyStoreError::PublicKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_file_store_rejects_corrupt_seed() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        fs::write(store.private_key_path(&kid("bad")), "abcd").unwrap();
        assert!(matches!(
            store.load(&kid("bad")),
            Err(KeyStoreError::InvalidData { .. })
        ));
    }
}
