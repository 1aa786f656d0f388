//! Durable storage for the access and refresh tokens.
//!
//! `CredentialStore` is a dumb key/value surface: it never validates token
//! contents and never fails from the caller's point of view. Backends that
//! touch the disk or the OS keychain log their I/O problems and degrade to
//! "absent" instead of returning errors.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::token_preview;

/// Credentials file name in cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Opaque bearer credential.
///
/// `Debug` only shows a short preview so tokens never end up in logs whole.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-safe preview of the token
    pub fn preview(&self) -> String {
        token_preview(&self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.preview())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which of the two stored credentials an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub const ALL: [TokenKind; 2] = [TokenKind::Access, TokenKind::Refresh];

    /// Fixed key the token is persisted under
    pub fn storage_key(self) -> &'static str {
        match self {
            TokenKind::Access => "access_token",
            TokenKind::Refresh => "refresh_token",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

/// Both credentials as one value. Either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: Option<Token>,
    pub refresh: Option<Token>,
}

impl CredentialPair {
    pub fn new(access: impl Into<Token>, refresh: impl Into<Token>) -> Self {
        Self {
            access: Some(access.into()),
            refresh: Some(refresh.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }

    pub fn get(&self, kind: TokenKind) -> Option<&Token> {
        match kind {
            TokenKind::Access => self.access.as_ref(),
            TokenKind::Refresh => self.refresh.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: TokenKind) -> &mut Option<Token> {
        match kind {
            TokenKind::Access => &mut self.access,
            TokenKind::Refresh => &mut self.refresh,
        }
    }
}

/// Key/value holder for the two session credentials.
///
/// Every operation succeeds. Clearing an absent entry is a no-op.
pub trait CredentialStore: Send + Sync {
    fn get(&self, kind: TokenKind) -> Option<Token>;

    fn set(&self, kind: TokenKind, token: Token);

    fn clear(&self, kind: TokenKind);

    fn has_access(&self) -> bool {
        self.get(TokenKind::Access).is_some()
    }

    fn snapshot(&self) -> CredentialPair {
        CredentialPair {
            access: self.get(TokenKind::Access),
            refresh: self.get(TokenKind::Refresh),
        }
    }

    /// Write whichever halves of `pair` are present, leaving the others alone
    fn store_pair(&self, pair: CredentialPair) {
        if let Some(access) = pair.access {
            self.set(TokenKind::Access, access);
        }
        if let Some(refresh) = pair.refresh {
            self.set(TokenKind::Refresh, refresh);
        }
    }

    fn clear_all(&self) {
        for kind in TokenKind::ALL {
            self.clear(kind);
        }
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-lifetime store. Starts empty.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<CredentialPair>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(pair),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, kind: TokenKind) -> Option<Token> {
        self.pair.lock().get(kind).cloned()
    }

    fn set(&self, kind: TokenKind, token: Token) {
        *self.pair.lock().slot_mut(kind) = Some(token);
    }

    fn clear(&self, kind: TokenKind) {
        *self.pair.lock().slot_mut(kind) = None;
    }
}

// ============================================================================
// File backend
// ============================================================================

/// On-disk layout, keyed by the fixed storage names.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default)]
    access_token: Option<Token>,
    #[serde(default)]
    refresh_token: Option<Token>,
    updated_at: DateTime<Utc>,
}

/// JSON file in the cache directory, mirrored in memory.
///
/// The file is rewritten on every mutation and removed once both entries
/// are gone.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    pair: Mutex<CredentialPair>,
}

impl FileCredentialStore {
    /// Open the store, loading whatever was persisted previously.
    /// An unreadable file is treated as an empty store.
    pub fn open(cache_dir: impl AsRef<Path>) -> Self {
        let path = cache_dir.as_ref().join(CREDENTIALS_FILE);
        let pair = match Self::load(&path) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable credentials file");
                CredentialPair::default()
            }
        };
        debug!(
            path = %path.display(),
            has_access = pair.access.is_some(),
            has_refresh = pair.refresh.is_some(),
            "Credential store opened"
        );
        Self {
            path,
            pair: Mutex::new(pair),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<CredentialPair> {
        if !path.exists() {
            return Ok(CredentialPair::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read credentials file")?;
        let stored: StoredCredentials =
            serde_json::from_str(&contents).context("Failed to parse credentials file")?;
        Ok(CredentialPair {
            access: stored.access_token,
            refresh: stored.refresh_token,
        })
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        if pair.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }
        let stored = StoredCredentials {
            access_token: pair.access.clone(),
            refresh_token: pair.refresh.clone(),
            updated_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;

        // Replace atomically so a crash never leaves a half-written file
        let temp_path = self.path.with_extension("json.tmp");
        write_private(&temp_path, contents.as_bytes())?;
        std::fs::rename(&temp_path, &self.path).context("Failed to replace credentials file")?;
        Ok(())
    }

    fn mutate(&self, kind: TokenKind, value: Option<Token>) {
        let mut pair = self.pair.lock();
        if pair.get(kind) == value.as_ref() {
            return;
        }
        *pair.slot_mut(kind) = value;
        if let Err(e) = self.save(&pair) {
            warn!(path = %self.path.display(), key = %kind, error = %e, "Failed to persist credentials");
        }
    }
}

/// Write `contents` to a file readable only by the owner from the moment it exists
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .context("Failed to create credentials file")?;
    file.write_all(contents).context("Failed to write credentials file")?;
    file.sync_all().context("Failed to sync credentials file")
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).context("Failed to write credentials file")
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, kind: TokenKind) -> Option<Token> {
        self.pair.lock().get(kind).cloned()
    }

    fn set(&self, kind: TokenKind, token: Token) {
        self.mutate(kind, Some(token));
    }

    fn clear(&self, kind: TokenKind) {
        self.mutate(kind, None);
    }
}

// ============================================================================
// OS keychain backend
// ============================================================================

/// One keychain entry per token kind, under a shared service name.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, kind: TokenKind) -> Result<Entry> {
        Entry::new(&self.service, kind.storage_key()).context("Failed to create keyring entry")
    }

    fn read(&self, kind: TokenKind) -> Result<Option<Token>> {
        match self.entry(kind)?.get_password() {
            Ok(secret) => Ok(Some(Token::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn write(&self, kind: TokenKind, token: &Token) -> Result<()> {
        self.entry(kind)?
            .set_password(token.as_str())
            .context("Failed to store token in keychain")
    }

    fn delete(&self, kind: TokenKind) -> Result<()> {
        match self.entry(kind)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, kind: TokenKind) -> Option<Token> {
        self.read(kind).unwrap_or_else(|e| {
            warn!(service = %self.service, key = %kind, error = %e, "Keychain read failed");
            None
        })
    }

    fn set(&self, kind: TokenKind, token: Token) {
        if let Err(e) = self.write(kind, &token) {
            warn!(service = %self.service, key = %kind, error = %e, "Keychain write failed");
        }
    }

    fn clear(&self, kind: TokenKind) {
        if let Err(e) = self.delete(kind) {
            warn!(service = %self.service, key = %kind, error = %e, "Keychain delete failed");
        }
    }
}
