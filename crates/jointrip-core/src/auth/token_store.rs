use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ConfigLocator;

use super::{AuthError, TokenPair};

/// Durable storage for the current token pair.
///
/// Implementations must make `write` atomic: a concurrent `read` sees either the
/// previous pair or the new one, never a mix of both.
pub trait TokenStore: Send + Sync {
    fn write(&self, pair: &TokenPair) -> Result<(), AuthError>;
    fn read(&self) -> Result<Option<TokenPair>, AuthError>;
    fn clear(&self) -> Result<(), AuthError>;
}

/// In-process token storage.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: TokenPair) -> Self {
        Self {
            inner: Mutex::new(Some(pair)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn write(&self, pair: &TokenPair) -> Result<(), AuthError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn read(&self) -> Result<Option<TokenPair>, AuthError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn clear(&self) -> Result<(), AuthError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Filesystem-backed token storage located in the user configuration directory.
pub struct FileTokenStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(locator: &ConfigLocator, profile: &str) -> Self {
        Self::at_path(locator.tokens_file(profile))
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `payload` to a sibling file and rename it over `path`.
///
/// Readers never observe a partial document, and the content is user-only from the
/// moment the staging file exists.
pub(crate) fn write_private(path: &Path, payload: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    let mut file = open_staging(&staging)?;
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn open_staging(staging: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(staging)?;

    // A staging file left over from a crash keeps its old mode; tighten it before writing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staging, fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

impl TokenStore for FileTokenStore {
    fn write(&self, pair: &TokenPair) -> Result<(), AuthError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let document = TokenDocument {
            version: 1,
            access_token: Some(pair.access_token.clone()),
            refresh_token: Some(pair.refresh_token.clone()),
        };
        let payload = serde_json::to_string_pretty(&document)?;
        write_private(&self.path, &payload)
    }

    fn read(&self) -> Result<Option<TokenPair>, AuthError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let document: TokenDocument = serde_json::from_str(&raw)?;
        match (document.access_token, document.refresh_token) {
            (Some(access_token), Some(refresh_token)) => Ok(Some(TokenPair {
                access_token,
                refresh_token,
            })),
            (None, None) => Ok(None),
            _ => {
                warn!(path = %self.path.display(), "token file holds an incomplete pair; ignoring");
                Ok(None)
            }
        }
    }

    fn clear(&self) -> Result<(), AuthError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenDocument {
    #[serde(default)]
    version: u32,
    #[serde(rename = "accessToken", default)]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
}
