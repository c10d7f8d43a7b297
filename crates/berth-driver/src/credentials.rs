//! Credential lookup.
//!
//! Drivers fetch backend secrets by `(scope, key)` from a machine-to-machine
//! credential store. The store itself lives outside the engine; this module
//! only defines the lookup capability and two small implementations.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CredentialError {
    #[error("credential {scope}/{key} not found")]
    Missing { scope: String, key: String },

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// A secret value. Redacted in `Debug` and `Display`, zeroed on drop.
#[derive(Clone, Zeroize, PartialEq, Eq)]
#[zeroize(drop)]
pub struct Secret {
    inner: String,
}

impl Secret {
    pub fn new(inner: impl Into<String>) -> Self {
        Self {
            inner: inner.into(),
        }
    }

    /// Explicit access to the secret value.
    pub fn expose(&self) -> &str {
        &self.inner
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&REDACTED).finish()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Lookup-by-key capability of the credential vault.
pub trait CredentialStore: Send + Sync {
    fn get_secret(&self, scope: &str, key: &str) -> Result<Secret, CredentialError>;
}

type ScopedSecrets = HashMap<String, HashMap<String, String>>;

/// Reads `{ "scope": { "key": "value" } }` from a JSON file on every
/// lookup, so rotated credentials are picked up without a restart.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<ScopedSecrets, CredentialError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            CredentialError::Unavailable(format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CredentialError::Unavailable(format!("{}: {e}", self.path.display()))
        })
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_secret(&self, scope: &str, key: &str) -> Result<Secret, CredentialError> {
        let mut secrets = self.load()?;
        let value = secrets
            .get_mut(scope)
            .and_then(|entries| entries.remove(key))
            .ok_or_else(|| CredentialError::Missing {
                scope: scope.to_string(),
                key: key.to_string(),
            })?;
        debug!(scope, key, "credential loaded");
        Ok(Secret::new(value))
    }
}

/// Fixed in-memory credentials.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    secrets: ScopedSecrets,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: &str, key: &str, value: &str) -> Self {
        self.secrets
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn get_secret(&self, scope: &str, key: &str) -> Result<Secret, CredentialError> {
        self.secrets
            .get(scope)
            .and_then(|entries| entries.get(key))
            .map(Secret::new)
            .ok_or_else(|| CredentialError::Missing {
                scope: scope.to_string(),
                key: key.to_string(),
            })
    }
}
