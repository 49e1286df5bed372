//! Bearer token storage for the CLI
//!
//! The token lives in `$HOME/.config/appctl/config.json` as
//! `{"token": "..."}`. On unix the directory is 0700 and the file 0600.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredConfig {
    #[serde(default)]
    token: String,
}

/// Token derived from login credentials
pub fn derive_token(username: &str, password: &str) -> String {
    format!("{:x}", Sha256::digest(format!("{username}:{password}")))
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the user's home directory
    pub fn default_location() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .ok_or(Error::NoHomeDirectory)?;
        Ok(Self::new(
            PathBuf::from(home)
                .join(".config")
                .join("appctl")
                .join("config.json"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, token: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)?;
        }

        let body = serde_json::to_vec_pretty(&StoredConfig {
            token: token.to_string(),
        })?;
        let mut file = open_private_file(&self.path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    /// Stored token, or `None` when missing or empty
    pub fn load(&self) -> Result<Option<String>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredConfig = serde_json::from_slice(&raw)?;
        Ok(Some(stored.token).filter(|t| !t.is_empty()))
    }

    /// Stored token or [`Error::NotLoggedIn`]
    pub fn require(&self) -> Result<String> {
        self.load()?.ok_or(Error::NotLoggedIn)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}
