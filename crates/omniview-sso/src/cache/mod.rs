//! On-disk SSO token cache.
//!
//! Each SSO session owns one JSON file named after the lowercase hex SHA-1 of
//! the session name. Field names are camelCase and timestamps RFC 3339, which
//! is what the AWS CLI reads and writes under `~/.aws/sso/cache`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

const CACHE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::cache");

/// A cached SSO access token and the client registration that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoToken {
    /// Portal URL the session signs in against.
    pub start_url: String,
    /// Region hosting the SSO OIDC service.
    pub region: String,
    /// Bearer token for the SSO portal API.
    pub access_token: String,
    /// When [`Self::access_token`] stops being accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// OIDC client the token was issued to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Secret paired with [`Self::client_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Token used to mint a new access token without user interaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When the client registration itself expires.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub registration_expires_at: Option<OffsetDateTime>,
}

impl SsoToken {
    /// Whether the access token has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Whether the stored client registration can still be used at `now`.
    #[must_use]
    pub fn registration_valid_at(&self, now: OffsetDateTime) -> bool {
        self.client_id.is_some()
            && self.client_secret.is_some()
            && self
                .registration_expires_at
                .is_some_and(|expiry| expiry > now)
    }
}

/// Errors raised by [`TokenCache`].
#[derive(Debug, Error)]
pub enum TokenCacheError {
    /// Reading, writing or removing a cache file failed.
    #[error("token cache I/O failed for '{path}': {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A cache file exists but does not hold a token.
    #[error("token cache file '{path}' is malformed: {source}")]
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// A token could not be encoded.
    #[error("failed to encode SSO token: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Lowercase hex SHA-1 of `session`, the cache file stem for that session.
#[must_use]
pub fn cache_key(session: &str) -> String {
    format!("{:x}", Sha1::digest(session.as_bytes()))
}

/// Token files in one cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    /// Cache rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the token files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the token for `session`.
    #[must_use]
    pub fn path_for(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cache_key(session)))
    }

    /// Loads the token for `session`, or `None` when nothing is cached.
    ///
    /// # Errors
    ///
    /// [`TokenCacheError::Io`] when the file cannot be read and
    /// [`TokenCacheError::Malformed`] when it does not decode.
    pub fn load(&self, session: &str) -> Result<Option<SsoToken>, TokenCacheError> {
        let path = self.path_for(session);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(TokenCacheError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| TokenCacheError::Malformed { path, source })
    }

    /// Loads the token for `session` if it is still valid at `now`.
    ///
    /// # Errors
    ///
    /// As for [`Self::load`].
    pub fn load_valid(
        &self,
        session: &str,
        now: OffsetDateTime,
    ) -> Result<Option<SsoToken>, TokenCacheError> {
        Ok(self
            .load(session)?
            .filter(|token| !token.is_expired_at(now)))
    }

    /// Writes `token` for `session`, replacing any previous file.
    ///
    /// The file is written beside its destination and renamed into place so
    /// a concurrent reader never sees a partial token. On Unix it is readable
    /// by the owner only.
    ///
    /// # Errors
    ///
    /// [`TokenCacheError::Encode`] or [`TokenCacheError::Io`].
    pub fn save(&self, session: &str, token: &SsoToken) -> Result<PathBuf, TokenCacheError> {
        let encoded = serde_json::to_vec_pretty(token).map_err(TokenCacheError::Encode)?;
        fs::create_dir_all(&self.dir).map_err(|source| TokenCacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(session);
        let staging = path.with_extension("json.tmp");
        write_private(&staging, &encoded)
            .and_then(|()| fs::rename(&staging, &path))
            .map_err(|source| TokenCacheError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(target: CACHE_TARGET, session, path = %path.display(), "cached SSO token");
        Ok(path)
    }

    /// Removes the token for `session`. Returns whether a file existed.
    ///
    /// # Errors
    ///
    /// [`TokenCacheError::Io`] for failures other than a missing file.
    pub fn delete(&self, session: &str) -> Result<bool, TokenCacheError> {
        let path = self.path_for(session);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(target: CACHE_TARGET, session, "removed cached SSO token");
                Ok(true)
            }
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(TokenCacheError::Io { path, source }),
        }
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
