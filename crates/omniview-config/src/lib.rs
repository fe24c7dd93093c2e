//! Shared configuration for the Omniview plugin host.
//!
//! Configuration is layered with `ortho_config`: built-in defaults, then an
//! optional `.omniview.toml`, then `OMNIVIEW_*` environment variables, then
//! command-line flags. Every field is optional on the wire; accessors resolve
//! the effective value against [`defaults`].

use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod defaults;
mod logging;

pub use defaults::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_INFORMER_SYNC_TIMEOUT_MS, DEFAULT_LOG_FILTER,
    default_log_filter, default_log_format, default_plugins_dir, default_sso_cache_dir,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Host configuration resolved from files, environment and CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "OMNIVIEW")]
pub struct Config {
    /// Directory scanned for installed plugins.
    pub plugins_dir: Option<Utf8PathBuf>,
    /// `tracing` filter expression.
    pub log_filter: Option<String>,
    /// Output format for structured logs.
    pub log_format: Option<LogFormat>,
    /// Upper bound on the plugin handshake, in milliseconds.
    pub handshake_timeout_ms: Option<u64>,
    /// Upper bound on the initial informer cache sync, in milliseconds.
    pub informer_sync_timeout_ms: Option<u64>,
    /// Directory holding cached SSO tokens.
    pub sso_cache_dir: Option<Utf8PathBuf>,
}

impl Config {
    /// Effective plugins directory.
    #[must_use]
    pub fn plugins_dir(&self) -> Utf8PathBuf {
        self.plugins_dir.clone().unwrap_or_else(default_plugins_dir)
    }

    /// Effective log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Effective log format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Effective handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handshake_timeout_ms
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }

    /// Effective informer sync timeout.
    #[must_use]
    pub fn informer_sync_timeout(&self) -> Duration {
        Duration::from_millis(
            self.informer_sync_timeout_ms
                .unwrap_or(DEFAULT_INFORMER_SYNC_TIMEOUT_MS),
        )
    }

    /// Effective SSO token cache directory.
    #[must_use]
    pub fn sso_cache_dir(&self) -> Utf8PathBuf {
        self.sso_cache_dir.clone().unwrap_or_else(default_sso_cache_dir)
    }

    /// Ensures the plugins directory exists and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] when the directory cannot be created or a
    /// non-directory entry occupies the path.
    pub fn prepare_plugins_dir(&self) -> Result<Utf8PathBuf, DirectoryError> {
        let dir = self.plugins_dir();
        ensure_directory(&dir)?;
        Ok(dir)
    }
}

/// Errors raised while preparing a configured directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory could not be created.
    #[error("failed to create directory '{path}': {source}")]
    Create {
        /// Directory that was requested.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Something other than a directory already exists at the path.
    #[error("'{path}' exists but is not a directory")]
    NotADirectory {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

fn ensure_directory(path: &Utf8Path) -> Result<(), DirectoryError> {
    if path.exists() && !path.is_dir() {
        return Err(DirectoryError::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    fs::create_dir_all(path).map_err(|source| DirectoryError::Create {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    fn defaults_resolve_when_unset() {
        let config = Config::default();
        assert_eq!(config.log_filter(), "info");
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.informer_sync_timeout(), Duration::from_secs(10));
        assert!(config.sso_cache_dir().as_str().ends_with(".aws/sso/cache"));
    }

    #[rstest]
    fn explicit_values_take_precedence() {
        let config = Config {
            log_filter: Some(String::from("debug")),
            log_format: Some(LogFormat::Compact),
            handshake_timeout_ms: Some(250),
            ..Config::default()
        };
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
    }

    #[rstest]
    fn prepare_plugins_dir_creates_missing_directory() {
        let temp = TempDir::new().expect("temp dir");
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("plugins")).expect("utf8 path");
        let config = Config {
            plugins_dir: Some(dir.clone()),
            ..Config::default()
        };

        let prepared = config.prepare_plugins_dir().expect("prepare plugins dir");
        assert_eq!(prepared, dir);
        assert!(dir.is_dir());
    }

    #[rstest]
    fn prepare_plugins_dir_rejects_files() {
        let temp = TempDir::new().expect("temp dir");
        let file = temp.path().join("plugins");
        std::fs::write(&file, b"not a dir").expect("write file");
        let config = Config {
            plugins_dir: Some(Utf8PathBuf::from_path_buf(file).expect("utf8 path")),
            ..Config::default()
        };

        let err = config.prepare_plugins_dir().expect_err("file must be rejected");
        assert!(matches!(err, DirectoryError::NotADirectory { .. }));
    }
}
