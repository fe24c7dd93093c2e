//! Built-in configuration defaults.

use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default handshake budget in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default informer cache-sync budget in milliseconds.
pub const DEFAULT_INFORMER_SYNC_TIMEOUT_MS: u64 = 10_000;

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// `~/.omniview/plugins`, falling back to the temporary directory when no
/// home directory can be determined.
#[must_use]
pub fn default_plugins_dir() -> Utf8PathBuf {
    home_base().join(".omniview").join("plugins")
}

/// `~/.aws/sso/cache`, the location shared with the AWS CLI.
#[must_use]
pub fn default_sso_cache_dir() -> Utf8PathBuf {
    home_base().join(".aws").join("sso").join("cache")
}

fn home_base() -> Utf8PathBuf {
    dirs::home_dir()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .or_else(|| Utf8PathBuf::from_path_buf(std::env::temp_dir()).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("/tmp"))
}
