//! Cookie handshake performed before any RPC traffic is trusted.
//!
//! The host derives a cookie from the plugin's ID and version, passes it to
//! the child through the `OMNIVIEW` environment variable, and expects the
//! plugin to echo the same cookie in its first frame. The plugin performs
//! the mirror check: a binary launched with a cookie it would not have
//! derived itself refuses to serve. A mismatch means the binary and its
//! descriptor disagree, so it is fatal and never retried.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::descriptor::Capability;

/// Wire protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable (and frame key) carrying the cookie.
pub const MAGIC_COOKIE_KEY: &str = "OMNIVIEW";

/// Environment variable carrying the protocol version the host expects.
pub const PROTOCOL_VERSION_ENV: &str = "OMNIVIEW_PLUGIN_PROTOCOL_VERSION";

const COOKIE_DOMAIN: &[u8] = b"omniview.plugin.cookie";

/// Mismatches detected while verifying a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch {
        /// Version this side speaks.
        expected: u32,
        /// Version the peer announced.
        actual: u32,
    },
    /// The peer used a different cookie key.
    #[error("cookie key mismatch: expected '{expected}', got '{actual}'")]
    CookieKeyMismatch {
        /// Expected key.
        expected: String,
        /// Key the peer announced.
        actual: String,
    },
    /// The cookie value does not match the value derived for this plugin.
    #[error("cookie value mismatch; the binary does not match its descriptor")]
    CookieValueMismatch,
    /// No cookie was supplied.
    #[error("no '{MAGIC_COOKIE_KEY}' cookie was supplied")]
    MissingCookie,
    /// The first frame was not a handshake.
    #[error("expected a handshake frame, got '{kind}'")]
    UnexpectedFrame {
        /// Kind of the frame that arrived.
        kind: String,
    },
    /// The plugin closed its output before completing the handshake.
    #[error("plugin exited before completing the handshake")]
    Closed,
    /// The handshake frame could not be decoded.
    #[error("malformed handshake: {message}")]
    Malformed {
        /// Decoder message.
        message: String,
    },
}

/// First frame written by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeFrame {
    /// Protocol version the plugin speaks.
    pub protocol_version: u32,
    /// Cookie key, always [`MAGIC_COOKIE_KEY`].
    pub cookie_key: String,
    /// Cookie value derived from ID and version.
    pub cookie_value: String,
    /// Capabilities the plugin serves.
    pub capabilities: Vec<Capability>,
}

/// Expected handshake parameters for one plugin build.
///
/// # Example
///
/// ```
/// use omniview_plugins::HandshakeConfig;
///
/// let a = HandshakeConfig::for_plugin("kubernetes", "1.0.0");
/// let b = HandshakeConfig::for_plugin("kubernetes", "1.0.0");
/// assert_eq!(a.cookie_value(), b.cookie_value());
/// assert_ne!(a.cookie_value(), HandshakeConfig::for_plugin("kubernetes", "1.0.1").cookie_value());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    protocol_version: u32,
    cookie_key: String,
    cookie_value: String,
}

impl HandshakeConfig {
    /// Derives the handshake for a plugin ID and version.
    #[must_use]
    pub fn for_plugin(id: &str, version: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            cookie_key: String::from(MAGIC_COOKIE_KEY),
            cookie_value: cookie_value(id, version),
        }
    }

    /// Protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Cookie key.
    #[must_use]
    pub const fn cookie_key(&self) -> &str {
        self.cookie_key.as_str()
    }

    /// Cookie value.
    #[must_use]
    pub const fn cookie_value(&self) -> &str {
        self.cookie_value.as_str()
    }

    /// Environment the host passes to the plugin process.
    #[must_use]
    pub fn environment(&self) -> [(String, String); 2] {
        [
            (self.cookie_key.clone(), self.cookie_value.clone()),
            (
                String::from(PROTOCOL_VERSION_ENV),
                self.protocol_version.to_string(),
            ),
        ]
    }

    /// Builds the frame a plugin announces itself with.
    #[must_use]
    pub fn frame(&self, capabilities: Vec<Capability>) -> HandshakeFrame {
        HandshakeFrame {
            protocol_version: self.protocol_version,
            cookie_key: self.cookie_key.clone(),
            cookie_value: self.cookie_value.clone(),
            capabilities,
        }
    }

    /// Host side: checks the plugin's announced frame bit for bit.
    ///
    /// # Errors
    ///
    /// Returns the first [`HandshakeError`] mismatch found.
    pub fn verify(&self, frame: &HandshakeFrame) -> Result<(), HandshakeError> {
        if frame.protocol_version != self.protocol_version {
            return Err(HandshakeError::ProtocolMismatch {
                expected: self.protocol_version,
                actual: frame.protocol_version,
            });
        }
        if frame.cookie_key != self.cookie_key {
            return Err(HandshakeError::CookieKeyMismatch {
                expected: self.cookie_key.clone(),
                actual: frame.cookie_key.clone(),
            });
        }
        if frame.cookie_value.as_bytes() != self.cookie_value.as_bytes() {
            return Err(HandshakeError::CookieValueMismatch);
        }
        Ok(())
    }

    /// Plugin side: checks the cookie and protocol version passed in the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MissingCookie`] when the plugin was not
    /// launched by a host, or a mismatch error otherwise.
    pub fn check_environment<F>(&self, lookup: F) -> Result<(), HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cookie = lookup(&self.cookie_key).ok_or(HandshakeError::MissingCookie)?;
        if let Some(version) = lookup(PROTOCOL_VERSION_ENV) {
            let actual = version
                .trim()
                .parse::<u32>()
                .map_err(|err| HandshakeError::Malformed {
                    message: format!("{PROTOCOL_VERSION_ENV}='{version}': {err}"),
                })?;
            if actual != self.protocol_version {
                return Err(HandshakeError::ProtocolMismatch {
                    expected: self.protocol_version,
                    actual,
                });
            }
        }
        if cookie.as_bytes() != self.cookie_value.as_bytes() {
            return Err(HandshakeError::CookieValueMismatch);
        }
        Ok(())
    }
}

/// Hex SHA-256 over a domain tag, the ID and the version, NUL separated.
fn cookie_value(id: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(COOKIE_DOMAIN);
    hasher.update(b"\0");
    hasher.update(id.as_bytes());
    hasher.update(b"\0");
    hasher.update(version.as_bytes());
    format!("{:x}", hasher.finalize())
}
