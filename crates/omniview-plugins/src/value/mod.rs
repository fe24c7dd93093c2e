//! Opaque value envelopes for payloads whose schema belongs to a capability.
//!
//! Settings values and command payloads cross the plugin boundary as opaque
//! bytes rather than structured frames so their schema can evolve without a
//! wire change. The layout is:
//!
//! ```text
//! +---------+----------------+----------------------+
//! | version | length (u32 BE)| JSON document        |
//! +---------+----------------+----------------------+
//! ```
//!
//! The leading version byte is the schema-evolution escape hatch: decoders
//! reject versions they do not understand instead of guessing. Inside JSON
//! frames the envelope is carried as a base64 string.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Envelope version produced by [`OpaqueValue::encode`].
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;

/// Errors raised while decoding an opaque envelope.
#[derive(Debug, Error)]
pub enum ValueError {
    /// The buffer is shorter than the envelope header.
    #[error("opaque value truncated: {len} bytes, header needs {HEADER_LEN}")]
    Truncated {
        /// Bytes available.
        len: usize,
    },
    /// The envelope version is not understood.
    #[error("unsupported opaque value version {version}")]
    UnsupportedVersion {
        /// Version byte that was read.
        version: u8,
    },
    /// The declared body length disagrees with the bytes present.
    #[error("opaque value declares {declared} bytes but carries {actual}")]
    LengthMismatch {
        /// Length in the header.
        declared: usize,
        /// Length of the body.
        actual: usize,
    },
    /// The body is too large to describe in the header.
    #[error("opaque value body of {len} bytes exceeds the u32 length field")]
    TooLarge {
        /// Body length.
        len: usize,
    },
    /// The body is not valid JSON for the requested type.
    #[error("opaque value body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-prefixed JSON bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpaqueValue {
    bytes: Vec<u8>,
}

impl OpaqueValue {
    /// Encodes any JSON-representable value.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Json`] when `value` cannot be serialised and
    /// [`ValueError::TooLarge`] when the encoding exceeds `u32::MAX` bytes.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, ValueError> {
        let body = serde_json::to_vec(value)?;
        let len = u32::try_from(body.len()).map_err(|_| ValueError::TooLarge { len: body.len() })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.push(ENVELOPE_VERSION);
        #[expect(clippy::big_endian_bytes, reason = "the envelope length is network order")]
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(Self { bytes })
    }

    /// Wraps raw envelope bytes received from the wire without validating
    /// them; validation happens on [`OpaqueValue::decode`].
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw envelope bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decodes the envelope into `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValueError`] describing the first structural or JSON
    /// problem found.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        let body = self.body()?;
        Ok(serde_json::from_slice(body)?)
    }

    /// Decodes the envelope into a dynamic JSON value.
    ///
    /// # Errors
    ///
    /// See [`OpaqueValue::decode`].
    pub fn to_value(&self) -> Result<Value, ValueError> {
        self.decode()
    }

    fn body(&self) -> Result<&[u8], ValueError> {
        let Some((header, body)) = self.bytes.split_at_checked(HEADER_LEN) else {
            return Err(ValueError::Truncated {
                len: self.bytes.len(),
            });
        };
        let [version, b0, b1, b2, b3] = *header else {
            return Err(ValueError::Truncated {
                len: self.bytes.len(),
            });
        };
        if version != ENVELOPE_VERSION {
            return Err(ValueError::UnsupportedVersion { version });
        }
        #[expect(clippy::big_endian_bytes, reason = "the envelope length is network order")]
        let declared_len = u32::from_be_bytes([b0, b1, b2, b3]);
        let declared = usize::try_from(declared_len).unwrap_or(usize::MAX);
        if declared != body.len() {
            return Err(ValueError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok(body)
    }
}

impl Serialize for OpaqueValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.bytes))
    }
}

impl<'de> Deserialize<'de> for OpaqueValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Self::from_bytes)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests;
