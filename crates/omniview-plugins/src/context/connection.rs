use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::millis;

/// A credential or target scope, such as one kubeconfig context or one AWS
/// profile.
///
/// `sensitive_data` travels to the plugin inside a [`super::PluginContext`]
/// but must be stripped with [`Connection::redacted`] before anything is
/// handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Stable identifier chosen by the connection loader.
    pub id: String,
    /// Generated unique identifier.
    pub uid: String,
    /// Display name.
    pub name: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Display avatar URL or icon name.
    #[serde(default)]
    pub avatar: String,
    /// UI-visible data.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Private data; never shown to the UI.
    #[serde(default)]
    pub sensitive_data: BTreeMap<String, Value>,
    /// Arbitrary labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// When credentials were last refreshed.
    #[serde(with = "time::serde::rfc3339", default = "epoch")]
    pub last_refresh: OffsetDateTime,
    /// How long credentials remain valid after a refresh.
    #[serde(rename = "expiry_time_ms", with = "millis", default)]
    pub expiry_time: Duration,
}

const fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

impl Connection {
    /// Creates an unauthenticated connection with a fresh UID.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uid: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            avatar: String::new(),
            data: BTreeMap::new(),
            sensitive_data: BTreeMap::new(),
            labels: BTreeMap::new(),
            last_refresh: OffsetDateTime::UNIX_EPOCH,
            expiry_time: Duration::ZERO,
        }
    }

    /// Records a refresh at `at` valid for `expiry`.
    pub const fn mark_refreshed(&mut self, at: OffsetDateTime, expiry: Duration) {
        self.last_refresh = at;
        self.expiry_time = expiry;
    }

    /// Whether credentials are currently valid.
    #[must_use]
    pub fn is_authed(&self) -> bool {
        self.is_authed_at(OffsetDateTime::now_utc())
    }

    /// Whether credentials are valid at `now`: the expiry is positive and
    /// `now` precedes `last_refresh + expiry_time`.
    #[must_use]
    pub fn is_authed_at(&self, now: OffsetDateTime) -> bool {
        if self.expiry_time.is_zero() {
            return false;
        }
        let Ok(expiry) = time::Duration::try_from(self.expiry_time) else {
            return true;
        };
        self.last_refresh
            .checked_add(expiry)
            .is_none_or(|valid_until| now < valid_until)
    }

    /// String value of a `data` entry.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Copy safe to hand to the UI.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            sensitive_data: BTreeMap::new(),
            ..self.clone()
        }
    }
}
