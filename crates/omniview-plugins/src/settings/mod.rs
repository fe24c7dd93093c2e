//! Plugin settings: typed definitions, a validating store and the
//! provider trait the rest of the crate consumes.
//!
//! Setting values are arbitrary JSON. On the wire they travel as
//! [`OpaqueValue`](crate::value::OpaqueValue) envelopes; the conversion
//! happens in the settings capability shims.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rpc::RpcStatus;

/// Shape a setting's value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKind {
    /// Any string.
    Text,
    /// A signed integer.
    Integer,
    /// Any number.
    Float,
    /// A boolean.
    Toggle,
    /// One of the declared options.
    Select,
    /// A list drawn from the declared options.
    Multiselect,
}

impl SettingKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Toggle => "toggle",
            Self::Select => "select",
            Self::Multiselect => "multiselect",
        }
    }

    fn accepts(self, value: &Value, options: &[Value]) -> bool {
        let allowed = |candidate: &Value| options.is_empty() || options.contains(candidate);
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Toggle => value.is_boolean(),
            Self::Select => allowed(value),
            Self::Multiselect => value
                .as_array()
                .is_some_and(|items| items.iter().all(allowed)),
        }
    }
}

/// Static description of one setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    /// Stable identifier, e.g. `kubeconfigs`.
    pub id: String,
    /// Human-readable name.
    pub label: String,
    /// Longer explanation.
    #[serde(default)]
    pub description: String,
    /// Value shape.
    pub kind: SettingKind,
    /// Value used until the user sets one.
    pub default: Value,
    /// Permitted values for the select kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
}

impl SettingDefinition {
    /// Creates a definition with no description or options.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        kind: SettingKind,
        default: Value,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            kind,
            default,
            options: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the permitted values.
    #[must_use]
    pub fn with_options(mut self, options: Vec<Value>) -> Self {
        self.options = options;
        self
    }

    fn check(&self, value: &Value) -> Result<(), SettingsError> {
        if self.kind.accepts(value, &self.options) {
            Ok(())
        } else {
            Err(SettingsError::InvalidValue {
                id: self.id.clone(),
                kind: self.kind,
            })
        }
    }
}

/// A definition together with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// What the setting is.
    #[serde(flatten)]
    pub definition: SettingDefinition,
    /// Current value.
    pub value: Value,
}

/// Settings lookup and mutation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// No setting has this ID.
    #[error("setting '{id}' not found")]
    NotFound {
        /// Requested ID.
        id: String,
    },
    /// Two definitions share an ID.
    #[error("setting '{id}' is defined more than once")]
    Duplicate {
        /// Repeated ID.
        id: String,
    },
    /// The value does not fit the setting's kind.
    #[error("value for setting '{id}' is not a valid {}", .kind.as_str())]
    InvalidValue {
        /// Target setting.
        id: String,
        /// Expected kind.
        kind: SettingKind,
    },
}

impl From<SettingsError> for RpcStatus {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::NotFound { .. } => Self::not_found(error.to_string()),
            SettingsError::Duplicate { .. } | SettingsError::InvalidValue { .. } => {
                Self::invalid_argument(error.to_string())
            }
        }
    }
}

/// The settings capability.
///
/// Implemented in-process by [`SettingsStore`] and over RPC by the settings
/// client shim. Handlers reach it through
/// [`PluginContext::settings`](crate::context::PluginContext::settings).
pub trait SettingsProvider: Send + Sync {
    /// Every setting with its current value, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns the failure status when the provider is remote.
    fn list_settings(&self) -> Result<Vec<Setting>, RpcStatus>;

    /// One setting.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown IDs.
    fn get_setting(&self, id: &str) -> Result<Setting, RpcStatus>;

    /// The current value of one setting.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown IDs.
    fn get_setting_value(&self, id: &str) -> Result<Value, RpcStatus>;

    /// Replaces one value.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown IDs and `invalid_argument` when the
    /// value does not fit the setting.
    fn set_setting(&self, id: &str, value: Value) -> Result<(), RpcStatus>;

    /// Replaces several values atomically: nothing changes unless every
    /// value is valid.
    ///
    /// # Errors
    ///
    /// As [`SettingsProvider::set_setting`] for the first offending entry.
    fn set_settings(&self, values: BTreeMap<String, Value>) -> Result<(), RpcStatus>;

    /// Convenience lookup that folds failures into `None`.
    fn value(&self, id: &str) -> Option<Value> {
        self.get_setting_value(id).ok()
    }
}

/// In-memory, validating settings store.
#[derive(Debug, Default)]
pub struct SettingsStore {
    settings: RwLock<BTreeMap<String, Setting>>,
}

impl SettingsStore {
    /// Builds a store with every setting at its default.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Duplicate`] for repeated IDs and
    /// [`SettingsError::InvalidValue`] when a default does not fit its kind.
    pub fn new(
        definitions: impl IntoIterator<Item = SettingDefinition>,
    ) -> Result<Self, SettingsError> {
        let mut settings = BTreeMap::new();
        for definition in definitions {
            definition.check(&definition.default)?;
            if settings.contains_key(&definition.id) {
                return Err(SettingsError::Duplicate { id: definition.id });
            }
            let value = definition.default.clone();
            settings.insert(definition.id.clone(), Setting { definition, value });
        }
        Ok(Self {
            settings: RwLock::new(settings),
        })
    }

    /// Every setting, ordered by ID.
    #[must_use]
    pub fn list(&self) -> Vec<Setting> {
        self.read().values().cloned().collect()
    }

    /// One setting.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::NotFound`] for unknown IDs.
    pub fn get(&self, id: &str) -> Result<Setting, SettingsError> {
        self.read().get(id).cloned().ok_or_else(|| not_found(id))
    }

    /// The current value of one setting.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::NotFound`] for unknown IDs.
    pub fn get_value(&self, id: &str) -> Result<Value, SettingsError> {
        self.get(id).map(|setting| setting.value)
    }

    /// Replaces one value.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::NotFound`] or [`SettingsError::InvalidValue`].
    pub fn set(&self, id: &str, value: Value) -> Result<(), SettingsError> {
        let mut settings = self.write();
        let setting = settings.get_mut(id).ok_or_else(|| not_found(id))?;
        setting.definition.check(&value)?;
        setting.value = value;
        Ok(())
    }

    /// Validates every entry, then applies them all.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the store is unchanged in that case.
    pub fn set_many(&self, values: BTreeMap<String, Value>) -> Result<(), SettingsError> {
        let mut settings = self.write();
        for (id, value) in &values {
            let setting = settings.get(id).ok_or_else(|| not_found(id))?;
            setting.definition.check(value)?;
        }
        for (id, value) in values {
            if let Some(setting) = settings.get_mut(&id) {
                setting.value = value;
            }
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Setting>> {
        self.settings
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Setting>> {
        self.settings
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn not_found(id: &str) -> SettingsError {
    SettingsError::NotFound { id: id.to_owned() }
}

impl SettingsProvider for SettingsStore {
    fn list_settings(&self) -> Result<Vec<Setting>, RpcStatus> {
        Ok(self.list())
    }

    fn get_setting(&self, id: &str) -> Result<Setting, RpcStatus> {
        self.get(id).map_err(RpcStatus::from)
    }

    fn get_setting_value(&self, id: &str) -> Result<Value, RpcStatus> {
        self.get_value(id).map_err(RpcStatus::from)
    }

    fn set_setting(&self, id: &str, value: Value) -> Result<(), RpcStatus> {
        self.set(id, value).map_err(RpcStatus::from)
    }

    fn set_settings(&self, values: BTreeMap<String, Value>) -> Result<(), RpcStatus> {
        self.set_many(values).map_err(RpcStatus::from)
    }
}

#[cfg(test)]
mod tests;
