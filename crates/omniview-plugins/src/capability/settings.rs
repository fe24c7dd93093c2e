//! Settings capability shims. Values cross the wire as opaque envelopes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CapabilityClient, invoke};
use crate::descriptor::Capability;
use crate::rpc::{CallContext, RpcClient, RpcStatus, Service, decode_payload, encode_payload};
use crate::settings::{Setting, SettingsProvider};
use crate::value::OpaqueValue;

#[derive(Serialize, Deserialize)]
struct IdRequest {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct SetRequest {
    id: String,
    value: OpaqueValue,
}

#[derive(Serialize, Deserialize)]
struct SetManyRequest {
    values: BTreeMap<String, OpaqueValue>,
}

pub(super) fn seal(value: &Value) -> Result<OpaqueValue, RpcStatus> {
    OpaqueValue::encode(value).map_err(|err| RpcStatus::internal(err.to_string()))
}

pub(super) fn unseal(value: &OpaqueValue) -> Result<Value, RpcStatus> {
    value
        .to_value()
        .map_err(|err| RpcStatus::invalid_argument(err.to_string()))
}

/// Exposes a [`SettingsProvider`] as the `settings` service.
pub struct SettingsServer {
    provider: Arc<dyn SettingsProvider>,
}

impl SettingsServer {
    /// Wraps `provider`.
    #[must_use]
    pub const fn new(provider: Arc<dyn SettingsProvider>) -> Self {
        Self { provider }
    }
}

impl Service for SettingsServer {
    fn call(&self, call: &CallContext, payload: Value) -> Result<Value, RpcStatus> {
        match call.method() {
            "ListSettings" => encode_payload(&self.provider.list_settings()?),
            "GetSetting" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&self.provider.get_setting(&request.id)?)
            }
            "GetSettingValue" => {
                let request: IdRequest = decode_payload(payload)?;
                encode_payload(&seal(&self.provider.get_setting_value(&request.id)?)?)
            }
            "SetSetting" => {
                let request: SetRequest = decode_payload(payload)?;
                self.provider.set_setting(&request.id, unseal(&request.value)?)?;
                Ok(Value::Null)
            }
            "SetSettings" => {
                let request: SetManyRequest = decode_payload(payload)?;
                let values = request
                    .values
                    .iter()
                    .map(|(id, value)| Ok((id.clone(), unseal(value)?)))
                    .collect::<Result<BTreeMap<_, _>, RpcStatus>>()?;
                self.provider.set_settings(values)?;
                Ok(Value::Null)
            }
            other => Err(RpcStatus::unimplemented(format!("settings/{other}"))),
        }
    }
}

/// [`SettingsProvider`] over a plugin connection.
#[derive(Clone)]
pub struct SettingsClient {
    rpc: RpcClient,
}

impl CapabilityClient for SettingsClient {
    const CAPABILITY: Capability = Capability::Settings;

    fn from_rpc(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl SettingsProvider for SettingsClient {
    fn list_settings(&self) -> Result<Vec<Setting>, RpcStatus> {
        invoke(&self.rpc, Capability::Settings, "ListSettings", None, &Value::Null)
    }

    fn get_setting(&self, id: &str) -> Result<Setting, RpcStatus> {
        invoke(
            &self.rpc,
            Capability::Settings,
            "GetSetting",
            None,
            &IdRequest { id: id.to_owned() },
        )
    }

    fn get_setting_value(&self, id: &str) -> Result<Value, RpcStatus> {
        let value: OpaqueValue = invoke(
            &self.rpc,
            Capability::Settings,
            "GetSettingValue",
            None,
            &IdRequest { id: id.to_owned() },
        )?;
        unseal(&value)
    }

    fn set_setting(&self, id: &str, value: Value) -> Result<(), RpcStatus> {
        let request = SetRequest {
            id: id.to_owned(),
            value: seal(&value)?,
        };
        invoke(&self.rpc, Capability::Settings, "SetSetting", None, &request)
    }

    fn set_settings(&self, values: BTreeMap<String, Value>) -> Result<(), RpcStatus> {
        let request = SetManyRequest {
            values: values
                .iter()
                .map(|(id, value)| Ok((id.clone(), seal(value)?)))
                .collect::<Result<_, RpcStatus>>()?,
        };
        invoke(&self.rpc, Capability::Settings, "SetSettings", None, &request)
    }
}
