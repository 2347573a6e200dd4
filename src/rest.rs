//! REST collaborator endpoints: account sign-in and device discovery. The
//! core consumes these, it does not reimplement the account service; every
//! response envelope carries its payload under `data`, and a missing `data`
//! field is a hard login/listing failure.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Relay-generation account server (gateway discovery for the TCP path).
pub const LEGACY_SERVER: &str = "https://uscv2.naviensmartcontrol.com";

/// Cloud-generation account server (sign-in + device list for MQTT).
pub const CLOUD_SERVER: &str = "https://nlus.naviensmartcontrol.com/api/v2.1";

/// Temporary credential bundle handed out at sign-in for the IoT backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub access_key_id: String,
    pub secret_key: String,
    pub session_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignIn {
    pub user_seq: String,
    pub broker: Option<BrokerCredentials>,
}

/// One account device as returned by the cloud device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub mac_address: String,
    pub device_type: u8,
    pub home_seq: u64,
    pub additional_value: String,
    pub connected: bool,
}

/// One gateway as returned by the relay-generation device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub nickname: String,
    pub connected: bool,
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Exchange credentials for the user sequence and temporary broker
    /// credentials. Rejected credentials are fatal, not retried.
    pub async fn sign_in(&self, user_id: &str, password: &str) -> Result<SignIn> {
        let url = format!("{}/user/sign-in", self.base_url);
        debug!(url = %url, "signing in");
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "userId": user_id, "password": password }))
            .send()
            .await?;
        if matches!(resp.status().as_u16(), 400 | 401 | 403) {
            return Err(Error::Auth(format!("sign-in rejected ({})", resp.status())));
        }
        let body: Value = resp.error_for_status()?.json().await?;
        let data = envelope_data(&body)
            .ok_or_else(|| Error::Auth("sign-in response missing data".to_string()))?;

        let user_seq = data
            .get("userSeq")
            .map(value_to_string)
            .ok_or_else(|| Error::Auth("sign-in response missing userSeq".to_string()))?;

        // The credential bundle nests under `token` on current servers but
        // has been seen flattened on older ones.
        let token = data.get("token").unwrap_or(&data);
        let broker = match (
            token.get("accessKeyId").and_then(Value::as_str),
            token.get("secretKey").and_then(Value::as_str),
            token.get("sessionToken").and_then(Value::as_str),
        ) {
            (Some(key), Some(secret), Some(session)) => Some(BrokerCredentials {
                access_key_id: key.to_string(),
                secret_key: secret.to_string(),
                session_token: session.to_string(),
            }),
            _ => None,
        };

        Ok(SignIn { user_seq, broker })
    }

    /// List the account's cloud devices.
    pub async fn device_list(&self, user_seq: &str) -> Result<Vec<DeviceRecord>> {
        let url = format!("{}/device/list", self.base_url);
        debug!(url = %url, "requesting device list");
        let body: Value = self
            .http
            .post(&url)
            .json(&json!({ "userSeq": user_seq, "offset": 0, "count": 20 }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let data = envelope_data(&body)
            .ok_or_else(|| Error::Auth("device list response missing data".to_string()))?;
        let devices = data
            .get("devices")
            .or_else(|| data.get("device"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(devices
            .iter()
            .filter_map(|dev| {
                let record = DeviceRecord {
                    name: dev
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    mac_address: dev.get("macAddress").and_then(Value::as_str)?.to_string(),
                    device_type: dev.get("deviceType").and_then(Value::as_u64)? as u8,
                    home_seq: dev.get("homeSeq").and_then(Value::as_u64)?,
                    additional_value: dev
                        .get("additionalValue")
                        .map(value_to_string)
                        .unwrap_or_default(),
                    connected: dev
                        .get("connected")
                        .and_then(Value::as_u64)
                        .map(|v| v == 1)
                        .unwrap_or(true),
                };
                Some(record)
            })
            .collect())
    }

    /// Relay-generation discovery: credentials straight to a gateway list.
    pub async fn gateway_list(&self, user_id: &str, password: &str) -> Result<Vec<GatewayRecord>> {
        let url = format!("{}/api/requestDeviceList", self.base_url);
        debug!(url = %url, "requesting gateway list");
        let body: Value = self
            .http
            .post(&url)
            .json(&json!({ "userID": user_id, "password": password }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let data = envelope_data(&body)
            .ok_or_else(|| Error::Auth("gateway list response missing data".to_string()))?;
        let list = data.as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .filter_map(|gw| {
                let gateway_id = gw.get("GID").and_then(Value::as_str)?.to_string();
                Some(GatewayRecord {
                    gateway_id,
                    nickname: gw
                        .get("NickName")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    connected: gw
                        .get("ConnectYn")
                        .and_then(Value::as_str)
                        .map(|v| v == "Y")
                        .unwrap_or(false),
                })
            })
            .collect())
    }
}

/// Pull the payload out of a response envelope. `data` is sometimes a JSON
/// object and sometimes a JSON-encoded string; both forms are accepted.
fn envelope_data(body: &Value) -> Option<Value> {
    match body.get("data")? {
        Value::String(encoded) => match serde_json::from_str(encoded) {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!("data field is not valid JSON: {e}");
                None
            }
        },
        other => Some(other.clone()),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
