//! Provider API client.
//!
//! Every request is a GET authenticated with credentials from the variable store.
//! Responses carry a top-level `status` of `OK` or `ERROR`; anything else is treated
//! as an error, and an `ERROR` aborts the calling action with the provider's message.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{NimbusError, Result};
use crate::variables::Variables;

pub const API_URL: &str = "https://api.digitalocean.com";
pub const CLIENT_ID_VAR: &str = "DIGITALOCEAN_CLIENT_ID";
pub const API_KEY_VAR: &str = "DIGITALOCEAN_API_KEY";

/// One poll of a long-running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub percentage: u8,
    pub done: bool,
    /// The raw event record.
    pub payload: Value,
}

/// Operation event as returned by `events/<id>`.
#[derive(Debug, Clone, Deserialize)]
struct Event {
    #[serde(default)]
    action_status: Option<String>,
    #[serde(default, deserialize_with = "percentage")]
    percentage: u8,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Issues a request and returns the whole body of an `OK` response.
    async fn request(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value>;

    async fn operation_status(&self, id: u64) -> Result<OperationStatus> {
        let mut body = self.request(&format!("events/{}", id), &[]).await?;
        let payload = body
            .get_mut("event")
            .map(Value::take)
            .ok_or_else(|| missing_key("event"))?;
        let event: Event = serde_json::from_value(payload.clone())?;
        Ok(OperationStatus {
            percentage: event.percentage,
            done: event.action_status.as_deref() == Some("done"),
            payload,
        })
    }
}

/// Takes the payload stored under `key` out of an `OK` response.
pub fn take<T: DeserializeOwned>(body: &mut Value, key: &str) -> Result<T> {
    let value = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| missing_key(key))?;
    Ok(serde_json::from_value(value)?)
}

fn missing_key(key: &str) -> NimbusError {
    NimbusError::Provider(format!("response is missing '{}'", key))
}

/// Checks the top-level status of a response body.
pub fn parse_response(body: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(body)
        .map_err(|_| NimbusError::Provider(format!("unparsable response: {}", body.trim())))?;
    match value.get("status").and_then(Value::as_str) {
        Some("OK") => Ok(value),
        Some("ERROR") => {
            let message = value
                .get("error_message")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(NimbusError::Provider(message.to_string()))
        }
        _ => Err(NimbusError::Provider(format!(
            "unexpected response: {}",
            body.trim()
        ))),
    }
}

/// Checks the transport status, then the body. Any non-2xx response is an error even
/// when its body claims `OK`.
pub fn check_response(status: StatusCode, body: &str) -> Result<Value> {
    if status.is_success() {
        return parse_response(body);
    }
    let message = match parse_response(body) {
        Err(NimbusError::Provider(message)) => message,
        _ => body.trim().to_string(),
    };
    Err(NimbusError::Provider(format!(
        "HTTP {}: {}",
        status.as_u16(),
        message
    )))
}

/// Accepts a number, a numeric string, or null, clamped to 0-100.
fn percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let value = match raw {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(value.clamp(0.0, 100.0) as u8)
}

pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    api_key: String,
}

impl HttpProviderClient {
    pub fn new(client_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: API_URL.to_string(),
            client_id: client_id.into(),
            api_key: api_key.into(),
        }
    }

    /// Reads credentials from the variable store.
    pub fn from_variables(variables: &Variables) -> Result<Self> {
        Ok(Self::new(
            variables.require(CLIENT_ID_VAR)?,
            variables.require(API_KEY_VAR)?,
        ))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn request(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        log::debug!("GET {}/{} {:?}", self.base_url, endpoint, query);
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, endpoint))
            .query(query)
            .query(&[("client_id", &self.client_id), ("api_key", &self.api_key)])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        log::trace!("{} {}", status, body);
        check_response(status, &body)
    }
}
