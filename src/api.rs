use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::mysa::{Device, DeviceId, DeviceModel, DeviceState, FirmwareInfo, User};

pub const OFFICIAL_USER_AGENT: &str = "okhttp/4.11.0";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_agent: String,
}

impl ApiConfig {
    pub fn mysa() -> Self {
        Self {
            base_url: "https://app-prod.mysa.cloud".to_owned(),
            user_agent: OFFICIAL_USER_AGENT.to_owned(),
        }
    }
}

/// The REST calls the rest of the crate depends on.
pub trait MysaApi {
    fn user(&self) -> impl Future<Output = Result<User>> + Send;

    fn devices(&self) -> impl Future<Output = Result<IndexMap<DeviceId, Device>>> + Send;

    fn device_states(&self) -> impl Future<Output = Result<HashMap<DeviceId, DeviceState>>> + Send;

    /// Current state of one device, `None` when the cloud has none.
    fn device_state(
        &self,
        id: DeviceId,
    ) -> impl Future<Output = Result<Option<DeviceState>>> + Send;

    fn firmware(&self) -> impl Future<Output = Result<HashMap<DeviceId, FirmwareInfo>>> + Send;

    /// Overrides the model the cloud reports for a device.
    fn set_model(
        &self,
        id: DeviceId,
        model: DeviceModel,
        max_current: Option<f64>,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct MysaClient {
    client: Client,
    base_url: String,
}

impl MysaClient {
    /// The cloud wants the raw ID token in `authorization`, without the
    /// usual `Bearer` prefix.
    pub fn new(config: &ApiConfig, id_token: &str) -> Result<Self> {
        let mut authorization =
            HeaderValue::from_str(id_token).context("ID token is not a valid header value")?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Fetches `path` and returns the response body as JSON.
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "GET");

        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to send GET {path}"))?
            .error_for_status()
            .with_context(|| format!("GET {path} failed"))?
            .json()
            .await
            .with_context(|| format!("failed to read GET {path} response"))
    }

    async fn get_field<T: DeserializeOwned>(&self, path: &str, field: &str) -> Result<T> {
        let mut body = self.get_json(path).await?;
        let value = body
            .get_mut(field)
            .map(Value::take)
            .with_context(|| format!("GET {path} response has no {field}"))?;
        serde_json::from_value(value).with_context(|| format!("failed to parse {field}"))
    }
}

impl MysaApi for MysaClient {
    async fn user(&self) -> Result<User> {
        self.get_field("/users", "User").await
    }

    async fn devices(&self) -> Result<IndexMap<DeviceId, Device>> {
        self.get_field("/devices", "DevicesObj").await
    }

    async fn device_states(&self) -> Result<HashMap<DeviceId, DeviceState>> {
        let raw: HashMap<DeviceId, Map<String, Value>> =
            self.get_field("/devices/state", "DeviceStatesObj").await?;

        raw.into_iter()
            .map(|(id, state)| Ok((id, DeviceState::from_json(id, state)?)))
            .collect()
    }

    async fn device_state(&self, id: DeviceId) -> Result<Option<DeviceState>> {
        let body = self.get_json(&format!("/devices/state/{id}")).await?;
        single_device_state(id, body)
    }

    async fn firmware(&self) -> Result<HashMap<DeviceId, FirmwareInfo>> {
        self.get_field("/devices/firmware", "Firmware").await
    }

    async fn set_model(
        &self,
        id: DeviceId,
        model: DeviceModel,
        max_current: Option<f64>,
    ) -> Result<()> {
        let mut body = json!({ "Model": model.as_str() });
        if let Some(current) = max_current {
            body["MaxCurrent"] = json!(current);
        }

        let url = format!("{}/devices/{id}", self.base_url);
        debug!(%url, %body, "POST");

        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to send POST /devices/{id}"))?
            .error_for_status()
            .with_context(|| format!("failed to set model of {id} to {}", model.as_str()))?;

        Ok(())
    }
}

impl<A: MysaApi + Send + Sync> MysaApi for Arc<A> {
    fn user(&self) -> impl Future<Output = Result<User>> + Send {
        (**self).user()
    }

    fn devices(&self) -> impl Future<Output = Result<IndexMap<DeviceId, Device>>> + Send {
        (**self).devices()
    }

    fn device_states(
        &self,
    ) -> impl Future<Output = Result<HashMap<DeviceId, DeviceState>>> + Send {
        (**self).device_states()
    }

    fn device_state(
        &self,
        id: DeviceId,
    ) -> impl Future<Output = Result<Option<DeviceState>>> + Send {
        (**self).device_state(id)
    }

    fn firmware(&self) -> impl Future<Output = Result<HashMap<DeviceId, FirmwareInfo>>> + Send {
        (**self).firmware()
    }

    fn set_model(
        &self,
        id: DeviceId,
        model: DeviceModel,
        max_current: Option<f64>,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).set_model(id, model, max_current)
    }
}

/// `/devices/state/{id}` has been seen both wrapped like the bulk endpoint
/// and as the bare state object.
fn single_device_state(id: DeviceId, body: Value) -> Result<Option<DeviceState>> {
    let mut value = match body {
        Value::Object(mut o) if o.contains_key("DeviceStatesObj") => {
            o.shift_remove("DeviceStatesObj").unwrap_or(Value::Null)
        }
        other => other,
    };

    let key = id.to_string();
    if let Some(inner) = value.get_mut(&key).map(Value::take) {
        value = inner;
    }

    match value {
        Value::Object(o) if o.is_empty() => Ok(None),
        Value::Object(o) => DeviceState::from_json(id, o).map(Some),
        Value::Null => Ok(None),
        other => anyhow::bail!("unexpected state for {id}: {other}"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DeviceId {
        "aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn keeps_device_order() {
        let body = json!({
            "ffeeddccbbaa": {
                "Id": "ffeeddccbbaa", "Name": "Office", "Model": "BB-V1-1",
                "Format": "celsius", "TimeZone": "America/Toronto",
            },
            "aabbccddeeff": {
                "Id": "aabbccddeeff", "Name": "Living Room", "Model": "BB-V2-0-L",
                "Format": "fahrenheit", "TimeZone": "America/Vancouver",
            },
        });

        let devices: IndexMap<DeviceId, Device> = serde_json::from_value(body).unwrap();

        let names: Vec<&str> = devices.values().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Office", "Living Room"]);
        assert_eq!(devices.get_index_of(&id()), Some(1));
    }

    #[test]
    fn accepts_wrapped_single_state() {
        let body = json!({"DeviceStatesObj": {"aabbccddeeff": {"Device": "aabbccddeeff", "Lock": 1}}});

        let state = single_device_state(id(), body).unwrap().unwrap();

        assert!(state.get("Lock").is_some());
    }

    #[test]
    fn accepts_bare_single_state() {
        let body = json!({"Device": "aabbccddeeff", "SetPoint": {"v": 200, "t": 1}});

        let state = single_device_state(id(), body).unwrap().unwrap();

        assert!(state.get("SetPoint").is_some());
        assert!(single_device_state(id(), json!({})).unwrap().is_none());
    }
}
