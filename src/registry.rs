use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use indexmap::IndexMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::MysaApi;
use crate::mysa::{Device, DeviceId, DeviceState, FirmwareInfo, User};

/// How long after a telemetry batch the cloud is assumed to have folded it
/// into the device state.
pub const REFRESH_DELAY: Duration = Duration::from_secs(60);

/// Snapshot of the account's devices, kept current while watching.
#[derive(Debug)]
pub struct Registry {
    pub user: User,
    pub devices: IndexMap<DeviceId, Device>,
    pub states: HashMap<DeviceId, DeviceState>,
    pub firmware: HashMap<DeviceId, FirmwareInfo>,
    pending_refreshes: HashMap<DeviceId, Instant>,
}

impl Registry {
    pub fn new(
        user: User,
        devices: IndexMap<DeviceId, Device>,
        states: HashMap<DeviceId, DeviceState>,
        firmware: HashMap<DeviceId, FirmwareInfo>,
    ) -> Self {
        Self {
            user,
            devices,
            states,
            firmware,
            pending_refreshes: HashMap::new(),
        }
    }

    /// Fetches everything. With a non-empty `selected`, only those devices
    /// are tracked, and each of them must exist.
    pub async fn load(api: &impl MysaApi, selected: &[DeviceId]) -> Result<Self> {
        let user = api.user().await.context("failed to get user")?;
        let mut devices = api.devices().await.context("failed to get devices")?;
        let states = api
            .device_states()
            .await
            .context("failed to get device states")?;
        let firmware = api.firmware().await.context("failed to get firmware")?;

        if !selected.is_empty() {
            let missing: Vec<String> = selected
                .iter()
                .filter(|id| !devices.contains_key(*id))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                bail!(
                    "device ID(s) {} not found in your Mysa account",
                    missing.join(", ")
                );
            }
            devices.retain(|id, _| selected.contains(id));
        }

        info!(devices = devices.len(), "loaded devices");
        Ok(Self::new(user, devices, states, firmware))
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn firmware_version(&self, id: &DeviceId) -> Option<&str> {
        self.firmware
            .get(id)
            .and_then(|f| f.installed_version.as_deref())
    }

    /// Schedules a state refresh for [`REFRESH_DELAY`] after a batch
    /// produced at `batch_timestamp`. Both timestamps are Unix seconds. A
    /// later batch replaces the pending refresh.
    pub fn schedule_refresh(&mut self, id: DeviceId, batch_timestamp: f64, now: f64) {
        let wait = (batch_timestamp + REFRESH_DELAY.as_secs_f64() - now).max(0.0);
        let due = Instant::now() + Duration::from_secs_f64(wait);
        debug!(%id, wait, "scheduled state refresh");
        self.pending_refreshes.insert(id, due);
    }

    pub fn next_refresh_at(&self) -> Option<Instant> {
        self.pending_refreshes.values().min().copied()
    }

    pub fn is_refresh_pending(&self, id: &DeviceId) -> bool {
        self.pending_refreshes.contains_key(id)
    }

    /// Issues every refresh that is due. Markers are cleared whether or not
    /// the fetch succeeds; failures are only logged.
    pub async fn refresh_due(&mut self, api: &impl MysaApi) {
        let now = Instant::now();
        let mut due: Vec<DeviceId> = self
            .pending_refreshes
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort();

        for id in due {
            self.pending_refreshes.remove(&id);
            if let Err(e) = self.refresh(api, id).await {
                warn!(%id, "failed to refresh device state: {e:#}");
            }
        }
    }

    /// Replaces the stored state of `id` with the cloud's current one.
    pub async fn refresh(&mut self, api: &impl MysaApi, id: DeviceId) -> Result<()> {
        match api.device_state(id).await? {
            Some(state) => {
                debug!(%id, fields = state.fields.len(), "refreshed device state");
                self.states.insert(id, state);
            }
            None => {
                self.states.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::api::testing::FakeApi;

    fn id() -> DeviceId {
        "aabbccddeeff".parse().unwrap()
    }

    fn user() -> User {
        serde_json::from_value(json!({"Id": "user-1"})).unwrap()
    }

    fn device() -> Device {
        serde_json::from_value(json!({
            "Id": "aabbccddeeff", "Name": "Living Room", "Model": "BB-V2-0-L",
        }))
        .unwrap()
    }

    fn state(setpoint: i64) -> DeviceState {
        let Value::Object(raw) = json!({"SetPoint": {"v": setpoint, "t": 1_700_000_000}}) else {
            unreachable!()
        };
        DeviceState::from_json(id(), raw).unwrap()
    }

    fn api() -> FakeApi {
        FakeApi {
            user: Some(user()),
            devices: IndexMap::from([(id(), device())]),
            states: HashMap::from([(id(), state(215))]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_unknown_selected_device() {
        let other: DeviceId = "001122334455".parse().unwrap();

        let err = Registry::load(&api(), &[other]).await.unwrap_err();

        assert!(err.to_string().contains("001122334455"));
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_once_delay_after_batch_elapsed() {
        let api = api();
        let mut registry = Registry::new(user(), api.devices.clone(), HashMap::new(), HashMap::new());

        registry.schedule_refresh(id(), 1_700_000_000.0, 1_700_000_010.0);
        let due = registry.next_refresh_at().unwrap();
        assert_eq!(due - Instant::now(), Duration::from_secs(50));

        registry.refresh_due(&api).await;
        assert!(api.state_requests.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(50)).await;
        registry.refresh_due(&api).await;

        assert_eq!(*api.state_requests.lock().unwrap(), vec![id()]);
        assert_eq!(registry.states.get(&id()), Some(&state(215)));
        assert!(registry.next_refresh_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_clears_marker() {
        let api = FakeApi {
            fail_state: true,
            ..api()
        };
        let mut registry = Registry::new(user(), api.devices.clone(), HashMap::new(), HashMap::new());

        registry.schedule_refresh(id(), 0.0, 1_700_000_000.0);
        registry.refresh_due(&api).await;

        assert!(!registry.is_refresh_pending(&id()));
        assert!(registry.states.is_empty());
    }
}
