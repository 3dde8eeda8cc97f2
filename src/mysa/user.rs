use std::collections::HashMap;

use serde::Deserialize;

use crate::mysa::DeviceId;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "DevicesPaired", default)]
    pub devices_paired: DevicesPaired,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesPaired {
    #[serde(rename = "State", default)]
    pub state: PairedState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairedState {
    #[serde(rename = "BB", default)]
    pub baseboards: HashMap<DeviceId, PairedDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairedDevice {
    #[serde(rename = "deviceType")]
    pub device_type: String,
}

impl User {
    /// Hardware models as paired, unaffected by model overrides on `/devices`.
    pub fn real_models(&self) -> impl Iterator<Item = (DeviceId, &str)> {
        self.devices_paired
            .state
            .baseboards
            .iter()
            .map(|(id, d)| (*id, d.device_type.as_str()))
    }
}
