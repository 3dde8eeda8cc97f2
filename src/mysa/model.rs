use std::str::FromStr;

use anyhow::{Error, bail};

/// Hardware models this crate knows something specific about. Other model
/// strings reported by the cloud are carried as plain text on [`Device`].
///
/// [`Device`]: crate::mysa::Device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    BaseboardV1,
    BaseboardV2,
    BaseboardV2Lite,
}

impl DeviceModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceModel::BaseboardV1 => "BB-V1-1",
            DeviceModel::BaseboardV2 => "BB-V2-0",
            DeviceModel::BaseboardV2Lite => "BB-V2-0-L",
        }
    }

    /// Value of `body.type` in setpoint commands the apps send for this model.
    pub fn command_type(&self) -> u64 {
        match self {
            DeviceModel::BaseboardV1 => 1,
            DeviceModel::BaseboardV2 | DeviceModel::BaseboardV2Lite => 5,
        }
    }
}

impl FromStr for DeviceModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BB-V1-1" => Ok(DeviceModel::BaseboardV1),
            "BB-V2-0" => Ok(DeviceModel::BaseboardV2),
            "BB-V2-0-L" => Ok(DeviceModel::BaseboardV2Lite),
            _ => bail!("unknown device model: {}", s),
        }
    }
}
