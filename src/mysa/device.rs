use std::fmt;
use std::str::FromStr;

use anyhow::{Error, bail};
use chrono_tz::Tz;
use macaddr::MacAddr6;
use serde::Deserialize;

use crate::mysa::DeviceModel;

/// Device identifier: the thermostat's WiFi MAC address, written by the
/// cloud as 12 lower-case hex digits without separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct DeviceId(MacAddr6);

impl DeviceId {
    /// Colon-separated, upper-case form used in human-readable output.
    pub fn display_mac(&self) -> String {
        self.0
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid device id: expected 12 hex digits, got {s:?}");
        }

        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)?;
        }

        Ok(DeviceId(MacAddr6::from(bytes)))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureFormat {
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    #[serde(rename = "Id")]
    pub id: DeviceId,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Model")]
    pub model: String,

    #[serde(rename = "Format", default = "default_format")]
    pub format: TemperatureFormat,

    #[serde(rename = "TimeZone", default = "default_timezone")]
    pub timezone: Tz,
}

fn default_format() -> TemperatureFormat {
    TemperatureFormat::Celsius
}

fn default_timezone() -> Tz {
    Tz::UTC
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirmwareInfo {
    #[serde(rename = "InstalledVersion")]
    pub installed_version: Option<String>,
}

impl Device {
    pub fn model(&self) -> Option<DeviceModel> {
        self.model.parse().ok()
    }

    pub fn is_lite(&self) -> bool {
        self.model() == Some(DeviceModel::BaseboardV2Lite)
    }
}
