use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use crate::mysa::DeviceId;

/// Timestamps above this are in milliseconds rather than seconds.
pub const MILLISECONDS_THRESHOLD: f64 = (1000u64 << 30) as f64;

pub fn normalize_timestamp(t: f64) -> f64 {
    if t > MILLISECONDS_THRESHOLD { t / 1000.0 } else { t }
}

/// Current wall-clock time in Unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// A single state value, with the cloud's `-1` sentinel already mapped to
/// [`Reading::Missing`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Missing,
    Number(Number),
    Text(String),
    Other(Value),
}

impl Reading {
    fn from_json(v: Value) -> Self {
        match v {
            Value::Null => Reading::Missing,
            Value::Number(n) if n.as_f64() == Some(-1.0) => Reading::Missing,
            Value::Number(n) => Reading::Number(n),
            Value::String(s) => Reading::Text(s),
            other => Reading::Other(other),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Reading::Missing)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Missing => f.write_str("None"),
            Reading::Number(n) => write!(f, "{n}"),
            Reading::Text(s) => f.write_str(s),
            Reading::Other(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bare(Reading),
    Timed(Reading, f64),
}

impl FieldValue {
    pub fn reading(&self) -> &Reading {
        match self {
            FieldValue::Bare(r) | FieldValue::Timed(r, _) => r,
        }
    }

    pub fn timestamp(&self) -> Option<f64> {
        match self {
            FieldValue::Bare(_) => None,
            FieldValue::Timed(_, t) => Some(*t),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawField {
    Timed { v: Value, t: Option<f64> },
    Bare(Value),
}

impl From<RawField> for FieldValue {
    fn from(raw: RawField) -> Self {
        match raw {
            RawField::Timed { v, t: Some(t) } => {
                FieldValue::Timed(Reading::from_json(v), normalize_timestamp(t))
            }
            RawField::Timed { v, t: None } | RawField::Bare(v) => {
                FieldValue::Bare(Reading::from_json(v))
            }
        }
    }
}

/// Latest known metrics of one device, keyed (and therefore sorted) by
/// metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub fields: BTreeMap<String, FieldValue>,
}

impl DeviceState {
    pub fn from_json(device_id: DeviceId, mut raw: Map<String, Value>) -> Result<Self> {
        if let Some(owner) = raw.remove("Device") {
            let owner: DeviceId = serde_json::from_value(owner)
                .context("failed to parse Device field of device state")?;
            if owner != device_id {
                bail!("device state for {device_id} claims to belong to {owner}");
            }
        }

        let fields = raw
            .into_iter()
            .map(|(k, v)| {
                let raw: RawField = serde_json::from_value(v)
                    .with_context(|| format!("failed to parse state field {k}"))?;
                Ok((k, raw.into()))
            })
            .collect::<Result<_>>()?;

        Ok(DeviceState { fields })
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Oldest and newest field timestamps, if any field carries one.
    pub fn update_span(&self) -> Option<(f64, f64)> {
        self.fields
            .values()
            .filter_map(FieldValue::timestamp)
            .fold(None, |span, t| match span {
                None => Some((t, t)),
                Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn device_id() -> DeviceId {
        "aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn normalizes_millisecond_timestamps() {
        assert_eq!(normalize_timestamp(1_700_000_000.0), 1_700_000_000.0);
        assert_eq!(normalize_timestamp(1_700_000_000_000.0), 1_700_000_000.0);
        assert_eq!(normalize_timestamp(1_700_000_000_500.0), 1_700_000_000.5);
    }

    #[test]
    fn normalization_is_idempotent() {
        for t in [0.0, 1.0, 1_073_741_824.0, 1_700_000_000.0, 1_700_000_000_123.0] {
            let once = normalize_timestamp(t);
            assert_eq!(normalize_timestamp(once), once);
        }
    }

    #[test]
    fn parses_bare_and_timed_fields() {
        let raw = json!({
            "Device": "aabbccddeeff",
            "SensorTemp": {"v": 215, "t": 1_700_000_000},
            "SetPoint": {"v": 200, "t": 1_700_000_100_000u64},
            "Lock": 0,
            "Rssi": -1,
            "Name": "x",
        });
        let Value::Object(raw) = raw else { unreachable!() };

        let state = DeviceState::from_json(device_id(), raw).unwrap();

        assert!(!state.fields.contains_key("Device"));
        assert_eq!(
            state.get("SetPoint").unwrap().timestamp(),
            Some(1_700_000_100.0)
        );
        assert_eq!(state.get("SensorTemp").unwrap().reading().as_f64(), Some(215.0));
        assert!(matches!(state.get("Lock"), Some(FieldValue::Bare(_))));
        assert!(state.get("Rssi").unwrap().reading().is_missing());
        assert_eq!(state.update_span(), Some((1_700_000_000.0, 1_700_000_100.0)));
    }

    #[test]
    fn rejects_state_of_another_device() {
        let Value::Object(raw) = json!({"Device": "001122334455"}) else { unreachable!() };

        assert!(DeviceState::from_json(device_id(), raw).is_err());
    }
}
