//! Human-readable output: the per-device status report and the log of
//! real-time messages.

use std::fmt::Write as _;

use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::message::{
    Commander, DecodeFailure, DeviceMessage, InterpretedMessage, Subtopic, Topic, plain,
};
use crate::mqtt::{Publish, QoS};
use crate::mysa::{Device, DeviceState, Reading, TemperatureFormat};
use crate::telemetry::{self, BinaryReading, MalformedTelemetry};

const TEMPERATURE_FIELDS: [&str; 4] = ["SensorTemp", "CorrectedTemp", "SetPoint", "HeatSink"];
const NO_CURRENT_SENSOR: &str = "DEVICE HAS NO CURRENT SENSOR";
const UNDOCUMENTED: &str = "UNDOCUMENTED FOR THIS DEVICE, MAY BE WRONG";

fn datetime(timestamp: f64, tz: Tz) -> String {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    match DateTime::from_timestamp(secs as i64, nanos) {
        Some(t) => t
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S%:z")
            .to_string(),
        None => format!("{timestamp}"),
    }
}

fn device_line(device: &Device, firmware: Option<&str>) -> String {
    format!(
        "{} (model {:?}, mac {}, firmware {})",
        device.name,
        device.model,
        device.id.display_mac(),
        firmware.unwrap_or("unknown")
    )
}

/// Rounds to two significant digits. Fixed notation keeps at least one
/// decimal and is used below 10; anything larger is written as `1.2e+01`.
fn two_significant(v: f64) -> String {
    if v == 0.0 {
        return "0.0".to_owned();
    }
    let sci = format!("{v:.1e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);

    if (-4..1).contains(&exp) {
        let fixed = format!("{v:.*}", (1 - exp) as usize);
        let trimmed = fixed.trim_end_matches('0');
        if trimmed.ends_with('.') {
            format!("{trimmed}0")
        } else {
            trimmed.to_owned()
        }
    } else {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    }
}

/// Formats one state field the way the apps would show it.
pub fn format_field(device: &Device, name: &str, reading: &Reading) -> String {
    let lite = device.is_lite();
    let Some(v) = reading.as_f64() else {
        return reading.to_string();
    };

    match name {
        n if TEMPERATURE_FIELDS.contains(&n) => {
            let celsius = v / 10.0;
            match device.format {
                TemperatureFormat::Celsius => format!("{celsius:.1}°C"),
                TemperatureFormat::Fahrenheit => format!("{:.1}°F", 32.0 + celsius * 9.0 / 5.0),
            }
        }
        "Timestamp" => datetime(v, device.timezone),
        "Current" if lite && v == 0.0 => format!("None ({NO_CURRENT_SENSOR})"),
        "Current" if lite => format!("{} A ({UNDOCUMENTED})", two_significant(v)),
        "Current" => format!("{} A (HIGHEST CURRENT SEEN)", two_significant(v)),
        "Duty" if lite && (v == 0.0 || v == 1.0) => {
            let on_off = if v == 1.0 { "On" } else { "Off" };
            format!("{on_off:4} ({NO_CURRENT_SENSOR})")
        }
        "Duty" => format!("{:.0}% (OF HIGHEST CURRENT)", v * 100.0),
        "Brightness" => format!("{reading}%"),
        "Voltage" => format!("{reading} V"),
        "Rssi" if v == 0.0 => reading.to_string(),
        "Rssi" => format!("{reading} dBm"),
        "Lock" if v == 0.0 || v == 1.0 => (v == 1.0).to_string(),
        "Humidity" if lite => format!("{reading}% ({UNDOCUMENTED})"),
        "Humidity" => format!("{reading}%"),
        _ => reading.to_string(),
    }
}

/// Status block printed at startup for one device.
pub fn status_report(device: &Device, firmware: Option<&str>, state: Option<&DeviceState>) -> String {
    let mut out = format!("{}:\n", device_line(device, firmware));

    let Some(state) = state else {
        out.push_str("  No state found!\n");
        return out;
    };

    let width = state.fields.keys().map(String::len).max().unwrap_or(0) + 1;
    for (name, value) in &state.fields {
        let label = format!("{name}:");
        let _ = writeln!(
            out,
            "  {label:width$} {}",
            format_field(device, name, value.reading())
        );
    }

    if let Some((oldest, newest)) = state.update_span() {
        let _ = writeln!(
            out,
            "  Last updates between {} - {}",
            datetime(oldest, device.timezone),
            datetime(newest, device.timezone)
        );
    }

    out
}

/// First line logged for a publish: direction, device and delivery flags.
pub fn publish_header(
    publish: &Publish,
    topic: Option<&Topic>,
    device: Option<(&Device, Option<&str>)>,
) -> String {
    let arrow = match topic.map(|t| &t.subtopic) {
        Some(Subtopic::In) => "TO   ==>".to_owned(),
        Some(Subtopic::Out | Subtopic::Batch) => "FROM <==".to_owned(),
        Some(Subtopic::Other(s)) => format!("?{s}?"),
        None => "?".to_owned(),
    };

    let mut deets = String::new();
    if publish.qos != QoS::AtMostOnce {
        let _ = write!(deets, " QOS={}", publish.qos as u8);
    }
    if publish.retain {
        deets.push_str(" +retain");
    }
    if publish.dup {
        deets.push_str(" +dup");
    }

    match device {
        Some((device, firmware)) => format!(
            "{arrow} {}{deets} (model {:?}, mac {}, firmware {}):",
            device.name,
            device.model,
            device.id.display_mac(),
            firmware.unwrap_or("unknown")
        ),
        None => {
            let id = topic.map_or("?", |t| t.device.as_str());
            format!("{arrow} Unknown device {id} (topic {})", publish.topic)
        }
    }
}

/// Second part of a publish log entry. `now` is the current Unix time,
/// used for the age annotation.
pub fn message_body(
    result: &Result<InterpretedMessage, DecodeFailure>,
    payload: &[u8],
    tz: Tz,
    now: f64,
) -> String {
    match result {
        Ok(m) => format!(
            "  [{:.1}s ago] {}",
            now - m.timestamp,
            describe(&m.message, tz)
        ),
        Err(DecodeFailure::Unrecognized { json, .. }) => format!("  {json}"),
        Err(DecodeFailure::NotJson(_)) => format!("  {}", payload.escape_ascii()),
    }
}

fn json(m: &Map<String, Value>) -> String {
    Value::Object(m.clone()).to_string()
}

pub fn describe(message: &DeviceMessage, tz: Tz) -> String {
    match message {
        DeviceMessage::PublishStatusRequest { rest } => {
            format!("App telling device to publish its status ({})", json(rest))
        }
        DeviceMessage::CheckSettingsRequest { rest } => {
            format!("App telling device to check its settings ({})", json(rest))
        }
        DeviceMessage::Log { level, message } => {
            format!("Device log [{}] {}", plain(level), plain(message))
        }
        DeviceMessage::LegacyStatus { fields } => {
            format!("Device (gen 1) reporting its status: {}", json(fields))
        }
        DeviceMessage::StateTransition { fields } => {
            format!("Unclear prev/next message from device: {}", json(fields))
        }
        DeviceMessage::Status { body } => {
            format!("Device (gen 2) reporting its status: {body}")
        }
        DeviceMessage::Command {
            by,
            body,
            stringified_cmd,
        } => {
            let by = match by {
                Commander::You => "You".to_owned(),
                Commander::OtherUser(r) => format!("Other user {r}"),
                Commander::Other(src) => src.to_string(),
            };
            let weird = if *stringified_cmd {
                " (derpy stringified cmd)"
            } else {
                ""
            };
            format!("{by} commanding device{weird}: {}", json(body))
        }
        DeviceMessage::CommandAck { id, body } => format!(
            "Device responding to app command: {} (id={})",
            json(body),
            plain(id)
        ),
        DeviceMessage::Batch { readings, .. } => readings_report(readings, tz),
    }
}

/// Decoded telemetry, one line per record, or a hex dump when the blob is
/// in a format the decoder does not know or breaks off partway.
pub fn readings_report(readings: &[u8], tz: Tz) -> String {
    match telemetry::decode(readings) {
        Ok(records) => {
            let version = records.first().map_or(0, |r| r.version);
            let mut out = format!("Raw readings (v{version}):");
            for r in &records {
                let _ = write!(out, "\n  {}", reading_line(r, tz));
            }
            out
        }
        Err(MalformedTelemetry::MissingMagic { .. }) => hex_dump(readings),
        Err(e) => dump_rows(
            format!(
                "Malformed device readings ({e}) of length 0x{:04x}:",
                readings.len()
            ),
            readings,
        ),
    }
}

fn reading_line(r: &BinaryReading, tz: Tz) -> String {
    let unit = |v: Option<i32>, raw: i16| match v {
        Some(ms) => format!("{ms}ms"),
        None => format!("{raw}?"),
    };

    format!(
        "{}: sens={:.1}°C, amb={:.1}°C, setp={:.1}°C, hum={}%, dty={}%, on?={}, off?={}, heatsink={:.1}°C, flags?={:04x}, {}",
        datetime(r.started_at as f64, tz),
        r.sensor_celsius(),
        r.ambient_celsius(),
        r.setpoint_celsius(),
        r.humidity_percent,
        r.duty_percent,
        unit(r.on_millis(), r.on_duration),
        unit(r.off_millis(), r.off_duration),
        r.heatsink_celsius(),
        r.flags,
        r.trailer
    )
}

/// Sixteen bytes per row, split into two groups of eight counted from the
/// end of the row.
pub fn hex_dump(bytes: &[u8]) -> String {
    dump_rows(
        format!("Unknown-format device readings of length 0x{:04x}:", bytes.len()),
        bytes,
    )
}

fn dump_rows(mut out: String, bytes: &[u8]) -> String {
    for (i, row) in bytes.chunks(16).enumerate() {
        let split = row.len().saturating_sub(8);
        let groups: Vec<String> = [&row[..split], &row[split..]]
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(hex::encode)
            .collect();
        let _ = write!(out, "\n  {:04x}  {}", i * 16, groups.join(" "));
    }
    out
}
