//! Classification of the JSON envelopes devices and apps publish on the
//! `/v1/dev/{id}/{in,out,batch}` topics.
//!
//! Two protocol generations coexist. Generation 1 envelopes carry a
//! `MsgType`, generation 2 envelopes a `msg` code. Each known shape is
//! checked strictly; anything that does not match is reported as a
//! [`DecodeFailure`] carrying the parsed JSON so it can still be shown.

use anyhow::{Context as _, Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::mysa::DeviceId;

/// `src.type` / `dest.type` of a thermostat.
const DEVICE_ENDPOINT: i64 = 1;
/// `src.type` of an app user.
const USER_ENDPOINT: i64 = 100;
const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subtopic {
    /// Towards the device.
    In,
    /// From the device.
    Out,
    Batch,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Device segment as it appears in the topic; not necessarily a valid
    /// [`DeviceId`].
    pub device: String,
    pub subtopic: Subtopic,
}

impl Topic {
    pub fn parse(topic: &str) -> Option<Self> {
        let mut segments = topic.rsplit('/');
        let subtopic = segments.next()?;
        let device = segments.next()?;

        let subtopic = match subtopic {
            "in" => Subtopic::In,
            "out" => Subtopic::Out,
            "batch" => Subtopic::Batch,
            other => Subtopic::Other(other.to_owned()),
        };

        Some(Topic {
            device: device.to_owned(),
            subtopic,
        })
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device.parse().ok()
    }

    pub fn for_device(device: DeviceId, subtopic: &str) -> String {
        format!("/v1/dev/{device}/{subtopic}")
    }
}

/// Who issued a setpoint command.
#[derive(Debug, Clone, PartialEq)]
pub enum Commander {
    You,
    OtherUser(String),
    Other(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Generation 1, `MsgType` 11 on `in`.
    PublishStatusRequest { rest: Map<String, Value> },
    /// Generation 1, `MsgType` 6 on `in`.
    CheckSettingsRequest { rest: Map<String, Value> },
    /// Generation 1, `MsgType` 4 on `out`.
    Log { level: Value, message: Value },
    /// Generation 1, `MsgType` 0 on `out`.
    LegacyStatus { fields: Map<String, Value> },
    /// Generation 1, `MsgType` 1 on `out`. Meaning unclear.
    StateTransition { fields: Map<String, Value> },
    /// Generation 2, `msg` 40.
    Status { body: Value },
    /// Generation 2, `msg` 44 on `in`.
    Command {
        by: Commander,
        body: Map<String, Value>,
        /// `body.cmd` arrived as a JSON document inside a string.
        stringified_cmd: bool,
    },
    /// Generation 2, `msg` 44 on `out`.
    CommandAck { id: Value, body: Map<String, Value> },
    /// Generation 2, `msg` 3 on `batch`. `readings` is the base64-decoded
    /// blob, see [`crate::telemetry::decode`].
    Batch { id: Value, readings: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpretedMessage {
    /// When the message was produced, in Unix seconds.
    pub timestamp: f64,
    pub message: DeviceMessage,
}

#[derive(Debug, Error)]
pub enum DecodeFailure {
    #[error("payload is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("unrecognized envelope: {reason}")]
    Unrecognized { json: Value, reason: String },
}

impl DecodeFailure {
    pub fn json(&self) -> Option<&Value> {
        match self {
            DecodeFailure::NotJson(_) => None,
            DecodeFailure::Unrecognized { json, .. } => Some(json),
        }
    }
}

/// Classifies one publish payload. `user_id` is the authenticated user,
/// used to attribute commands.
pub fn interpret(
    topic: &Topic,
    payload: &[u8],
    user_id: &str,
) -> Result<InterpretedMessage, DecodeFailure> {
    let json: Value = serde_json::from_slice(payload).map_err(DecodeFailure::NotJson)?;

    classify(topic, &json, user_id).map_err(|e| DecodeFailure::Unrecognized {
        json,
        reason: format!("{e:#}"),
    })
}

fn classify(topic: &Topic, json: &Value, user_id: &str) -> Result<InterpretedMessage> {
    let Value::Object(object) = json else {
        bail!("payload is not an object");
    };

    if object.contains_key("MsgType") {
        classify_gen1(topic, parse(json)?)
    } else if let Some(code) = object.get("msg") {
        let code = code.as_i64().context("msg is not an integer")?;
        classify_gen2(topic, code, json, user_id)
    } else {
        bail!("neither MsgType nor msg present")
    }
}

#[derive(Deserialize)]
struct Gen1Envelope {
    #[serde(rename = "MsgType")]
    msg_type: i64,
    #[serde(rename = "Device")]
    device: String,
    #[serde(rename = "Timestamp")]
    timestamp: f64,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn classify_gen1(topic: &Topic, envelope: Gen1Envelope) -> Result<InterpretedMessage> {
    ensure!(
        envelope.device == topic.device,
        "Device {} does not match topic",
        envelope.device
    );

    let mut rest = envelope.rest;
    let message = match (envelope.msg_type, &topic.subtopic) {
        (11, Subtopic::In) => DeviceMessage::PublishStatusRequest { rest },
        (6, Subtopic::In) => DeviceMessage::CheckSettingsRequest { rest },
        (4, Subtopic::Out) => DeviceMessage::Log {
            level: rest.shift_remove("Level").context("log without Level")?,
            message: rest.shift_remove("Message").context("log without Message")?,
        },
        (0, Subtopic::Out) => {
            let stream = rest.shift_remove("Stream");
            ensure!(stream == Some(json!(1)), "status report with Stream {stream:?}");
            DeviceMessage::LegacyStatus { fields: rest }
        }
        (1, Subtopic::Out) => DeviceMessage::StateTransition { fields: rest },
        (other, subtopic) => bail!("unknown MsgType {other} on {subtopic:?}"),
    };

    Ok(InterpretedMessage {
        timestamp: envelope.timestamp,
        message,
    })
}

#[derive(Deserialize)]
struct StatusEnvelope {
    ver: String,
    src: Value,
    time: f64,
    body: Value,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandEnvelope {
    #[serde(rename = "msg")]
    _msg: i64,
    ver: String,
    id: f64,
    dest: Value,
    resp: i64,
    #[serde(rename = "Timestamp")]
    legacy_timestamp: f64,
    time: f64,
    timestamp: Option<f64>,
    src: Value,
    body: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AckEnvelope {
    #[serde(rename = "msg")]
    _msg: i64,
    ver: String,
    src: Value,
    time: f64,
    resp_id: f64,
    id: Value,
    body: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchEnvelope {
    #[serde(rename = "msg")]
    _msg: i64,
    ver: String,
    src: Value,
    time: f64,
    id: Value,
    body: BatchBody,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchBody {
    readings: String,
}

fn classify_gen2(
    topic: &Topic,
    code: i64,
    json: &Value,
    user_id: &str,
) -> Result<InterpretedMessage> {
    let device = endpoint(&topic.device, DEVICE_ENDPOINT);

    let (timestamp, message) = match (code, &topic.subtopic) {
        (40, _) => {
            let e: StatusEnvelope = parse(json)?;
            ensure!(e.ver == PROTOCOL_VERSION, "unexpected ver {}", e.ver);
            ensure!(e.src == device, "src {} is not the device", e.src);
            (e.time, DeviceMessage::Status { body: e.body })
        }
        (44, Subtopic::In) => {
            let e: CommandEnvelope = parse(json)?;
            let ts = e.id / 1000.0;
            let whole = ts.trunc();
            ensure!(e.ver == PROTOCOL_VERSION, "unexpected ver {}", e.ver);
            ensure!(e.dest == device, "dest {} is not the device", e.dest);
            ensure!(e.resp == 2, "unexpected resp {}", e.resp);
            // Timestamp is sometimes one second off.
            ensure!(
                (e.legacy_timestamp - whole).abs() <= 1.0,
                "Timestamp {} too far from id",
                e.legacy_timestamp
            );
            ensure!(e.time == whole, "time {} does not match id", e.time);
            if let Some(t) = e.timestamp {
                ensure!(t == whole, "timestamp {t} does not match id");
            }

            let mut body = e.body;
            let ver = body.shift_remove("ver").unwrap_or(Value::Null);
            ensure!(truthy(&ver), "body.ver is {ver}");
            let cmd = body.get("cmd").context("command without body.cmd")?;
            let stringified_cmd = cmd.is_string();

            let by = if e.src == endpoint(user_id, USER_ENDPOINT) {
                Commander::You
            } else if e.src.get("type").and_then(Value::as_i64) == Some(USER_ENDPOINT) {
                let reference = e.src.get("ref").map_or_else(String::new, plain);
                Commander::OtherUser(reference)
            } else {
                Commander::Other(e.src)
            };

            (
                ts,
                DeviceMessage::Command {
                    by,
                    body,
                    stringified_cmd,
                },
            )
        }
        (44, Subtopic::Out) => {
            let e: AckEnvelope = parse(json)?;
            ensure!(e.ver == PROTOCOL_VERSION, "unexpected ver {}", e.ver);
            ensure!(e.src == device, "src {} is not the device", e.src);
            ensure!(
                (e.time - e.resp_id / 1000.0).abs() <= 5.0,
                "acknowledgment {}s after command",
                e.time - e.resp_id / 1000.0
            );
            let mut body = e.body;
            let success = body.shift_remove("success");
            ensure!(success == Some(json!(1)), "body.success is {success:?}");
            (e.time, DeviceMessage::CommandAck { id: e.id, body })
        }
        (3, Subtopic::Batch) => {
            let e: BatchEnvelope = parse(json)?;
            ensure!(e.ver == PROTOCOL_VERSION, "unexpected ver {}", e.ver);
            ensure!(e.src == device, "src {} is not the device", e.src);
            let readings = STANDARD
                .decode(&e.body.readings)
                .context("readings are not base64")?;
            (e.time, DeviceMessage::Batch { id: e.id, readings })
        }
        (other, subtopic) => bail!("unknown msg {other} on {subtopic:?}"),
    };

    Ok(InterpretedMessage { timestamp, message })
}

fn parse<T: DeserializeOwned>(json: &Value) -> Result<T> {
    T::deserialize(json).context("envelope does not match the expected shape")
}

fn endpoint(reference: &str, kind: i64) -> Value {
    json!({"ref": reference, "type": kind})
}

/// Renders strings without quotes, anything else as JSON.
pub fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "aabbccddeeff";
    const USER: &str = "user-1";

    fn topic(subtopic: &str) -> Topic {
        Topic::parse(&format!("/v1/dev/{DEVICE}/{subtopic}")).unwrap()
    }

    fn run(subtopic: &str, payload: Value) -> Result<InterpretedMessage, DecodeFailure> {
        interpret(&topic(subtopic), payload.to_string().as_bytes(), USER)
    }

    fn command(src: Value, dest: &str) -> Value {
        json!({
            "msg": 44,
            "ver": "1.0",
            "id": 1_700_000_000_123u64,
            "dest": {"ref": dest, "type": 1},
            "resp": 2,
            "Timestamp": 1_699_999_999,
            "time": 1_700_000_000,
            "timestamp": 1_700_000_000,
            "src": src,
            "body": {"ver": 1, "type": 5, "cmd": [{"sp": 21, "tm": -1}]},
        })
    }

    #[test]
    fn parses_topics() {
        let t = topic("batch");

        assert_eq!(t.subtopic, Subtopic::Batch);
        assert_eq!(t.device_id(), Some(DEVICE.parse().unwrap()));
        assert_eq!(
            Topic::parse("/v1/dev/x/weird").unwrap().subtopic,
            Subtopic::Other("weird".into())
        );
        assert!(Topic::parse("nothing").is_none());
    }

    #[test]
    fn attributes_commands() {
        let mine = run("in", command(json!({"ref": USER, "type": 100}), DEVICE)).unwrap();
        let theirs = run("in", command(json!({"ref": "user-2", "type": 100}), DEVICE)).unwrap();

        assert_eq!(mine.timestamp, 1_700_000_000.123);
        let DeviceMessage::Command { by, body, stringified_cmd } = mine.message else {
            panic!("expected a command");
        };
        assert_eq!(by, Commander::You);
        assert!(!body.contains_key("ver"));
        assert!(!stringified_cmd);
        assert!(matches!(
            theirs.message,
            DeviceMessage::Command { by: Commander::OtherUser(ref r), .. } if r == "user-2"
        ));
    }

    #[test]
    fn flags_stringified_commands() {
        let mut payload = command(json!({"ref": USER, "type": 100}), DEVICE);
        payload["body"]["cmd"] = json!("[{\"sp\": 21}]");

        let interpreted = run("in", payload).unwrap();

        assert!(matches!(
            interpreted.message,
            DeviceMessage::Command { stringified_cmd: true, .. }
        ));
    }

    #[test]
    fn command_for_another_device_is_unrecognized() {
        let payload = command(json!({"ref": USER, "type": 100}), "001122334455");

        let failure = run("in", payload.clone()).unwrap_err();

        assert!(matches!(&failure, DecodeFailure::Unrecognized { .. }));
        assert_eq!(failure.json(), Some(&payload));
    }

    #[test]
    fn command_with_extra_keys_is_unrecognized() {
        let mut payload = command(json!({"ref": USER, "type": 100}), DEVICE);
        payload["extra"] = json!(true);

        assert!(run("in", payload).is_err());
    }

    #[test]
    fn legacy_status_requires_stream_one() {
        let payload = |stream| {
            json!({"MsgType": 0, "Device": DEVICE, "Timestamp": 1_700_000_000, "Stream": stream, "SetPoint": 20})
        };

        let ok = run("out", payload(1)).unwrap();
        let failure = run("out", payload(2)).unwrap_err();

        assert!(matches!(
            ok.message,
            DeviceMessage::LegacyStatus { ref fields } if !fields.contains_key("Stream")
        ));
        assert!(matches!(failure, DecodeFailure::Unrecognized { .. }));
    }

    #[test]
    fn decodes_device_log() {
        let interpreted = run(
            "out",
            json!({"MsgType": 4, "Device": DEVICE, "Timestamp": 1_700_000_000, "Level": "INFO", "Message": "boot"}),
        )
        .unwrap();

        assert_eq!(
            interpreted.message,
            DeviceMessage::Log {
                level: json!("INFO"),
                message: json!("boot"),
            }
        );
    }

    #[test]
    fn acknowledgment_strips_success() {
        let interpreted = run(
            "out",
            json!({
                "msg": 44, "ver": "1.0", "src": {"ref": DEVICE, "type": 1},
                "time": 1_700_000_002, "resp_id": 1_700_000_000_123u64, "id": 7,
                "body": {"success": 1, "state": {"sp": 21}},
            }),
        )
        .unwrap();

        let DeviceMessage::CommandAck { id, body } = interpreted.message else {
            panic!("expected an acknowledgment");
        };
        assert_eq!(id, json!(7));
        assert_eq!(Value::Object(body), json!({"state": {"sp": 21}}));
    }

    #[test]
    fn late_acknowledgment_is_unrecognized() {
        let ack = |time: u64| {
            json!({
                "msg": 44, "ver": "1.0", "src": {"ref": DEVICE, "type": 1},
                "time": time, "resp_id": 1_700_000_000_000u64, "id": 7,
                "body": {"success": 1},
            })
        };

        assert!(run("out", ack(1_700_000_005)).is_ok());
        assert!(matches!(
            run("out", ack(1_700_000_006)),
            Err(DecodeFailure::Unrecognized { .. })
        ));
    }

    #[test]
    fn legacy_message_for_another_device_is_unrecognized() {
        let payload = json!({
            "MsgType": 4, "Device": "001122334455", "Timestamp": 1_700_000_000,
            "Level": "INFO", "Message": "boot",
        });

        assert!(matches!(
            run("out", payload),
            Err(DecodeFailure::Unrecognized { .. })
        ));
    }

    #[test]
    fn status_from_another_source_is_unrecognized() {
        let status = |src: Value| {
            json!({"msg": 40, "ver": "1.0", "src": src, "time": 1_700_000_000, "body": {"sp": 20}})
        };

        assert!(run("out", status(json!({"ref": DEVICE, "type": 1}))).is_ok());
        assert!(matches!(
            run("out", status(json!({"ref": "001122334455", "type": 1}))),
            Err(DecodeFailure::Unrecognized { .. })
        ));
        assert!(matches!(
            run("out", status(json!({"ref": USER, "type": 100}))),
            Err(DecodeFailure::Unrecognized { .. })
        ));
    }

    #[test]
    fn batch_with_extra_body_keys_is_unrecognized() {
        let payload = json!({
            "msg": 3, "ver": "1.0", "src": {"ref": DEVICE, "type": 1},
            "time": 1_700_000_000, "id": 1,
            "body": {"readings": "yqAD", "count": 1},
        });

        assert!(matches!(
            run("batch", payload),
            Err(DecodeFailure::Unrecognized { .. })
        ));
    }

    #[test]
    fn decodes_batch_readings() {
        let interpreted = run(
            "batch",
            json!({
                "msg": 3, "ver": "1.0", "src": {"ref": DEVICE, "type": 1},
                "time": 1_700_000_000, "id": 1,
                "body": {"readings": "yqAD"},
            }),
        )
        .unwrap();

        assert_eq!(interpreted.timestamp, 1_700_000_000.0);
        assert!(matches!(
            interpreted.message,
            DeviceMessage::Batch { ref readings, .. } if readings == &[0xca, 0xa0, 0x03]
        ));
    }

    #[test]
    fn non_json_payload_fails() {
        let failure = interpret(&topic("out"), b"\x00\x01", USER).unwrap_err();

        assert!(matches!(failure, DecodeFailure::NotJson(_)));
        assert_eq!(failure.json(), None);
    }
}
