use std::future::Future;
use std::io::Write;

use anyhow::{Context as _, Result};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::api::MysaApi;
use crate::message::{DeviceMessage, Topic, interpret};
use crate::mqtt::{Publish, Session, SessionEvent, Transport};
use crate::mysa::unix_now;
use crate::registry::Registry;
use crate::render;

/// Logs every publish until `interrupt` completes or the session fails.
/// The session is closed on the way out either way.
pub async fn watch<T: Transport>(
    session: &mut Session<T>,
    registry: &mut Registry,
    api: &impl MysaApi,
    out: &mut impl Write,
    interrupt: impl Future<Output = ()>,
) -> Result<()> {
    let result = watch_loop(session, registry, api, out, interrupt).await;
    session.close().await;
    result
}

async fn watch_loop<T: Transport>(
    session: &mut Session<T>,
    registry: &mut Registry,
    api: &impl MysaApi,
    out: &mut impl Write,
    interrupt: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(interrupt);

    loop {
        let wake_at = registry.next_refresh_at();
        let event = tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted");
                return Ok(());
            }
            event = session.next_event(wake_at) => event.context("MQTT session failed")?,
        };

        match event {
            SessionEvent::Publish(publish) => log_publish(&publish, registry, out)?,
            SessionEvent::Malformed { frame, error } => {
                warn!(%error, "malformed MQTT frame");
                writeln!(out, "? {}", frame.escape_ascii()).context("failed to write output")?;
            }
            SessionEvent::Ignored(packet) => debug!(?packet, "ignored packet"),
            SessionEvent::Wake | SessionEvent::KeepaliveSent => {}
        }

        registry.refresh_due(api).await;
    }
}

fn log_publish(publish: &Publish, registry: &mut Registry, out: &mut impl Write) -> Result<()> {
    let now = unix_now();
    let topic = Topic::parse(&publish.topic);
    let device_id = topic.as_ref().and_then(Topic::device_id);
    let device = device_id.and_then(|id| {
        registry
            .device(&id)
            .map(|d| (d, registry.firmware_version(&id)))
    });
    let tz = device.map_or(Tz::UTC, |(d, _)| d.timezone);

    let header = render::publish_header(publish, topic.as_ref(), device);
    let Some(topic) = topic else {
        writeln!(out, "{header}\n  {}", publish.payload.escape_ascii())
            .context("failed to write output")?;
        return Ok(());
    };

    let result = interpret(&topic, &publish.payload, &registry.user.id);
    if let Err(e) = &result {
        debug!(topic = %publish.topic, "{e}");
    }
    let body = render::message_body(&result, &publish.payload, tz, now);
    writeln!(out, "{header}\n{body}").context("failed to write output")?;

    if let (Ok(m), Some(id)) = (&result, device_id)
        && matches!(m.message, DeviceMessage::Batch { .. })
        && registry.device(&id).is_some()
    {
        registry.schedule_refresh(id, m.timestamp, now);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use crate::api::testing::FakeApi;
    use crate::mqtt::testing::{ScriptedTransport, Step, frame};
    use crate::mqtt::{
        ConnAck, ConnectReturnCode, DEFAULT_KEEP_ALIVE, Packet, QoS, SubAck, SubscribeFilter,
        SubscribeReasonCode,
    };
    use crate::mysa::{Device, DeviceId, User};

    fn id() -> DeviceId {
        "aabbccddeeff".parse().unwrap()
    }

    fn registry() -> Registry {
        let user: User = serde_json::from_value(json!({"Id": "user-1"})).unwrap();
        let device: Device = serde_json::from_value(json!({
            "Id": "aabbccddeeff", "Name": "Living Room", "Model": "BB-V2-0-L",
        }))
        .unwrap();
        Registry::new(user, IndexMap::from([(id(), device)]), HashMap::new(), HashMap::new())
    }

    fn publish(subtopic: &str, payload: serde_json::Value) -> Step {
        frame(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: format!("/v1/dev/aabbccddeeff/{subtopic}"),
            pkid: 9,
            payload: Bytes::from(payload.to_string()),
        }))
    }

    async fn session(steps: Vec<Step>) -> Session<ScriptedTransport> {
        let mut script = vec![
            frame(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
            })),
            frame(Packet::SubAck(SubAck {
                pkid: 1,
                return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
            })),
        ];
        script.extend(steps);
        let mut session = Session::new(ScriptedTransport::new(script), DEFAULT_KEEP_ALIVE);
        session.connect("watch").await.unwrap();
        session
            .subscribe(vec![SubscribeFilter::new(
                "/v1/dev/aabbccddeeff/batch".into(),
                QoS::AtLeastOnce,
            )])
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn logs_publishes_until_transport_fails() {
        let mut session = session(vec![
            publish("batch", json!({
                "msg": 3, "ver": "1.0", "src": {"ref": "aabbccddeeff", "type": 1},
                "time": 1_700_000_000, "id": 1, "body": {"readings": "AAEC"},
            })),
            Step::Frame(Bytes::from_static(&[0xf0, 0x00])),
            Step::Fail,
        ])
        .await;
        let mut registry = registry();
        let api = FakeApi::default();
        let mut out = Vec::new();

        let result = watch(
            &mut session,
            &mut registry,
            &api,
            &mut out,
            std::future::pending(),
        )
        .await;

        assert!(result.is_err());
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("FROM <== Living Room QOS=1 (model"), "{out}");
        assert!(out.contains("Unknown-format device readings of length 0x0003:"), "{out}");
        // The batch is long past, so its refresh is due right away.
        assert_eq!(*api.state_requests.lock().unwrap(), vec![id()]);
        assert!(!registry.is_refresh_pending(&id()));
        assert!(session.transport().closed);
    }

    #[tokio::test]
    async fn stops_on_interrupt() {
        let mut session = session(vec![Step::Silence]).await;
        let mut registry = registry();

        let result = watch(
            &mut session,
            &mut registry,
            &FakeApi::default(),
            &mut Vec::new(),
            std::future::ready(()),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(session.transport().sent.last(), Some(&Packet::Disconnect));
    }
}
