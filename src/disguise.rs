//! Makes a Mysa Lite (BB-V2-0-L) look like a Baseboard V1 (BB-V1-1) to the
//! official apps, which unlocks zone control, the usage graph and the
//! humidity display for it.
//!
//! While disguised, the apps send setpoint commands shaped for the V1. They
//! are caught on the device's `in` topic and re-published in the form the
//! Lite firmware understands.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use futures_util::FutureExt as _;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::api::MysaApi;
use crate::message::{Subtopic, Topic};
use crate::mqtt::{Publish, QoS, Session, SessionEvent, Transport};
use crate::mysa::{DeviceId, DeviceModel, User};

pub const REAL_MODEL: DeviceModel = DeviceModel::BaseboardV2Lite;
pub const DISGUISE_MODEL: DeviceModel = DeviceModel::BaseboardV1;
pub const TESTED_FIRMWARE: &str = "3.16.2.3";

/// Devices to disguise: `requested` if given, otherwise every Lite on the
/// account. Models come from the pairing records, which keep the real model
/// while a disguise is active.
pub fn eligible_devices(user: &User, requested: Option<DeviceId>) -> Result<Vec<DeviceId>> {
    let mut lites: Vec<DeviceId> = user
        .real_models()
        .filter(|(_, model)| *model == REAL_MODEL.as_str())
        .map(|(id, _)| id)
        .collect();
    lites.sort();

    match requested {
        Some(id) => match user.real_models().find(|(other, _)| *other == id) {
            None => bail!("Mysa thermostat with ID (MAC address) {id} not found in your account"),
            Some((_, model)) if model != REAL_MODEL.as_str() => bail!(
                "Mysa thermostat {id} is model {model}, not {}; disguising is not applicable to it",
                REAL_MODEL.as_str()
            ),
            Some(_) => Ok(vec![id]),
        },
        None if lites.is_empty() => bail!(
            "no Mysa thermostats with model {} found in your account",
            REAL_MODEL.as_str()
        ),
        None => Ok(lites),
    }
}

/// Warning to show when the firmware has not been tried with the disguise.
pub fn firmware_warning(id: DeviceId, version: Option<&str>) -> Option<String> {
    match version {
        None => Some(format!(
            "WARNING: Mysa thermostat {id} has an unknown firmware version. This might not work."
        )),
        Some(v) if v != TESTED_FIRMWARE => Some(format!(
            "WARNING: Mysa thermostat {id} is on firmware version {v}. This has only been tested with v{TESTED_FIRMWARE}."
        )),
        Some(_) => None,
    }
}

/// Translates a setpoint command aimed at a disguised device into the form
/// the real firmware expects. Returns `None` for anything else, including
/// commands already translated. The returned publish has no packet id yet.
pub fn rewrite_command(publish: &Publish, disguised: &[DeviceId], now_ms: u64) -> Option<Publish> {
    let topic = Topic::parse(&publish.topic)?;
    let device = topic.device_id()?;
    if topic.subtopic != Subtopic::In || !disguised.contains(&device) {
        return None;
    }

    let mut payload: Value = serde_json::from_slice(&publish.payload).ok()?;
    if payload.get("msg") != Some(&json!(44))
        || payload.get("ver") != Some(&json!("1.0"))
        || payload.get("resp") != Some(&json!(2))
        || payload.get("dest") != Some(&json!({"ref": topic.device, "type": 1}))
    {
        return None;
    }

    let body = payload.get_mut("body")?.as_object_mut()?;
    if body.get("ver") != Some(&json!(1)) {
        return None;
    }
    let from = DISGUISE_MODEL.command_type();
    let to = REAL_MODEL.command_type();
    match body.get("type").and_then(Value::as_u64) {
        Some(t) if t == from => {}
        Some(t) if t == to => {
            debug!(%device, "skipping our own translated command");
            return None;
        }
        _ => return None,
    }
    body.insert("type".to_owned(), json!(to));

    let secs = now_ms / 1000;
    payload["id"] = json!(now_ms);
    payload["time"] = json!(secs);
    payload["timestamp"] = json!(secs);

    Some(Publish {
        dup: publish.dup,
        qos: publish.qos,
        retain: publish.retain,
        topic: publish.topic.clone(),
        pkid: 0,
        payload: Bytes::from(payload.to_string()),
    })
}

/// Puts the disguise on `devices`, runs `body`, then takes the disguise off
/// again however `body` ended (error or panic included). A failure to
/// restore is logged and never replaces the outcome of `body`.
///
/// `interrupt` is watched while the disguise goes on and then handed to
/// `body`. If it completes early, applying stops and the devices are
/// restored without running `body`. Should the returned future be dropped
/// before it finishes, restoring continues on a spawned task.
pub async fn with_disguise<A, I, B, F, T>(
    api: &A,
    devices: &[DeviceId],
    max_current: Option<f64>,
    mut interrupt: I,
    body: B,
) -> Result<T>
where
    A: MysaApi + Clone + Send + Sync + 'static,
    I: Future<Output = ()> + Unpin,
    B: FnOnce(I) -> F,
    F: Future<Output = Result<T>>,
{
    let guard = RestoreGuard {
        pending: Some((api.clone(), devices.to_vec())),
    };

    let applied = tokio::select! {
        biased;
        () = &mut interrupt => Err(anyhow!("interrupted while disguising devices")),
        result = apply(api, devices, max_current) => result,
    };
    let outcome = match applied {
        Ok(()) => AssertUnwindSafe(body(interrupt)).catch_unwind().await,
        Err(e) => Ok(Err(e)),
    };

    restore(api, devices).await;
    guard.disarm();

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Restores the devices from a spawned task if dropped while still armed.
struct RestoreGuard<A: MysaApi + Send + Sync + 'static> {
    pending: Option<(A, Vec<DeviceId>)>,
}

impl<A: MysaApi + Send + Sync + 'static> RestoreGuard<A> {
    fn disarm(mut self) {
        self.pending = None;
    }
}

impl<A: MysaApi + Send + Sync + 'static> Drop for RestoreGuard<A> {
    fn drop(&mut self) {
        let Some((api, devices)) = self.pending.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(?devices, "disguise abandoned, restoring devices in the background");
                handle.spawn(async move { restore(&api, &devices).await });
            }
            Err(_) => error!(?devices, "no runtime left to restore device models"),
        }
    }
}

async fn apply(api: &impl MysaApi, devices: &[DeviceId], max_current: Option<f64>) -> Result<()> {
    for id in devices {
        api.set_model(*id, DISGUISE_MODEL, max_current).await?;
        info!(%id, model = DISGUISE_MODEL.as_str(), "disguised device");
    }
    Ok(())
}

/// Sets every device back to its real model.
pub async fn restore(api: &impl MysaApi, devices: &[DeviceId]) {
    for id in devices {
        match api.set_model(*id, REAL_MODEL, None).await {
            Ok(()) => info!(%id, model = REAL_MODEL.as_str(), "restored device"),
            Err(e) => error!(%id, "failed to restore device model: {e:#}"),
        }
    }
}

/// Translates commands until `interrupt` completes or the session fails.
pub async fn translate_commands<T: Transport>(
    session: &mut Session<T>,
    devices: &[DeviceId],
    interrupt: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(interrupt);

    loop {
        let event = tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted");
                return Ok(());
            }
            event = session.next_event(None) => event?,
        };

        let SessionEvent::Publish(publish) = event else {
            continue;
        };
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if let Some(mut rewritten) = rewrite_command(&publish, devices, now_ms) {
            if rewritten.qos != QoS::AtMostOnce {
                rewritten.pkid = session.next_packet_id();
            }
            debug!(topic = %rewritten.topic, "re-publishing translated command");
            session.publish(rewritten).await?;
        }
    }
}
