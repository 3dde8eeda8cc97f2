use anyhow::{Context as _, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AwsCredentials;
use crate::message::Topic;
use crate::mqtt::{DEFAULT_KEEP_ALIVE, QoS, Session, SubscribeFilter, WsTransport};
use crate::mysa::DeviceId;
use crate::sigv4::{MqttEndpoint, presign_mqtt_url};

/// QoS 1 subscriptions to `subtopics` of every device.
pub fn device_filters(devices: &[DeviceId], subtopics: &[&str]) -> Vec<SubscribeFilter> {
    devices
        .iter()
        .flat_map(|id| {
            subtopics
                .iter()
                .map(move |sub| {
                    SubscribeFilter::new(Topic::for_device(*id, sub), QoS::AtLeastOnce)
                })
        })
        .collect()
}

/// Opens the MQTT-over-WebSocket connection and brings the session up to
/// the point where publishes flow.
pub async fn open_session(
    endpoint: &MqttEndpoint,
    credentials: &AwsCredentials,
    user_agent: &str,
    filters: Vec<SubscribeFilter>,
) -> Result<Session<WsTransport>> {
    let url = presign_mqtt_url(credentials, endpoint, Utc::now())?;
    let transport = WsTransport::connect(&url, &endpoint.origin()?, user_agent)
        .await
        .context("failed to connect to MQTT endpoint")?;

    let mut session = Session::new(transport, DEFAULT_KEEP_ALIVE);
    session
        .connect(&Uuid::new_v4().to_string())
        .await
        .context("MQTT connect failed")?;

    let count = filters.len();
    let refused = session
        .subscribe(filters)
        .await
        .context("MQTT subscribe failed")?;
    if !refused.is_empty() {
        warn!(refused = refused.len(), "some subscriptions were refused");
    }

    info!(subscriptions = count - refused.len(), "connected to MQTT endpoint");
    Ok(session)
}
