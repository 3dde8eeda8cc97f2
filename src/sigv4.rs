//! SigV4 query-string presigning of the MQTT WebSocket URL.
//!
//! The cloud expects the URL to be signed with the session token left out,
//! and the token appended after `X-Amz-Signature`. Signing it in the usual
//! way gets the upgrade rejected with 403.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac as _};
use sha2::{Digest as _, Sha256};

use crate::auth::AwsCredentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const EXPIRES_SECS: u32 = 3600;

#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    /// `https://{host}/mqtt`
    pub url: String,
    pub region: String,
    pub service: String,
}

impl MqttEndpoint {
    pub fn mysa() -> Self {
        Self {
            url: "https://a3q27gia9qg3zy-ats.iot.us-east-1.amazonaws.com/mqtt".to_owned(),
            region: "us-east-1".to_owned(),
            service: "iotdevicegateway".to_owned(),
        }
    }

    fn split(&self) -> Result<(&str, &str)> {
        let rest = self
            .url
            .strip_prefix("https://")
            .with_context(|| format!("MQTT endpoint {} is not https", self.url))?;
        Ok(rest.find('/').map_or((rest, "/"), |i| rest.split_at(i)))
    }

    pub fn host(&self) -> Result<&str> {
        Ok(self.split()?.0)
    }

    /// The endpoint without its path, sent as the WebSocket `Origin`.
    pub fn origin(&self) -> Result<String> {
        Ok(format!("https://{}", self.host()?))
    }
}

/// Returns the presigned `wss://` URL for `endpoint`, valid for an hour
/// from `now`.
pub fn presign_mqtt_url(
    credentials: &AwsCredentials,
    endpoint: &MqttEndpoint,
    now: DateTime<Utc>,
) -> Result<String> {
    let (host, path) = endpoint.split()?;
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!(
        "{date}/{}/{}/aws4_request",
        endpoint.region, endpoint.service
    );

    let mut params = [
        ("X-Amz-Algorithm", ALGORITHM.to_owned()),
        (
            "X-Amz-Credential",
            format!("{}/{scope}", credentials.access_key),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", EXPIRES_SECS.to_string()),
        ("X-Amz-SignedHeaders", "host".to_owned()),
    ];
    params.sort();
    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n{path}\n{canonical_query}\nhost:{host}\n\nhost\n{}",
        hex::encode(Sha256::digest(b""))
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let mut key = hmac(
        format!("AWS4{}", credentials.secret_key).as_bytes(),
        date.as_bytes(),
    );
    for part in [endpoint.region.as_str(), endpoint.service.as_str(), "aws4_request"] {
        key = hmac(&key, part.as_bytes());
    }
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    Ok(format!(
        "wss://{host}{path}?{canonical_query}&X-Amz-Signature={signature}&X-Amz-Security-Token={}",
        uri_encode(&credentials.session_token)
    ))
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 percent-encoding, leaving only unreserved characters as is.
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
