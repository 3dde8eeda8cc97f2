use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{
    ACCEPT_ENCODING, ORIGIN, SEC_WEBSOCKET_PROTOCOL, USER_AGENT,
};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

pub const SUBPROTOCOL: &str = "mqtt";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

/// A message-oriented duplex connection carrying whole MQTT packets.
pub trait Transport {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits at most `timeout` for the next frame, failing with
    /// [`TransportError::Timeout`] when nothing arrived in time.
    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Upgrades `url` (already signed) to a WebSocket speaking the `mqtt`
    /// subprotocol. The server answers 426 when the subprotocol header is
    /// missing, so its absence in the response is treated as a failure too.
    pub async fn connect(url: &str, origin: &str, user_agent: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .context("failed to build WebSocket request")?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        headers.insert(ORIGIN, HeaderValue::from_str(origin).context("invalid origin")?);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).context("invalid user agent")?,
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let (stream, response) = connect_async(request)
            .await
            .context("failed to open WebSocket connection")?;

        match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(v) if v == SUBPROTOCOL => {}
            other => bail!("WebSocket upgrade did not accept the {SUBPROTOCOL} subprotocol: {other:?}"),
        }

        debug!(status = %response.status(), "WebSocket connected");
        Ok(Self { stream })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.stream.send(Message::Binary(frame.to_vec())).await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(message)) => message?,
            };

            match message {
                Message::Binary(data) => return Ok(Bytes::from(data)),
                Message::Text(text) => return Ok(Bytes::from(text.into_bytes())),
                Message::Close(frame) => {
                    debug!(?frame, "WebSocket closed by server");
                    return Err(TransportError::Closed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
