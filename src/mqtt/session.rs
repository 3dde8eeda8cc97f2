use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::mqtt::{
    Connect, ConnectReturnCode, MalformedPacket, Packet, PacketError, PubAck, Publish, QoS,
    Subscribe, SubscribeFilter, SubscribeReasonCode, Transport, TransportError, decode_frame,
    encode,
};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Pings allowed to go unanswered before the connection is declared dead.
const MAX_UNANSWERED_PINGS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Active,
    Closing,
    Closed,
    Faulted,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker refused the connection ({0:?})")]
    ConnectionRefused(ConnectReturnCode),

    #[error("expected {expected}, received {received:?}")]
    UnexpectedPacket {
        expected: &'static str,
        received: Box<Packet>,
    },

    #[error("no response to {0} consecutive keepalive pings")]
    KeepaliveExpired(u8),

    #[error("session is {actual:?}, operation requires {required:?}")]
    InvalidState {
        actual: SessionState,
        required: SessionState,
    },

    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
pub enum SessionEvent {
    /// An inbound publish, already acknowledged when it required it.
    Publish(Publish),
    /// The caller-supplied wake-up deadline passed with nothing received.
    Wake,
    KeepaliveSent,
    /// A frame that could not be parsed; the session stays usable.
    Malformed { frame: Bytes, error: PacketError },
    Ignored(Packet),
}

/// Client side of an MQTT 3.1.1 session over an already-established
/// [`Transport`].
pub struct Session<T> {
    transport: T,
    state: SessionState,
    keep_alive: Duration,
    last_sent: Instant,
    unanswered_pings: u8,
    next_packet_id: u16,
    pending: VecDeque<Result<Packet, MalformedPacket>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, keep_alive: Duration) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            keep_alive,
            last_sent: Instant::now(),
            unanswered_pings: 0,
            next_packet_id: 1,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Allocates the next packet identifier, skipping the reserved zero.
    pub fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    pub async fn connect(&mut self, client_id: &str) -> Result<(), SessionError> {
        self.require(SessionState::Disconnected)?;
        self.state = SessionState::Connecting;

        let mut connect = Connect::new(client_id);
        connect.keep_alive = self.keep_alive.as_secs().min(u16::MAX as u64) as u16;
        self.send(&Packet::Connect(connect)).await?;

        let result = match self.recv_handshake().await? {
            Packet::ConnAck(c) if matches!(c.code, ConnectReturnCode::Success) => Ok(()),
            Packet::ConnAck(c) => Err(SessionError::ConnectionRefused(c.code)),
            other => Err(SessionError::UnexpectedPacket {
                expected: "CONNACK",
                received: Box::new(other),
            }),
        };

        self.state = match result {
            Ok(()) => SessionState::Connected,
            Err(_) => SessionState::Faulted,
        };
        result
    }

    /// Subscribes to every filter with one SUBSCRIBE and waits for its
    /// SUBACK. Returns the filters the broker refused; refusal is not fatal.
    pub async fn subscribe(
        &mut self,
        filters: Vec<SubscribeFilter>,
    ) -> Result<Vec<String>, SessionError> {
        self.require(SessionState::Connected)?;
        self.state = SessionState::Subscribing;

        let pkid = self.next_packet_id();
        let subscribe = Subscribe { pkid, filters };
        self.send(&Packet::Subscribe(subscribe.clone())).await?;

        let suback = loop {
            match self.recv_handshake().await? {
                Packet::SubAck(s) if s.pkid == pkid => break s,
                Packet::PingResp => {}
                other => {
                    debug!(?other, "queueing packet received before SUBACK");
                    self.pending.push_back(Ok(other));
                }
            }
        };

        let codes = suback
            .return_codes
            .into_iter()
            .chain(std::iter::repeat(SubscribeReasonCode::Failure));
        let refused: Vec<String> = subscribe
            .filters
            .into_iter()
            .zip(codes)
            .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
            .map(|(filter, _)| filter.path)
            .collect();
        for filter in &refused {
            warn!(%filter, "broker refused subscription");
        }

        self.state = SessionState::Active;
        Ok(refused)
    }

    /// Waits for the next thing worth reporting: an inbound publish, a
    /// keepalive ping, or `wake_at` passing. Keepalive is due at
    /// `last_sent + keep_alive`.
    pub async fn next_event(
        &mut self,
        wake_at: Option<Instant>,
    ) -> Result<SessionEvent, SessionError> {
        self.require(SessionState::Active)?;

        loop {
            match self.pending.pop_front() {
                Some(Ok(packet)) => match self.handle(packet).await? {
                    Some(event) => return Ok(event),
                    None => continue,
                },
                Some(Err(MalformedPacket { bytes, error })) => {
                    return Ok(SessionEvent::Malformed { frame: bytes, error });
                }
                None => {}
            }

            let keepalive_at = self.last_sent + self.keep_alive;
            let deadline = wake_at.map_or(keepalive_at, |w| w.min(keepalive_at));
            let timeout = deadline.saturating_duration_since(Instant::now());

            match self.transport.recv(timeout).await {
                Ok(frame) => {
                    self.unanswered_pings = 0;
                    self.pending.extend(decode_frame(&frame));
                }
                Err(TransportError::Timeout) if Instant::now() >= keepalive_at => {
                    if self.unanswered_pings >= MAX_UNANSWERED_PINGS {
                        self.state = SessionState::Faulted;
                        return Err(SessionError::KeepaliveExpired(self.unanswered_pings));
                    }
                    self.send(&Packet::PingReq).await?;
                    self.unanswered_pings += 1;
                    debug!(unanswered = self.unanswered_pings, "sent PINGREQ");
                    return Ok(SessionEvent::KeepaliveSent);
                }
                Err(TransportError::Timeout) => return Ok(SessionEvent::Wake),
                Err(e) => {
                    self.state = SessionState::Faulted;
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn publish(&mut self, publish: Publish) -> Result<(), SessionError> {
        self.require(SessionState::Active)?;
        self.send(&Packet::Publish(publish)).await
    }

    /// Attempts a graceful shutdown. A faulted session stays faulted but
    /// still gets its transport closed.
    pub async fn close(&mut self) {
        if self.state != SessionState::Faulted {
            self.state = SessionState::Closing;
            if let Err(e) = self.send(&Packet::Disconnect).await {
                debug!(error = %e, "failed to send DISCONNECT");
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "failed to close transport");
        }

        if self.state == SessionState::Closing {
            self.state = SessionState::Closed;
        }
    }

    async fn handle(&mut self, packet: Packet) -> Result<Option<SessionEvent>, SessionError> {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    self.send(&Packet::PubAck(PubAck { pkid: publish.pkid })).await?;
                }
                Ok(Some(SessionEvent::Publish(publish)))
            }
            Packet::PingResp => Ok(None),
            other => {
                debug!(?other, "ignoring unexpected packet");
                Ok(Some(SessionEvent::Ignored(other)))
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        debug!(?packet, "sending packet");
        let frame = encode(packet)?;
        if let Err(e) = self.transport.send(frame).await {
            self.state = SessionState::Faulted;
            return Err(e.into());
        }
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Receives one packet while the handshake is in progress; any failure
    /// here faults the session.
    async fn recv_handshake(&mut self) -> Result<Packet, SessionError> {
        loop {
            let error: SessionError = match self.pending.pop_front() {
                Some(Ok(packet)) => return Ok(packet),
                Some(Err(malformed)) => malformed.error.into(),
                None => match self.transport.recv(self.keep_alive).await {
                    Ok(frame) => {
                        self.pending.extend(decode_frame(&frame));
                        continue;
                    }
                    Err(e) => e.into(),
                },
            };
            self.state = SessionState::Faulted;
            return Err(error);
        }
    }

    fn require(&self, required: SessionState) -> Result<(), SessionError> {
        if self.state != required {
            return Err(SessionError::InvalidState {
                actual: self.state,
                required,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{ScriptedTransport, Step, frame};
    use crate::mqtt::{ConnAck, SubAck};

    fn connack(code: ConnectReturnCode) -> Step {
        frame(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
    }

    fn suback(return_codes: Vec<SubscribeReasonCode>) -> Step {
        frame(Packet::SubAck(SubAck {
            pkid: 1,
            return_codes,
        }))
    }

    fn filters() -> Vec<SubscribeFilter> {
        vec![
            SubscribeFilter::new("/v1/dev/aabbccddeeff/in".into(), QoS::AtLeastOnce),
            SubscribeFilter::new("/v1/dev/aabbccddeeff/out".into(), QoS::AtLeastOnce),
        ]
    }

    async fn active(rest: Vec<Step>) -> Session<ScriptedTransport> {
        let mut steps = vec![
            connack(ConnectReturnCode::Success),
            suback(vec![SubscribeReasonCode::Success(QoS::AtLeastOnce); 2]),
        ];
        steps.extend(rest);
        let mut session = Session::new(ScriptedTransport::new(steps), DEFAULT_KEEP_ALIVE);
        session.connect("client").await.unwrap();
        session.subscribe(filters()).await.unwrap();
        session
    }

    fn publish(pkid: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos: if pkid.is_some() { QoS::AtLeastOnce } else { QoS::AtMostOnce },
            retain: false,
            topic: "/v1/dev/aabbccddeeff/out".into(),
            pkid: pkid.unwrap_or(0),
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn connects_and_subscribes() {
        let session = active(vec![]).await;

        assert_eq!(session.state(), SessionState::Active);
        let sent = &session.transport().sent;
        assert!(matches!(&sent[0], Packet::Connect(c) if c.keep_alive == 60));
        assert!(matches!(&sent[1], Packet::Subscribe(s) if s.pkid == 1 && s.filters.len() == 2));
    }

    #[tokio::test]
    async fn refused_connack_faults_without_subscribing() {
        let mut session = Session::new(
            ScriptedTransport::new([connack(ConnectReturnCode::NotAuthorized)]),
            DEFAULT_KEEP_ALIVE,
        );

        let err = session.connect("client").await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(session.subscribe(filters()).await.is_err());
        assert_eq!(
            session.transport().count_sent(|p| matches!(p, Packet::Subscribe(_))),
            0
        );
    }

    #[tokio::test]
    async fn malformed_handshake_reply_faults() {
        let mut session = Session::new(
            ScriptedTransport::new([Step::Frame(Bytes::from_static(&[0xf0, 0x00]))]),
            DEFAULT_KEEP_ALIVE,
        );

        let err = session.connect("client").await.unwrap_err();

        assert!(matches!(err, SessionError::Packet(_)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn refused_subscription_is_not_fatal() {
        let mut session = Session::new(
            ScriptedTransport::new([
                connack(ConnectReturnCode::Success),
                suback(vec![
                    SubscribeReasonCode::Success(QoS::AtLeastOnce),
                    SubscribeReasonCode::Failure,
                ]),
            ]),
            DEFAULT_KEEP_ALIVE,
        );
        session.connect("client").await.unwrap();

        let refused = session.subscribe(filters()).await.unwrap();

        assert_eq!(refused, vec!["/v1/dev/aabbccddeeff/out".to_string()]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn acknowledges_qos1_publish() {
        let mut session = active(vec![
            frame(Packet::PingResp),
            frame(Packet::Publish(publish(Some(42)))),
        ])
        .await;

        let event = session.next_event(None).await.unwrap();

        assert!(matches!(event, SessionEvent::Publish(p) if p.pkid == 42));
        assert_eq!(
            session.transport().sent.last(),
            Some(&Packet::PubAck(PubAck { pkid: 42 }))
        );
    }

    #[tokio::test]
    async fn qos0_publish_is_not_acknowledged() {
        let mut session = active(vec![frame(Packet::Publish(publish(None)))]).await;

        session.next_event(None).await.unwrap();

        assert_eq!(
            session.transport().count_sent(|p| matches!(p, Packet::PubAck(_))),
            0
        );
    }

    #[tokio::test]
    async fn acknowledges_publish_ahead_of_malformed_packet() {
        let mut bytes = encode(&Packet::Publish(publish(Some(42)))).unwrap().to_vec();
        bytes.extend_from_slice(&[0xf0, 0x00]);
        let mut session = active(vec![Step::Frame(Bytes::from(bytes))]).await;

        let first = session.next_event(None).await.unwrap();
        let second = session.next_event(None).await.unwrap();

        assert!(matches!(first, SessionEvent::Publish(p) if p.pkid == 42));
        assert_eq!(
            session
                .transport()
                .count_sent(|p| matches!(p, Packet::PubAck(a) if a.pkid == 42)),
            1
        );
        assert!(matches!(
            second,
            SessionEvent::Malformed { frame, .. } if frame == Bytes::from_static(&[0xf0, 0x00])
        ));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_interval_sends_exactly_one_ping() {
        let mut session = active(vec![Step::Silence]).await;

        let event = session.next_event(None).await.unwrap();

        assert!(matches!(event, SessionEvent::KeepaliveSent));
        assert_eq!(
            session.transport().count_sent(|p| matches!(p, Packet::PingReq)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sending_resets_keepalive_deadline() {
        let mut session = active(vec![Step::Silence]).await;
        let start = Instant::now();

        tokio::time::advance(Duration::from_secs(30)).await;
        session.publish(publish(None)).await.unwrap();
        session.next_event(None).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn two_unanswered_pings_fault_the_session() {
        let mut session = active(vec![Step::Silence, Step::Silence, Step::Silence]).await;

        assert!(matches!(session.next_event(None).await, Ok(SessionEvent::KeepaliveSent)));
        assert!(matches!(session.next_event(None).await, Ok(SessionEvent::KeepaliveSent)));
        let err = session.next_event(None).await.unwrap_err();

        assert!(matches!(err, SessionError::KeepaliveExpired(2)));
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(
            session.transport().count_sent(|p| matches!(p, Packet::PingReq)),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_wake_deadline_does_not_ping() {
        let mut session = active(vec![Step::Silence]).await;
        let wake_at = Instant::now() + Duration::from_secs(10);

        let event = session.next_event(Some(wake_at)).await.unwrap();

        assert!(matches!(event, SessionEvent::Wake));
        assert_eq!(
            session.transport().count_sent(|p| matches!(p, Packet::PingReq)),
            0
        );
    }

    #[tokio::test]
    async fn malformed_frame_keeps_session_active() {
        let mut session = active(vec![Step::Frame(Bytes::from_static(&[0xf0, 0x00]))]).await;

        let event = session.next_event(None).await.unwrap();

        assert!(matches!(event, SessionEvent::Malformed { .. }));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn close_sends_disconnect() {
        let mut session = active(vec![]).await;

        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.transport().sent.last(), Some(&Packet::Disconnect));
        assert!(session.transport().closed);
    }
}
