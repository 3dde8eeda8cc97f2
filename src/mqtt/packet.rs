use bytes::{Bytes, BytesMut};

pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, SubAck, Subscribe,
    SubscribeFilter, SubscribeReasonCode,
};
pub use rumqttc::mqttbytes::{Error as PacketError, QoS};

/// Largest packet accepted in either direction; the broker caps payloads at
/// 128 KiB.
pub const MAX_PACKET_SIZE: usize = 128 * 1024;

/// The undecodable tail of a frame, starting at the packet that failed.
#[derive(Debug)]
pub struct MalformedPacket {
    pub bytes: Bytes,
    pub error: PacketError,
}

pub fn encode(packet: &Packet) -> Result<Bytes, PacketError> {
    let mut buf = BytesMut::new();
    packet.write(&mut buf, MAX_PACKET_SIZE)?;
    Ok(buf.freeze())
}

/// Decodes every packet contained in one transport frame, in order.
///
/// Packets ahead of a malformed one are still returned. Decoding stops at the
/// first failure since the length of anything after it cannot be trusted.
pub fn decode_frame(frame: &Bytes) -> Vec<Result<Packet, MalformedPacket>> {
    let mut buf = BytesMut::from(frame.as_ref());
    let mut packets = Vec::new();
    while !buf.is_empty() {
        let offset = frame.len() - buf.len();
        match Packet::read(&mut buf, MAX_PACKET_SIZE) {
            Ok(packet) => packets.push(Ok(packet)),
            Err(error) => {
                packets.push(Err(MalformedPacket {
                    bytes: frame.slice(offset..),
                    error,
                }));
                break;
            }
        }
    }
    packets
}
